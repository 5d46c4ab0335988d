//! HTTP handlers over the vote service.
//!
//! Internal routes (`/internal/vote/...`) are only reachable by other
//! services; external routes (`/system/vote...`) pass through the gateway,
//! which authenticates the user and forwards the id in the
//! `X-Request-User` header.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

use rocket::http::{ContentType, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::State;

use pollstation::{CountState, StopResult, VoteError, VoteService};

pub struct App {
    pub service: VoteService,
    pub long_poll: Duration,
}

/// The authenticated user behind an external request.
pub struct RequestUser(pub i32);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, ()> {
        match req
            .headers()
            .get_one("X-Request-User")
            .and_then(|value| value.parse().ok())
        {
            Some(user_id) if user_id != 0 => Outcome::Success(RequestUser(user_id)),
            _ => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

pub struct ApiError(pub VoteError);

impl From<VoteError> for ApiError {
    fn from(err: VoteError) -> ApiError {
        ApiError(err)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let status = match &self.0 {
            VoteError::Internal(_) => Status::InternalServerError,
            _ => Status::BadRequest,
        };
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        })
        .to_string();
        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

#[derive(Serialize)]
pub struct StartResponse {
    #[serde(with = "pollstation::serde_base64::option")]
    public_key: Option<Vec<u8>>,
    #[serde(with = "pollstation::serde_base64::option")]
    public_key_sig: Option<Vec<u8>>,
}

#[post("/internal/vote/start?<id>")]
pub async fn start(app: &State<App>, id: i32) -> Result<Json<StartResponse>, ApiError> {
    let poll_key = app.service.start(id).await?;
    let (public_key, public_key_sig) = match poll_key {
        Some(key) => (Some(key.public_key), Some(key.signature)),
        None => (None, None),
    };
    Ok(Json(StartResponse {
        public_key,
        public_key_sig,
    }))
}

#[post("/internal/vote/stop?<id>")]
pub async fn stop(app: &State<App>, id: i32) -> Result<Json<StopResult>, ApiError> {
    Ok(Json(app.service.stop(id).await?))
}

#[post("/internal/vote/clear?<id>")]
pub async fn clear(app: &State<App>, id: i32) -> Result<(), ApiError> {
    Ok(app.service.clear(id).await?)
}

#[post("/internal/vote/clear_all")]
pub async fn clear_all(app: &State<App>) -> Result<(), ApiError> {
    Ok(app.service.clear_all().await?)
}

#[post("/system/vote?<id>", data = "<body>")]
pub async fn vote(
    app: &State<App>,
    user: RequestUser,
    id: i32,
    body: Vec<u8>,
) -> Result<(), ApiError> {
    Ok(app.service.vote(id, user.0, &body).await?)
}

#[get("/system/vote/voted?<ids>")]
pub async fn voted(
    app: &State<App>,
    user: RequestUser,
    ids: &str,
) -> Result<Json<BTreeMap<i32, Vec<i32>>>, ApiError> {
    let poll_ids = ids
        .split(',')
        .map(|id| id.trim().parse())
        .collect::<Result<Vec<i32>, _>>()
        .map_err(|_| {
            ApiError(VoteError::Invalid(format!(
                "ids invalid. Expected a comma separated int list, got {}",
                ids
            )))
        })?;
    Ok(Json(app.service.voted_polls(&poll_ids, user.0).await?))
}

#[get("/internal/vote/vote_count?<id>")]
pub async fn vote_count(app: &State<App>, id: Option<u64>) -> Result<Json<CountState>, ApiError> {
    match id {
        Some(id) => {
            match tokio::time::timeout(app.long_poll, app.service.vote_count(id, true)).await {
                Ok(state) => Ok(Json(state?)),
                Err(_) => Err(ApiError(VoteError::Internal(
                    "deadline exceeded".to_string(),
                ))),
            }
        }
        None => Ok(Json(app.service.vote_count(0, false).await?)),
    }
}

#[get("/system/vote/health")]
pub fn health() -> (ContentType, &'static str) {
    (ContentType::JSON, r#"{"health":true}"#)
}
