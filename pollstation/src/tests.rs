use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use ed25519_dalek::{Signature, Verifier};

use crate::backends::MemoryBackend;
use crate::config::{MeetingConfig, MemoryConfig, UserConfig};
use crate::crypto::{self, MainKey};
use crate::decrypt::Decrypt;
use crate::keystore::MemoryKeyStore;
use crate::poll::{BackendSelector, PollConfig, PollKind, PollMethod, PollState};
use crate::{StopResult, VoteError, VoteService};

struct Fixture {
    service: VoteService,
    config: Arc<MemoryConfig>,
    main_public: ed25519_dalek::PublicKey,
}

fn fixture() -> Fixture {
    let config = Arc::new(MemoryConfig::new("https://assembly.example.com"));
    let main_key = MainKey::generate();
    let main_public = main_key.public_key();
    let decrypter = Decrypt::new(main_key, Box::new(MemoryKeyStore::default()));
    let service = VoteService::new(
        Box::new(MemoryBackend::default()),
        Box::new(MemoryBackend::default()),
        config.clone(),
        Some(Arc::new(decrypter)),
    );
    Fixture {
        service,
        config,
        main_public,
    }
}

fn poll_config(id: i32, kind: PollKind) -> PollConfig {
    PollConfig {
        id,
        meeting_id: 5,
        backend: BackendSelector::Fast,
        kind,
        method: PollMethod::Y,
        entitled_group_ids: vec![1],
        global_yes: true,
        global_no: false,
        global_abstain: false,
        min_amount: 0,
        max_amount: 0,
        max_votes_per_option: 0,
        option_ids: vec![1],
        state: PollState::Started,
    }
}

fn present_user(id: i32) -> UserConfig {
    UserConfig {
        id,
        group_ids: vec![1],
        present_in_meetings: vec![5],
        ..UserConfig::default()
    }
}

fn stop_json(result: &StopResult) -> serde_json::Value {
    serde_json::from_str(&serde_json::to_string(result).unwrap()).unwrap()
}

#[tokio::test]
async fn named_poll_happy_path() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.add_meeting(MeetingConfig {
        id: 5,
        ..MeetingConfig::default()
    });
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    assert!(fx.service.start(1).await.unwrap().is_none());
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();

    let result = fx.service.stop(1).await.unwrap();
    assert_eq!(
        stop_json(&result),
        serde_json::json!({
            "votes": [{
                "request_user_id": 1,
                "vote_user_id": 1,
                "value": "Y",
                "weight": "1.000000",
            }],
            "user_ids": [1],
        })
    );
}

#[tokio::test]
async fn second_vote_is_rejected() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    fx.service.start(1).await.unwrap();
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();

    let err = fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::DoubleVote));
}

#[tokio::test]
async fn vote_on_a_stopped_poll() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    fx.service.start(1).await.unwrap();
    fx.service.stop(1).await.unwrap();

    let err = fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::Stopped));
}

#[tokio::test]
async fn start_is_a_noop_on_a_stopped_poll() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    fx.service.start(1).await.unwrap();
    fx.service.stop(1).await.unwrap();
    fx.service.start(1).await.unwrap();

    let err = fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::Stopped));
}

#[tokio::test]
async fn delegated_vote() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.add_meeting(MeetingConfig {
        id: 5,
        enable_vote_weight: false,
        enable_vote_delegations: true,
    });
    fx.config.set_group(1, vec![2]);
    // user 1 is present but in no entitled group; it receives user 2's vote
    fx.config.add_user(
        5,
        UserConfig {
            id: 1,
            present_in_meetings: vec![5],
            ..UserConfig::default()
        },
    );
    fx.config.add_user(
        5,
        UserConfig {
            vote_delegated_to: Some(1),
            ..present_user(2)
        },
    );

    fx.service.start(1).await.unwrap();
    fx.service
        .vote(1, 1, br#"{"user_id":2,"value":"Y"}"#)
        .await
        .unwrap();

    let result = fx.service.stop(1).await.unwrap();
    let value = stop_json(&result);
    assert_eq!(value["user_ids"], serde_json::json!([2]));
    assert_eq!(value["votes"][0]["request_user_id"], 1);
    assert_eq!(value["votes"][0]["vote_user_id"], 2);
}

#[tokio::test]
async fn delegation_rules_are_enforced() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.add_meeting(MeetingConfig {
        id: 5,
        enable_vote_weight: false,
        enable_vote_delegations: false,
    });
    fx.config.set_group(1, vec![1, 2]);
    fx.config.add_user(5, present_user(1));
    fx.config.add_user(5, present_user(2));

    fx.service.start(1).await.unwrap();

    // delegations are disabled for the meeting
    let err = fx
        .service
        .vote(1, 1, br#"{"user_id":2,"value":"Y"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::NotAllowed(_)));

    // user 2 did not delegate to user 1
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.add_meeting(MeetingConfig {
        id: 5,
        enable_vote_weight: false,
        enable_vote_delegations: true,
    });
    fx.config.set_group(1, vec![1, 2]);
    fx.config.add_user(5, present_user(1));
    fx.config.add_user(
        5,
        UserConfig {
            vote_delegated_to: Some(3),
            ..present_user(2)
        },
    );
    fx.service.start(1).await.unwrap();
    let err = fx
        .service
        .vote(1, 1, br#"{"user_id":2,"value":"Y"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::NotAllowed(_)));
}

#[tokio::test]
async fn access_rules_are_enforced() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.set_group(1, vec![1, 3]);
    fx.config.add_user(5, present_user(1));
    // user 3 is entitled but absent
    fx.config.add_user(
        5,
        UserConfig {
            id: 3,
            group_ids: vec![1],
            ..UserConfig::default()
        },
    );

    fx.service.start(1).await.unwrap();

    // request user not present in the meeting
    let err = fx.service.vote(1, 3, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::NotAllowed(_)));

    // unknown users are not covered by the preload
    let err = fx.service.vote(1, 99, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::NotAllowed(_)));

    // anonymous vote user
    let err = fx
        .service
        .vote(1, 1, br#"{"user_id":0,"value":"Y"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::NotAllowed(_)));

    // ballot format failures are user visible
    let err = fx.service.vote(1, 1, br#"{"value":"N"}"#).await.unwrap_err();
    match err {
        VoteError::Invalid(reason) => assert_eq!(reason, "Global vote N is not enabled"),
        other => panic!("expected invalid, got {:?}", other),
    }
}

#[tokio::test]
async fn weight_override() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.add_meeting(MeetingConfig {
        id: 5,
        enable_vote_weight: true,
        enable_vote_delegations: false,
    });
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(
        5,
        UserConfig {
            vote_weight: Some("3.000000".to_string()),
            default_vote_weight: Some("2.000000".to_string()),
            ..present_user(1)
        },
    );

    fx.service.start(1).await.unwrap();
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();

    let result = fx.service.stop(1).await.unwrap();
    assert_eq!(stop_json(&result)["votes"][0]["weight"], "3.000000");
}

#[tokio::test]
async fn pseudoanonymous_ballots_drop_the_user_ids() {
    let fx = fixture();
    fx.config
        .add_poll(poll_config(1, PollKind::Pseudoanonymous));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    fx.service.start(1).await.unwrap();
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();

    let result = fx.service.stop(1).await.unwrap();
    assert_eq!(
        stop_json(&result)["votes"][0],
        serde_json::json!({"value": "Y", "weight": "1.000000"})
    );
    // the backend still knows who voted
    assert_eq!(stop_json(&result)["user_ids"], serde_json::json!([1]));
}

#[tokio::test]
async fn analog_polls_can_not_be_started() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Analog));

    let err = fx.service.start(1).await.unwrap_err();
    assert!(matches!(err, VoteError::Invalid(_)));
}

#[tokio::test]
async fn unknown_poll() {
    let fx = fixture();
    assert!(matches!(
        fx.service.start(404).await.unwrap_err(),
        VoteError::NotExists
    ));
    assert!(matches!(
        fx.service.stop(404).await.unwrap_err(),
        VoteError::NotExists
    ));
}

#[tokio::test]
async fn vote_before_start() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    let err = fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::NotExists));
}

#[tokio::test]
async fn vote_path_stays_off_the_config_store() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.add_meeting(MeetingConfig {
        id: 5,
        enable_vote_weight: true,
        enable_vote_delegations: true,
    });
    fx.config.set_group(1, vec![1, 2]);
    fx.config.add_user(5, present_user(1));
    fx.config.add_user(
        5,
        UserConfig {
            vote_delegated_to: Some(1),
            vote_weight: Some("2.000000".to_string()),
            ..present_user(2)
        },
    );

    fx.service.start(1).await.unwrap();
    let requests_after_start = fx.config.request_count();

    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();
    fx.service
        .vote(1, 1, br#"{"user_id":2,"value":"Y"}"#)
        .await
        .unwrap();
    let err = fx.service.vote(1, 99, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::NotAllowed(_)));

    assert_eq!(fx.config.request_count(), requests_after_start);
}

#[tokio::test]
async fn clear_allows_a_fresh_poll() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    fx.service.start(1).await.unwrap();
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();
    fx.service.stop(1).await.unwrap();

    fx.service.clear(1).await.unwrap();

    fx.service.start(1).await.unwrap();
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();
    let result = fx.service.stop(1).await.unwrap();
    assert_eq!(stop_json(&result)["user_ids"], serde_json::json!([1]));
}

#[tokio::test]
async fn voted_polls_covers_the_delegation_circle() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.add_poll(PollConfig {
        backend: BackendSelector::Long,
        ..poll_config(2, PollKind::Named)
    });
    fx.config.add_meeting(MeetingConfig {
        id: 5,
        enable_vote_weight: false,
        enable_vote_delegations: true,
    });
    fx.config.set_group(1, vec![1, 2]);
    fx.config.add_user(5, present_user(1));
    fx.config.add_user(
        5,
        UserConfig {
            vote_delegated_to: Some(1),
            ..present_user(2)
        },
    );
    fx.config.set_delegations_from(1, vec![2]);

    fx.service.start(1).await.unwrap();
    fx.service.start(2).await.unwrap();
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();
    fx.service
        .vote(2, 1, br#"{"user_id":2,"value":"Y"}"#)
        .await
        .unwrap();

    let voted = fx.service.voted_polls(&[1, 2, 3], 1).await.unwrap();
    assert_eq!(voted[&1], vec![1]);
    assert_eq!(voted[&2], vec![2]);
    assert_eq!(voted[&3], Vec::<i32>::new());
}

#[tokio::test]
async fn vote_count_freshness() {
    let fx = fixture();
    fx.config.add_poll(poll_config(42, PollKind::Named));
    fx.config.add_poll(PollConfig {
        backend: BackendSelector::Long,
        ..poll_config(23, PollKind::Named)
    });
    fx.config.set_group(1, vec![5, 6]);
    fx.config.add_user(5, present_user(5));
    fx.config.add_user(5, present_user(6));

    fx.service.start(42).await.unwrap();
    fx.service.start(23).await.unwrap();
    fx.service.vote(42, 5, br#"{"value":"Y"}"#).await.unwrap();
    fx.service.vote(42, 6, br#"{"value":"Y"}"#).await.unwrap();
    fx.service.vote(23, 5, br#"{"value":"Y"}"#).await.unwrap();

    let state = fx.service.vote_count(0, true).await.unwrap();
    assert_eq!(
        serde_json::to_string(&state).unwrap(),
        r#"{"id":3,"polls":{"23":1,"42":2}}"#
    );

    // without new votes the follow-up call blocks until cancellation
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        fx.service.vote_count(state.id, true),
    )
    .await;
    assert!(blocked.is_err());

    let snapshot = fx.service.vote_count(0, false).await.unwrap();
    assert_eq!(snapshot.polls, state.polls);

    // stopping a poll prunes its count
    fx.service.stop(42).await.unwrap();
    let state = fx.service.vote_count(state.id, true).await.unwrap();
    assert!(!state.polls.contains_key(&42));
}

#[tokio::test]
async fn cryptographic_poll_end_to_end() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Cryptographic));
    fx.config.set_group(1, vec![1, 2]);
    fx.config.add_user(5, present_user(1));
    fx.config.add_user(5, present_user(2));

    let poll_key = fx.service.start(1).await.unwrap().unwrap();
    let signature = Signature::try_from(poll_key.signature.as_slice()).unwrap();
    assert!(fx
        .main_public
        .verify(&poll_key.public_key, &signature)
        .is_ok());

    // start stays idempotent for the key material
    let again = fx.service.start(1).await.unwrap().unwrap();
    assert_eq!(again.public_key, poll_key.public_key);

    let public_key = <[u8; 32]>::try_from(poll_key.public_key.as_slice()).unwrap();
    let ballot =
        |plain: &str| Base64::encode_string(&crypto::seal(&public_key, plain.as_bytes()));

    let body = format!(r#"{{"value":"{}"}}"#, ballot(r#"{"votes":"Y"}"#));
    fx.service.vote(1, 1, body.as_bytes()).await.unwrap();
    let body = format!(r#"{{"value":"{}"}}"#, ballot(r#"{"votes":"X"}"#));
    fx.service.vote(1, 2, body.as_bytes()).await.unwrap();

    let result = fx.service.stop(1).await.unwrap();
    assert_eq!(result.user_ids, vec![1, 2]);

    let artifact: serde_json::Value = serde_json::from_str(result.votes.get()).unwrap();
    assert_eq!(artifact["id"], "assembly.example.com/1");
    let votes = artifact["votes"].as_array().unwrap();
    assert_eq!(votes.len(), 2);
    assert!(votes.contains(&serde_json::json!({"votes": "Y"})));
    assert!(votes.contains(&serde_json::json!({"votes": "X"})));

    // the signature covers the artifact bytes
    let signature = Signature::try_from(result.signature.as_deref().unwrap()).unwrap();
    assert!(fx
        .main_public
        .verify(result.votes.get().as_bytes(), &signature)
        .is_ok());

    // exactly the disabled global shortcut is reported invalid
    assert_eq!(result.invalid.len(), 1);
    let reason = result.invalid.values().next().unwrap();
    assert_eq!(reason, "Global vote X is not enabled");

    // a repeated stop reproduces the artifact and its signature
    let repeated = fx.service.stop(1).await.unwrap();
    assert_eq!(repeated.signature, result.signature);
    assert_eq!(repeated.votes.get(), result.votes.get());
}

#[tokio::test]
async fn cryptographic_ballots_must_be_base64() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Cryptographic));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    fx.service.start(1).await.unwrap();

    let err = fx
        .service
        .vote(1, 1, br#"{"value":"not base64!"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::Invalid(_)));

    let err = fx
        .service
        .vote(1, 1, br#"{"value":{"1":1}}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::Invalid(_)));
}

#[tokio::test]
async fn clear_all_resets_everything() {
    let fx = fixture();
    fx.config.add_poll(poll_config(1, PollKind::Named));
    fx.config.set_group(1, vec![1]);
    fx.config.add_user(5, present_user(1));

    fx.service.start(1).await.unwrap();
    fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap();

    fx.service.clear_all().await.unwrap();

    assert!(fx.service.vote_count(0, false).await.unwrap().polls.is_empty());
    let err = fx.service.vote(1, 1, br#"{"value":"Y"}"#).await.unwrap_err();
    assert!(matches!(err, VoteError::NotExists));
}
