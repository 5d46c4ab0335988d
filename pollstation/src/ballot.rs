//! Ballot payloads, stored envelopes and the format validator.

use std::collections::BTreeMap;

use crate::poll::{PollConfig, PollMethod};

/// Body of a vote request: `{"user_id"?: <int>, "value": <ballot-value>}`.
///
/// `user_id` is optional; when absent the vote user is the request user.
#[derive(Debug, Clone, Deserialize)]
pub struct BallotPayload {
    #[serde(default)]
    pub user_id: Option<i32>,
    pub value: BallotValue,
}

/// The three accepted shapes of a ballot value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BallotValue {
    /// A global shortcut, one of `"Y"`, `"N"` or `"A"`. Cryptographic polls
    /// also arrive in this shape, carrying the base64 ciphertext.
    Global(String),
    /// `option-id → amount` for the methods `Y` and `N`.
    AmountPerOption(BTreeMap<i32, i64>),
    /// `option-id → "Y"|"N"|"A"` for the methods `YN` and `YNA`.
    AnswerPerOption(BTreeMap<i32, String>),
}

impl BallotValue {
    pub fn as_global(&self) -> Option<&str> {
        match self {
            BallotValue::Global(value) => Some(value),
            _ => None,
        }
    }
}

/// Per-voter record appended to the backend for plaintext polls.
///
/// Zero user ids and an empty weight are omitted from the JSON. For
/// pseudoanonymous polls both user ids are zeroed before the append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteEnvelope {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub request_user_id: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vote_user_id: i32,
    pub value: BallotValue,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub weight: String,
}

/// Per-voter record for cryptographic polls. Only the raw ciphertext is
/// stored; user ids are never written and the weight must not be smuggled
/// through the opaque channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherEnvelope {
    #[serde(with = "crate::serde_base64")]
    pub value: Vec<u8>,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// Checks a ballot value against the poll configuration.
///
/// Returns a human-readable reason for the first violation, `None` for a
/// valid ballot. Zero amounts in the configuration default to 1.
pub fn validate(poll: &PollConfig, value: &BallotValue) -> Option<String> {
    let min_amount = default_one(poll.min_amount);
    let max_amount = default_one(poll.max_amount);
    let max_votes_per_option = default_one(poll.max_votes_per_option);

    let global_enabled = |shortcut: &str| match shortcut {
        "Y" => poll.global_yes,
        "N" => poll.global_no,
        "A" => poll.global_abstain,
        _ => false,
    };

    match poll.method {
        PollMethod::Y | PollMethod::N => match value {
            BallotValue::Global(shortcut) => {
                if !global_enabled(shortcut) {
                    return Some(format!("Global vote {} is not enabled", shortcut));
                }
                None
            }

            BallotValue::AmountPerOption(amounts) => {
                let mut sum = 0;
                for (&option_id, &amount) in amounts {
                    if amount < 0 {
                        return Some(format!("Your vote for option {} has to be >= 0", option_id));
                    }
                    if amount > max_votes_per_option {
                        return Some(format!(
                            "Your vote for option {} has to be <= {}",
                            option_id, max_votes_per_option
                        ));
                    }
                    if !poll.option_ids.contains(&option_id) {
                        return Some(format!(
                            "Option_id {} does not belong to the poll",
                            option_id
                        ));
                    }
                    sum += amount;
                }
                if sum < min_amount || sum > max_amount {
                    return Some(format!(
                        "The sum of your answers has to be between {} and {}",
                        min_amount, max_amount
                    ));
                }
                None
            }

            BallotValue::AnswerPerOption(_) => {
                Some("Your vote has a wrong format for poll method Y or N".to_string())
            }
        },

        PollMethod::YN | PollMethod::YNA => match value {
            BallotValue::Global(shortcut) => {
                if !global_enabled(shortcut) {
                    return Some(format!("Global vote {} is not enabled", shortcut));
                }
                None
            }

            BallotValue::AnswerPerOption(answers) => {
                for (&option_id, answer) in answers {
                    if !poll.option_ids.contains(&option_id) {
                        return Some(format!(
                            "Option_id {} does not belong to the poll",
                            option_id
                        ));
                    }
                    let abstain_ok = answer == "A" && poll.method == PollMethod::YNA;
                    if answer != "Y" && answer != "N" && !abstain_ok {
                        return Some(format!(
                            "Data for option {} does not fit the poll method.",
                            option_id
                        ));
                    }
                }
                None
            }

            BallotValue::AmountPerOption(_) => {
                Some("Your vote has a wrong format for poll method YN or YNA".to_string())
            }
        },
    }
}

fn default_one(value: i64) -> i64 {
    if value == 0 {
        1
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{BackendSelector, PollKind, PollState};

    fn poll_with_method(method: PollMethod) -> PollConfig {
        PollConfig {
            id: 1,
            meeting_id: 5,
            backend: BackendSelector::Fast,
            kind: PollKind::Named,
            method,
            entitled_group_ids: vec![1],
            global_yes: true,
            global_no: false,
            global_abstain: false,
            min_amount: 0,
            max_amount: 0,
            max_votes_per_option: 0,
            option_ids: vec![1, 2],
            state: PollState::Started,
        }
    }

    fn parse(value: serde_json::Value) -> BallotValue {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn payload_forms() {
        let payload: BallotPayload = serde_json::from_str(r#"{"value":"Y"}"#).unwrap();
        assert_eq!(payload.user_id, None);
        assert_eq!(payload.value, BallotValue::Global("Y".to_string()));

        let payload: BallotPayload =
            serde_json::from_str(r#"{"user_id":2,"value":{"1":1,"2":0}}"#).unwrap();
        assert_eq!(payload.user_id, Some(2));
        assert!(matches!(payload.value, BallotValue::AmountPerOption(_)));

        let payload: BallotPayload = serde_json::from_str(r#"{"value":{"1":"N"}}"#).unwrap();
        assert!(matches!(payload.value, BallotValue::AnswerPerOption(_)));

        assert!(serde_json::from_str::<BallotPayload>(r#"{"value":[1]}"#).is_err());
    }

    #[test]
    fn envelope_omits_zero_fields() {
        let envelope = VoteEnvelope {
            request_user_id: 0,
            vote_user_id: 0,
            value: BallotValue::Global("Y".to_string()),
            weight: "1.000000".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"value":"Y","weight":"1.000000"}"#
        );

        let envelope = VoteEnvelope {
            request_user_id: 1,
            vote_user_id: 2,
            value: BallotValue::Global("Y".to_string()),
            weight: String::new(),
        };
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"request_user_id":1,"vote_user_id":2,"value":"Y"}"#
        );
    }

    #[test]
    fn validate_global_shortcuts() {
        let poll = poll_with_method(PollMethod::Y);
        assert_eq!(validate(&poll, &parse("Y".into())), None);
        assert_eq!(
            validate(&poll, &parse("N".into())),
            Some("Global vote N is not enabled".to_string())
        );
        assert_eq!(
            validate(&poll, &parse("X".into())),
            Some("Global vote X is not enabled".to_string())
        );
    }

    #[test]
    fn validate_amounts() {
        let mut poll = poll_with_method(PollMethod::Y);
        poll.max_amount = 2;

        assert_eq!(validate(&poll, &parse(serde_json::json!({"1": 1}))), None);
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": 1, "2": 1}))),
            None
        );
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": -1}))),
            Some("Your vote for option 1 has to be >= 0".to_string())
        );
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": 2}))),
            Some("Your vote for option 1 has to be <= 1".to_string())
        );
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"3": 1}))),
            Some("Option_id 3 does not belong to the poll".to_string())
        );
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": 0}))),
            Some("The sum of your answers has to be between 1 and 2".to_string())
        );
    }

    #[test]
    fn validate_wrong_shape_for_method() {
        let poll = poll_with_method(PollMethod::Y);
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": "Y"}))),
            Some("Your vote has a wrong format for poll method Y or N".to_string())
        );

        let poll = poll_with_method(PollMethod::YN);
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": 1}))),
            Some("Your vote has a wrong format for poll method YN or YNA".to_string())
        );
    }

    #[test]
    fn validate_answers() {
        let poll = poll_with_method(PollMethod::YN);
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": "Y", "2": "N"}))),
            None
        );
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": "A"}))),
            Some("Data for option 1 does not fit the poll method.".to_string())
        );
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"3": "Y"}))),
            Some("Option_id 3 does not belong to the poll".to_string())
        );

        let poll = poll_with_method(PollMethod::YNA);
        assert_eq!(validate(&poll, &parse(serde_json::json!({"1": "A"}))), None);
        assert_eq!(
            validate(&poll, &parse(serde_json::json!({"1": "B"}))),
            Some("Data for option 1 does not fit the poll method.".to_string())
        );
    }
}
