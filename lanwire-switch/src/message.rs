//! JSON bodies of control frames.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Switch -> point challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    /// Address the switch sees the point connecting from.
    pub address: String,
    /// Address the point connected to.
    pub switch: String,
}

/// Point -> switch credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    pub username: String,
    pub password: String,
    pub network: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignStatus {
    Ok,
    Failed,
}

/// Switch -> point outcome of a sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResult {
    pub status: SignStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub network: String,
    /// Leased address, empty when the network has no subnet.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub netmask: String,
}

impl SignResult {
    pub fn failed(network: &str, message: impl Into<String>) -> Self {
        Self {
            status: SignStatus::Failed,
            message: message.into(),
            network: network.to_string(),
            address: String::new(),
            netmask: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SignStatus::Ok
    }
}

/// Body of ping-request and ping-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub datetime: i64,
}

impl Ping {
    pub fn now() -> Self {
        Self {
            datetime: Utc::now().timestamp(),
        }
    }
}

/// Leave notice, sent by the switch to points it drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    pub datetime: i64,
    pub uuid: String,
    pub alias: String,
    /// Remote address of the session being dropped.
    pub connection: String,
    /// Local address of the session being dropped.
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_result_wire_shape() {
        let result = SignResult {
            status: SignStatus::Ok,
            message: String::new(),
            network: "corp".into(),
            address: "172.16.1.10".into(),
            netmask: "255.255.255.0".into(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({"status": "ok", "network": "corp", "address": "172.16.1.10", "netmask": "255.255.255.0"})
        );
    }

    #[test]
    fn test_sign_response_optional_fields() {
        let body = json!({"username": "alice", "password": "pw", "network": "corp"});
        let response: SignResponse = serde_json::from_value(body).unwrap();
        assert!(response.uuid.is_empty());
        assert!(response.alias.is_empty());
    }
}
