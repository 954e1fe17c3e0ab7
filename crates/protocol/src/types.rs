//! Core types shared across the REST boundary

use serde::{Deserialize, Serialize};

/// Delivery status of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "delivered" => Some(NotificationStatus::Delivered),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

/// The durable record of one attempted message delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub contact_id: String,
    /// Phone snapshot taken at enqueue time; the contact row may change later
    pub phone: String,
    pub body: String,
    pub status: NotificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Relative URL of a failure screenshot, when one was captured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub created_at: String,
}

/// A contributor known to the system; phone is the stable join key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub phone: String,
    pub created_at: String,
}

/// One recorded contribution (boundary-only; the core never reads these)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub id: String,
    pub contact_id: String,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub verified: bool,
    pub created_at: String,
}

/// Messaging session status as seen by the admin dashboard
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionStatusInfo {
    pub initialized: bool,
    pub authenticated: bool,
}

/// Response to a login request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoginResponse {
    AlreadyAuthenticated { already_authenticated: bool },
    Credential { artifact_url: String },
}

/// Aggregate result of a recovery sweep
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Structured success/failure envelope for every API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn ok_empty(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            NotificationStatus::Pending,
            NotificationStatus::Delivered,
            NotificationStatus::Failed,
        ] {
            assert_eq!(NotificationStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(NotificationStatus::from_str("bogus"), None);
    }

    #[test]
    fn envelope_omits_absent_data() {
        let resp: ApiResponse<()> = ApiResponse::error("nope");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
    }

    #[test]
    fn login_response_serializes_flat() {
        let resp = LoginResponse::Credential {
            artifact_url: "/whatsapp/qr.svg".into(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["artifact_url"], "/whatsapp/qr.svg");
    }
}
