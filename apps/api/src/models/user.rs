use serde::{Deserialize, Serialize};

/// The signed-in user as the rest of the app sees it, mapped from the
/// identity provider's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Result shape returned by every auth operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl AuthResult {
    pub fn ok(user: Option<User>) -> Self {
        AuthResult {
            success: true,
            error: None,
            user,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        AuthResult {
            success: false,
            error: Some(error.into()),
            user: None,
        }
    }
}
