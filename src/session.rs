//! Session payloads exchanged with the token endpoints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self { email: email.into(), password: password.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// The signed-in staff member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl User {
    pub fn display_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (true, true) => self.email.clone(),
            _ => format!("{} {}", self.first_name, self.last_name).trim().to_owned(),
        }
    }
}

/// What login, register and refresh hand back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    /// Present when the backend rotates the refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

impl TokenGrant {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into(), refresh_token: None, user: None }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn grant_tolerates_missing_optionals() {
        let grant: TokenGrant = serde_json::from_value(json!({ "token": "abc" })).unwrap();
        assert_eq!(grant, TokenGrant::new("abc"));

        let grant: TokenGrant = serde_json::from_value(json!({
            "token": "abc",
            "refresh_token": "r1",
            "user": { "user_id": 4, "email": "vet@clinic.example", "first_name": "Ana", "last_name": "Ruiz" }
        }))
        .unwrap();
        assert_eq!(grant.refresh_token.as_deref(), Some("r1"));
        assert_eq!(grant.user.unwrap().display_name(), "Ana Ruiz");
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let user: User = serde_json::from_value(json!({ "email": "front@clinic.example" })).unwrap();
        assert_eq!(user.display_name(), "front@clinic.example");
    }
}
