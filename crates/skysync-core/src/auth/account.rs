use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable account identifier (a DID such as `did:plc:...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Did {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub did: Did,
    pub handle: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Service the account authenticated against.
    pub service: String,
}

impl Account {
    pub fn display_name(&self) -> String {
        if self.handle.is_empty() {
            self.did.to_string()
        } else {
            format!("@{}", self.handle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_serializes_as_plain_string() {
        let did = Did::new("did:plc:alice");
        assert_eq!(serde_json::to_string(&did).unwrap(), "\"did:plc:alice\"");
        assert_eq!(did.to_string(), "did:plc:alice");
    }

    #[test]
    fn test_display_name_prefers_handle() {
        let mut account = Account {
            did: Did::new("did:plc:alice"),
            handle: "alice.test".into(),
            email: None,
            service: "https://pds.test".into(),
        };
        assert_eq!(account.display_name(), "@alice.test");
        account.handle.clear();
        assert_eq!(account.display_name(), "did:plc:alice");
    }
}
