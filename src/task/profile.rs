//! Browser profile identities.

use serde::{Deserialize, Serialize};

/// Lightweight reference passed to `queue_task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: String,
    pub name: String,
}

impl ProfileRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Full profile record handed to the step executor.
///
/// Fingerprint, proxy and timezone data come from external providers and are
/// carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub fingerprint: serde_json::Value,
}

impl Profile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            user_agent: None,
            proxy: None,
            timezone: None,
            fingerprint: serde_json::Value::Null,
        }
    }

    pub fn to_ref(&self) -> ProfileRef {
        ProfileRef::new(&self.id, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_defaults_from_minimal_json() {
        let profile: Profile = serde_json::from_str(r#"{"id":"p1","name":"Shop A"}"#).unwrap();
        assert_eq!(profile.to_ref(), ProfileRef::new("p1", "Shop A"));
        assert!(profile.proxy.is_none());
        assert!(profile.fingerprint.is_null());
    }
}
