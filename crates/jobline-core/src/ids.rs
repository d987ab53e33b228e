use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest id accepted from an external source (query string, config).
pub const MAX_EXTERNAL_ID_LEN: usize = 128;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Accept an id supplied by a client or operator.
            ///
            /// Only `[A-Za-z0-9_-]` is allowed so the id can be embedded in
            /// store keys and channel names without escaping.
            pub fn parse_external(s: &str) -> Option<Self> {
                let valid = !s.is_empty()
                    && s.len() <= MAX_EXTERNAL_ID_LEN
                    && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
                valid.then(|| Self(s.to_owned()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(InstanceId, "inst");
branded_id!(ConnectionId, "conn");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn instance_id_has_prefix() {
        let id = InstanceId::new();
        assert!(id.as_str().starts_with("inst_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("sess_abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sess_abc\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_external_accepts_generated_ids() {
        let id = SessionId::new();
        assert_eq!(SessionId::parse_external(id.as_str()), Some(id));
    }

    #[test]
    fn parse_external_rejects_key_separators() {
        assert!(SessionId::parse_external("sess:1").is_none());
        assert!(SessionId::parse_external("jobline:*").is_none());
        assert!(SessionId::parse_external("a b").is_none());
    }

    #[test]
    fn parse_external_rejects_empty_and_oversized() {
        assert!(SessionId::parse_external("").is_none());
        let long = "a".repeat(MAX_EXTERNAL_ID_LEN + 1);
        assert!(SessionId::parse_external(&long).is_none());
        let max = "a".repeat(MAX_EXTERNAL_ID_LEN);
        assert!(SessionId::parse_external(&max).is_some());
    }
}
