use std::{borrow::Borrow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub const MAX_ROOM_NAME_LEN: usize = 100;

/// A validated, case-sensitive room name made of word characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn parse(name: impl Into<String>) -> Result<Self, ChatError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("empty")
        } else if name.chars().count() > MAX_ROOM_NAME_LEN {
            Some("longer than 100 characters")
        } else if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            Some("only letters, digits and '_' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ChatError::InvalidRoom { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomName {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomName {
    type Error = ChatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomName> for String {
    fn from(value: RoomName) -> Self {
        value.0
    }
}

impl Borrow<str> for RoomName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_word_characters() {
        for name in ["general", "Room_42", "café", "_"] {
            assert_eq!(RoomName::parse(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "has space", "dash-ed", "slash/y", "dot.s"] {
            assert!(matches!(RoomName::parse(name), Err(ChatError::InvalidRoom { .. })), "{name}");
        }
        assert!(RoomName::parse("a".repeat(MAX_ROOM_NAME_LEN)).is_ok());
        assert!(RoomName::parse("a".repeat(MAX_ROOM_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn names_are_case_sensitive() {
        assert_ne!(RoomName::parse("General").unwrap(), RoomName::parse("general").unwrap());
    }

    #[test]
    fn deserializing_validates() {
        assert!(serde_json::from_str::<RoomName>("\"ok_room\"").is_ok());
        assert!(serde_json::from_str::<RoomName>("\"not ok\"").is_err());
    }
}
