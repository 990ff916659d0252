use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::{Uuid, Variant};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier {0:?} is not a canonical hyphenated UUID")]
    Malformed(String),
    #[error("identifier {value:?} has unsupported UUID version {version}")]
    UnsupportedVersion { value: String, version: usize },
}

impl UserId {
    /// Checks that the id is a canonical RFC-4122 UUID (versions 1 through 5).
    pub fn validate(&self) -> Result<Uuid, IdentifierError> {
        let raw = self.0.as_str();
        if raw.trim().is_empty() {
            return Err(IdentifierError::Empty);
        }
        if raw.len() != 36 {
            return Err(IdentifierError::Malformed(raw.to_string()));
        }

        let parsed =
            Uuid::try_parse(raw).map_err(|_| IdentifierError::Malformed(raw.to_string()))?;
        if parsed.get_variant() != Variant::RFC4122 {
            return Err(IdentifierError::Malformed(raw.to_string()));
        }
        match parsed.get_version_num() {
            1..=5 => Ok(parsed),
            version => Err(IdentifierError::UnsupportedVersion {
                value: raw.to_string(),
                version,
            }),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Individual,
    Group,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatType::Individual => "individual",
            ChatType::Group => "group",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
