use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Natural-language business question, trimmed and guaranteed non-empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Question(String);

impl Question {
    pub fn new(text: impl AsRef<str>) -> Result<Self, DomainError> {
        let trimmed = text.as_ref().trim();
        if trimmed.is_empty() {
            return Err(DomainError::EmptyQuestion);
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Question {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Question> for String {
    fn from(value: Question) -> Self {
        value.0
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
