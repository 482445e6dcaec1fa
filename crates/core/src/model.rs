#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

const MAX_SOURCE_ID_LEN: usize = 128;
const MAX_AUTHOR_ID_LEN: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Some(Self::Created),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether a job in `self` may move to `next`.
    ///
    /// `processing -> processing` carries progress messages and the restart
    /// after a redelivery. `created -> error` covers jobs that never reached a
    /// worker (dispatch failure, exhausted redeliveries).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Created, Self::Processing | Self::Error) => true,
            (Self::Processing, Self::Processing | Self::Completed | Self::Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The external request a job was spawned from, e.g. a mention id and its author.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginRef {
    pub source_id: String,
    pub author_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginRefError {
    EmptySource,
    SourceTooLong,
    AuthorTooLong,
    ContainsControl,
}

impl OriginRefError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::EmptySource => "origin source id must not be empty",
            Self::SourceTooLong => "origin source id is too long",
            Self::AuthorTooLong => "origin author id is too long",
            Self::ContainsControl => "origin contains control characters",
        }
    }
}

impl std::fmt::Display for OriginRefError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for OriginRefError {}

impl OriginRef {
    pub fn try_new(
        source_id: impl Into<String>,
        author_id: Option<String>,
    ) -> Result<Self, OriginRefError> {
        let source_id = source_id.into().trim().to_string();
        if source_id.is_empty() {
            return Err(OriginRefError::EmptySource);
        }
        if source_id.len() > MAX_SOURCE_ID_LEN {
            return Err(OriginRefError::SourceTooLong);
        }
        let author_id = author_id
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        if author_id
            .as_deref()
            .is_some_and(|a| a.len() > MAX_AUTHOR_ID_LEN)
        {
            return Err(OriginRefError::AuthorTooLong);
        }
        let has_control = source_id.chars().any(char::is_control)
            || author_id
                .as_deref()
                .is_some_and(|a| a.chars().any(char::is_control));
        if has_control {
            return Err(OriginRefError::ContainsControl);
        }
        Ok(Self {
            source_id,
            author_id,
        })
    }
}
