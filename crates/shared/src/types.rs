//! Enums stored as text columns and exchanged over HTTP

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored string does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle status shared by tasks and subtasks
///
/// `PartiallyCompleted` only ever applies to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PartiallyCompleted,
    Cancelled,
    Aborted,
}

text_enum!(TaskStatus, "task status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    PartiallyCompleted => "PARTIALLY_COMPLETED",
    Cancelled => "CANCELLED",
    Aborted => "ABORTED",
});

impl TaskStatus {
    /// Still waiting on a provider
    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    /// Terminal statuses whose credits are returned to the user
    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Aborted
        )
    }

    /// Task statuses that trigger a refund on first entry
    pub fn is_adverse(&self) -> bool {
        self.is_unsuccessful() || *self == TaskStatus::PartiallyCompleted
    }
}

/// External generation provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    Fal,
    KieAi,
    #[serde(rename = "openai-next")]
    OpenAiNext,
}

text_enum!(ProviderId, "provider", {
    Fal => "fal",
    KieAi => "kie-ai",
    OpenAiNext => "openai-next",
});

/// Kind of media a subtask produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

text_enum!(MediaKind, "media kind", {
    Image => "image",
    Video => "video",
    Audio => "audio",
});

/// What the user asked to generate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    TextToImage,
    ImageToImage,
    TextToVideo,
    ImageToVideo,
    TextToAudio,
}

text_enum!(TaskType, "task type", {
    TextToImage => "TEXT_TO_IMAGE",
    ImageToImage => "IMAGE_TO_IMAGE",
    TextToVideo => "TEXT_TO_VIDEO",
    ImageToVideo => "IMAGE_TO_VIDEO",
    TextToAudio => "TEXT_TO_AUDIO",
});

impl TaskType {
    pub fn media_kind(&self) -> MediaKind {
        match self {
            TaskType::TextToImage | TaskType::ImageToImage => MediaKind::Image,
            TaskType::TextToVideo | TaskType::ImageToVideo => MediaKind::Video,
            TaskType::TextToAudio => MediaKind::Audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip_matches_serde() {
        let status = TaskStatus::PartiallyCompleted;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, format!("\"{}\"", status.as_str()));
        assert_eq!("PARTIALLY_COMPLETED".parse::<TaskStatus>().unwrap(), status);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = "midjourney".parse::<ProviderId>().unwrap_err();
        assert_eq!(err.kind, "provider");
    }

    #[test]
    fn test_provider_serde_matches_text() {
        for provider in [ProviderId::Fal, ProviderId::KieAi, ProviderId::OpenAiNext] {
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, format!("\"{}\"", provider.as_str()));
        }
    }

    #[test]
    fn test_adverse_statuses() {
        assert!(TaskStatus::PartiallyCompleted.is_adverse());
        assert!(TaskStatus::Aborted.is_adverse());
        assert!(!TaskStatus::Completed.is_adverse());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_task_type_media_kind() {
        assert_eq!(TaskType::ImageToVideo.media_kind(), MediaKind::Video);
        assert_eq!(TaskType::TextToAudio.media_kind(), MediaKind::Audio);
    }
}
