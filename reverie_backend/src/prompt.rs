use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::AgentError;

const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";
const MEMORIES_PLACEHOLDER: &str = "{memories}";

/// The system prompt template, read fresh at the start of every session.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(source) => Ok(Self { source }),
            Err(e) => {
                tracing::error!("Failed to read prompt template {:?}: {}", path, e);
                Err(AgentError::PromptTemplateMissing {
                    path: PathBuf::from(path),
                })
            }
        }
    }

    pub fn from_string(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn render(&self, now: DateTime<Local>, memories: &str) -> String {
        self.source
            .replace(
                TIMESTAMP_PLACEHOLDER,
                &now.format("%Y-%m-%d %H:%M:%S").to_string(),
            )
            .replace(MEMORIES_PLACEHOLDER, memories)
    }
}
