use std::path::PathBuf;

/// Failure kinds the orchestration loop distinguishes.
///
/// Only `PromptTemplateMissing` stops anything: it aborts session start. The
/// others are reported to the observer and the loop carries on.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("prompt template '{}' not found", path.display())]
    PromptTemplateMissing { path: PathBuf },

    #[error("completion transport error: {0:#}")]
    CompletionTransport(anyhow::Error),

    #[error("summarization failed: {0:#}")]
    Summarization(anyhow::Error),

    #[error("failed to read memory record {location}: {source:#}")]
    MemoryStoreRead {
        location: String,
        source: anyhow::Error,
    },
}

impl AgentError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::PromptTemplateMissing { .. })
    }
}
