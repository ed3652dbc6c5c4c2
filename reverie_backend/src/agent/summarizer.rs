use std::sync::Arc;

use crate::error::AgentError;
use crate::llm_client::{CompletionClient, GenerateOptions};

const CHUNK_OPTIONS: GenerateOptions = GenerateOptions {
    temperature: 0.1,
    max_tokens: 128,
};

const SESSION_OPTIONS: GenerateOptions = GenerateOptions {
    temperature: 0.1,
    max_tokens: 256,
};

/// Short non-streaming digests used by pruning and by end-of-session memory.
#[derive(Clone)]
pub struct Summarizer {
    client: Arc<dyn CompletionClient>,
}

impl Summarizer {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub async fn summarize_chunk(&self, chunk: &str) -> Result<String, AgentError> {
        let prompt = format!(
            "You are a summarization utility. Review the following internal monologue chunk \
             and generate a concise, 1-2 sentence summary of the core topics and reflections. \
             Do not quote anything. Use past tense and keep it objective.\n\n\
             CHUNK:\n---\n{}\n---",
            chunk
        );
        self.request(&prompt, &CHUNK_OPTIONS).await
    }

    /// Never fails: a failed call becomes a placeholder with a raw excerpt.
    pub async fn summarize_chunk_or_placeholder(&self, chunk: &str) -> (String, bool) {
        match self.summarize_chunk(chunk).await {
            Ok(summary) => (summary, true),
            Err(e) => {
                tracing::warn!("{}", e);
                (
                    format!(
                        "[FAILED TO SUMMARIZE: LLM ERROR. Content truncated: {}...]",
                        excerpt(chunk, 50)
                    ),
                    false,
                )
            }
        }
    }

    /// First-person digest of a whole session, for long-term memory.
    pub async fn summarize_session(&self, monologue: &str, transcript: &str) -> String {
        let session_context = format!(
            "--- INTERNAL MONOLOGUE ---\n{}\n--- USER INTERACTIONS ---\n{}",
            monologue, transcript
        );
        let prompt = format!(
            "You are a Memory Consolidation Agent acting as my inner voice. Your task is to analyze \
             the following session context and produce a concise summary (max 3 sentences) focusing \
             on specific details and any major events or facts discussed (e.g., the user's name, job, \
             core goals, or my reflections).\n\
             Crucially, write the entire summary in the FIRST PERSON (using 'I' and 'my').\n\n\
             SESSION CONTEXT:\n---\n{}\n---",
            session_context
        );

        match self.request(&prompt, &SESSION_OPTIONS).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("Memory consolidation failed: {}", e);
                format!(
                    "[FAILED TO GENERATE DETAILED MEMORY: LLM ERROR. Session context was: {}...]",
                    excerpt(&session_context, 100)
                )
            }
        }
    }

    async fn request(&self, prompt: &str, options: &GenerateOptions) -> Result<String, AgentError> {
        let response = self
            .client
            .generate(prompt, options)
            .await
            .map_err(AgentError::Summarization)?;
        let summary = response.trim();
        if summary.is_empty() {
            return Err(AgentError::Summarization(anyhow::anyhow!(
                "model returned an empty summary"
            )));
        }
        Ok(summary.to_string())
    }
}

pub(crate) fn excerpt(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
