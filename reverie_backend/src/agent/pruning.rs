use super::context::SessionState;
use super::summarizer::Summarizer;

/// Share of the monologue cut on each prune, in percent.
pub const PRUNE_PERCENT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_chars: usize,
    pub note: String,
    pub summarized: bool,
    pub evicted_messages: usize,
}

impl PruneReport {
    pub fn notice(&self) -> String {
        format!(
            "\n[SYSTEM NOTICE: Context Pruning Occurred. {} characters removed, summarized to 1 memory note.]\n",
            self.removed_chars
        )
    }
}

/// Keeps the monologue under a character budget by replacing its oldest
/// fifth with a generated digest.
#[derive(Debug, Clone, Copy)]
pub struct Pruner {
    max_context_chars: usize,
}

impl Pruner {
    pub fn new(max_context_chars: usize) -> Self {
        Self { max_context_chars }
    }

    pub fn needs_prune(&self, session: &SessionState) -> bool {
        session.monologue_chars() > self.max_context_chars
    }

    /// At most one prune per call; the loop calls this before every request.
    pub async fn prune(
        &self,
        session: &mut SessionState,
        summarizer: &Summarizer,
    ) -> Option<PruneReport> {
        if !self.needs_prune(session) {
            return None;
        }

        let cut = cut_length(session.monologue_chars());
        if cut == 0 {
            return None;
        }

        let chunk: String = session.monologue().chars().take(cut).collect();
        let (summary, summarized) = summarizer.summarize_chunk_or_placeholder(&chunk).await;
        let note = archive_note(&summary);

        session.replace_monologue_prefix(cut, &note);
        let evicted_messages = session.compact_history(cut, note.trim());

        tracing::info!(
            "Pruned {} chars from monologue ({} history messages compacted, summarized: {})",
            cut,
            evicted_messages,
            summarized
        );

        Some(PruneReport {
            removed_chars: cut,
            note,
            summarized,
            evicted_messages,
        })
    }
}

/// `floor(0.20 * len)`
pub fn cut_length(len: usize) -> usize {
    len * PRUNE_PERCENT / 100
}

pub fn archive_note(summary: &str) -> String {
    format!(
        "\n[INTERNAL ARCHIVE NOTE (Pruning System): Older thoughts summarized: \"{}\"]\n",
        summary
    )
}
