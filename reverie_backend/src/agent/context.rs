use chrono::{DateTime, Local};

use super::input::{InputQueue, PendingInput};
use crate::llm_client::Message;

/// Messages kept at the tail of the history when older ones are compacted.
const KEEP_RECENT_MESSAGES: usize = 2;

/// Everything the orchestration loop owns for one session.
///
/// `messages[0]` is the system prompt for the whole life of the session.
#[derive(Debug, Clone)]
pub struct SessionState {
    messages: Vec<Message>,
    monologue: String,
    transcript: String,
    started_at: DateTime<Local>,
}

impl SessionState {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
            monologue: String::new(),
            transcript: String::new(),
            started_at: Local::now(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn monologue(&self) -> &str {
        &self.monologue
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Nothing happened worth remembering.
    pub fn is_blank(&self) -> bool {
        self.monologue.trim().is_empty() && self.transcript.trim().is_empty()
    }

    /// Fold every queued input into the session, oldest first.
    pub fn drain_inputs(&mut self, queue: &InputQueue) -> usize {
        let inputs = queue.drain();
        for input in &inputs {
            self.absorb_input(input);
        }
        inputs.len()
    }

    pub fn absorb_input(&mut self, input: &PendingInput) {
        let notice = input.notice();
        self.messages
            .push(Message::user(format!("React to this: {}", notice)));
        self.transcript.push_str(&input.transcript_line());
        self.monologue.push_str(&notice);
    }

    /// Record the raw thought text produced by one request.
    pub fn append_thought_turn(&mut self, thought: &str) {
        self.monologue.push_str(thought);
        if !thought.trim().is_empty() {
            self.messages.push(Message::assistant(thought));
        }
    }

    /// Record speech that was actually delivered to the listener.
    pub fn append_spoken_turn(&mut self, speech: &str, complete: bool) {
        let content = if complete {
            format!("I said to the User: {}", speech)
        } else {
            format!("I said to the User (incomplete): {}", speech)
        };
        self.messages.push(Message::assistant(content));
    }

    /// The message list for one request: stored history plus a steering
    /// instruction that never becomes part of the history.
    pub fn request_messages(&self, steering: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.extend_from_slice(&self.messages);
        messages.push(Message::user(steering));
        messages
    }

    pub fn monologue_chars(&self) -> usize {
        self.monologue.chars().count()
    }

    /// Swap the first `cut_chars` characters of the monologue for `note`.
    /// Returns the text that was cut.
    pub fn replace_monologue_prefix(&mut self, cut_chars: usize, note: &str) -> String {
        let cut_at = byte_offset_of_char(&self.monologue, cut_chars);
        let removed = self.monologue[..cut_at].to_string();
        self.monologue.replace_range(..cut_at, note);
        removed
    }

    /// Evict the oldest history after the system prompt until at least
    /// `min_chars` of content is gone, then put `note` in their place.
    /// Returns how many messages were evicted.
    pub fn compact_history(&mut self, min_chars: usize, note: &str) -> usize {
        let evictable = self.messages.len().saturating_sub(1 + KEEP_RECENT_MESSAGES);
        let mut removed_chars = 0;
        let mut count = 0;
        while count < evictable && removed_chars < min_chars {
            removed_chars += self.messages[1 + count].content.chars().count();
            count += 1;
        }
        if count == 0 {
            return 0;
        }

        self.messages
            .splice(1..1 + count, std::iter::once(Message::user(note)));
        count
    }
}

fn byte_offset_of_char(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}
