//! Real-time separation of inner monologue from quoted speech.
//!
//! Generated text arrives in fragments of arbitrary size. Everything outside a
//! pair of double quotes is thought; the text between them is speech meant for
//! the listener. A span opens at the first quote seen and closes at the next
//! one, even when that lands mid-fragment; anything after the closing quote is
//! parsed again as thought, so several spans in one turn are handled one after
//! another.

pub const QUOTE: char = '"';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserMode {
    #[default]
    Thought,
    CapturingSpeech,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSegment {
    Thought(String),
    /// `complete` is false when the stream ended before the closing quote.
    Speech { text: String, complete: bool },
}

/// Parser state for a single streaming request.
#[derive(Debug, Default)]
pub struct SpeechParser {
    mode: ParserMode,
    speech: String,
    monologue: String,
}

impl SpeechParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ParserMode {
        self.mode
    }

    /// Every thought fragment emitted so far, concatenated.
    pub fn monologue(&self) -> &str {
        &self.monologue
    }

    pub fn into_monologue(self) -> String {
        self.monologue
    }

    pub fn feed(&mut self, fragment: &str) -> Vec<ParsedSegment> {
        let mut segments = Vec::new();
        let mut rest = fragment;

        while !rest.is_empty() {
            let quote_at = rest.find(QUOTE);
            match (self.mode, quote_at) {
                (ParserMode::Thought, None) => {
                    self.push_thought(rest, &mut segments);
                    rest = "";
                }
                (ParserMode::Thought, Some(idx)) => {
                    self.push_thought(&rest[..idx], &mut segments);
                    self.mode = ParserMode::CapturingSpeech;
                    self.speech.clear();
                    rest = &rest[idx + QUOTE.len_utf8()..];
                }
                (ParserMode::CapturingSpeech, None) => {
                    self.speech.push_str(rest);
                    rest = "";
                }
                (ParserMode::CapturingSpeech, Some(idx)) => {
                    self.speech.push_str(&rest[..idx]);
                    self.mode = ParserMode::Thought;
                    if let Some(text) = self.take_speech() {
                        segments.push(ParsedSegment::Speech {
                            text,
                            complete: true,
                        });
                    }
                    rest = &rest[idx + QUOTE.len_utf8()..];
                }
            }
        }

        segments
    }

    /// Flush at end of stream. An unterminated span comes back as incomplete
    /// speech instead of being dropped.
    pub fn finish(&mut self) -> Option<ParsedSegment> {
        let was_capturing = self.mode == ParserMode::CapturingSpeech;
        self.mode = ParserMode::Thought;
        if !was_capturing {
            self.speech.clear();
            return None;
        }
        self.take_speech().map(|text| ParsedSegment::Speech {
            text,
            complete: false,
        })
    }

    fn push_thought(&mut self, text: &str, segments: &mut Vec<ParsedSegment>) {
        if text.is_empty() {
            return;
        }
        self.monologue.push_str(text);
        segments.push(ParsedSegment::Thought(text.to_string()));
    }

    fn take_speech(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.speech);
        let text = raw.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}
