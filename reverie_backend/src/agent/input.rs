use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

const KICKOFF_TEXT: &str = "[SYSTEM KICKOFF: Begin reflection on goals and past existence.]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputOrigin {
    User,
    Clock,
    Kickoff,
}

/// One externally produced event waiting to be folded into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInput {
    pub origin: InputOrigin,
    pub received_at: DateTime<Local>,
    pub text: String,
}

impl PendingInput {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            origin: InputOrigin::User,
            received_at: Local::now(),
            text: text.into(),
        }
    }

    pub fn clock(now: DateTime<Local>) -> Self {
        Self {
            origin: InputOrigin::Clock,
            received_at: now,
            text: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn kickoff() -> Self {
        Self {
            origin: InputOrigin::Kickoff,
            received_at: Local::now(),
            text: KICKOFF_TEXT.to_string(),
        }
    }

    /// The notice as it is injected into the thought stream.
    pub fn notice(&self) -> String {
        match self.origin {
            InputOrigin::User => format!(
                "\n[INPUT RECEIVED AT {}: User said: '{}']\n",
                self.received_at.format("%H:%M:%S"),
                self.text
            ),
            InputOrigin::Clock => format!(
                "\n[SYSTEM NOTICE: Current Time is {} Remember to use double quotes for talking to the user]\n",
                self.text
            ),
            InputOrigin::Kickoff => format!("\n{}\n", self.text),
        }
    }

    pub fn transcript_line(&self) -> String {
        match self.origin {
            InputOrigin::User => format!("\n[User said]: {}", self.text),
            InputOrigin::Clock | InputOrigin::Kickoff => {
                format!("\n[System notice]: {}", self.notice().trim())
            }
        }
    }
}

/// Multi-producer FIFO of pending inputs. Producers never block; the
/// orchestration loop is the only consumer.
#[derive(Clone)]
pub struct InputQueue {
    tx: flume::Sender<PendingInput>,
    rx: flume::Receiver<PendingInput>,
}

impl InputQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn enqueue(&self, input: PendingInput) {
        // Cannot fail: this queue holds its own receiver.
        let _ = self.tx.send(input);
    }

    pub fn drain(&self) -> Vec<PendingInput> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn user_notice_quotes_text_with_time() {
        let mut input = PendingInput::user("Hello");
        input.received_at = Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 15).unwrap();
        assert_eq!(
            input.notice(),
            "\n[INPUT RECEIVED AT 09:30:15: User said: 'Hello']\n"
        );
        assert_eq!(input.transcript_line(), "\n[User said]: Hello");
    }

    #[test]
    fn clock_notice_carries_full_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let input = PendingInput::clock(now);
        assert!(input
            .notice()
            .contains("Current Time is 2024-05-01 09:30:00 Remember to use double quotes"));
        assert!(input.transcript_line().starts_with("\n[System notice]: [SYSTEM NOTICE"));
    }

    #[test]
    fn drain_preserves_fifo_across_producers() {
        let queue = InputQueue::new();
        let user_side = queue.clone();
        let clock_side = queue.clone();

        user_side.enqueue(PendingInput::user("first"));
        clock_side.enqueue(PendingInput::clock(Local::now()));
        user_side.enqueue(PendingInput::user("third"));

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].text, "first");
        assert_eq!(drained[1].origin, InputOrigin::Clock);
        assert_eq!(drained[2].text, "third");
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_keep_items_whole_and_ordered() {
        let queue = InputQueue::new();
        let handles: Vec<_> = (0..2)
            .map(|producer| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        queue.enqueue(PendingInput::user(format!("p{}-{:03}", producer, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 400);
        for producer in 0..2 {
            let prefix = format!("p{}-", producer);
            let own: Vec<_> = drained
                .iter()
                .filter(|input| input.text.starts_with(&prefix))
                .map(|input| input.text.clone())
                .collect();
            let expected: Vec<_> = (0..200).map(|i| format!("p{}-{:03}", producer, i)).collect();
            assert_eq!(own, expected);
        }
    }
}
