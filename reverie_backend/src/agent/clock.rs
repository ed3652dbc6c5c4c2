use std::time::Duration;

use chrono::{DateTime, Local};
use flume::Sender;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::input::{InputQueue, PendingInput};
use super::{AgentEvent, RunState, ThoughtTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Active,
    Idle,
}

/// Drops a time notice into the input queue on a fixed wall-clock interval.
///
/// Ticks while paused are skipped, but the timer itself keeps its cadence.
pub struct ClockInjector {
    interval: Duration,
    inputs: InputQueue,
    run_state: watch::Receiver<RunState>,
    event_tx: Sender<AgentEvent>,
    cancel: CancellationToken,
}

impl ClockInjector {
    pub fn new(
        interval: Duration,
        inputs: InputQueue,
        run_state: watch::Receiver<RunState>,
        event_tx: Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval,
            inputs,
            run_state,
            event_tx,
            cancel,
        }
    }

    pub fn state(&self) -> ClockState {
        if *self.run_state.borrow() == RunState::Running {
            ClockState::Active
        } else {
            ClockState::Idle
        }
    }

    pub async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.on_tick(Local::now());
                }
            }
        }

        tracing::debug!("Clock injector stopped");
    }

    /// Returns whether a notice was injected.
    pub fn on_tick(&self, now: DateTime<Local>) -> bool {
        if self.state() == ClockState::Idle {
            tracing::trace!("Clock tick skipped while idle");
            return false;
        }

        let input = PendingInput::clock(now);
        let _ = self.event_tx.send(AgentEvent::Thought {
            text: input.notice(),
            tag: ThoughtTag::System,
        });
        self.inputs.enqueue(input);
        true
    }
}
