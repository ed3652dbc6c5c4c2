use std::io::{BufRead, Write};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use reverie_backend::agent::{AgentEvent, AgentHandle, RunState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Pause,
    EndSession,
    Delay(u64),
    Status,
    Quit,
    Say(String),
    Empty,
    Invalid(String),
}

pub fn parse_line(line: &str) -> ConsoleCommand {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleCommand::Empty;
    }
    if !line.starts_with('/') {
        return ConsoleCommand::Say(line.to_string());
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    match command {
        "/start" => ConsoleCommand::Start,
        "/pause" => ConsoleCommand::Pause,
        "/end" => ConsoleCommand::EndSession,
        "/status" => ConsoleCommand::Status,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        "/delay" => match parts.next().and_then(|raw| raw.parse().ok()) {
            Some(millis) => ConsoleCommand::Delay(millis),
            None => ConsoleCommand::Invalid("usage: /delay <milliseconds>".to_string()),
        },
        other => ConsoleCommand::Invalid(format!("unknown command {}", other)),
    }
}

/// Text to print for an event, if any. Thoughts stream inline; speech gets
/// its own line.
pub fn render_event(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::Thought { text, .. } => Some(text.clone()),
        AgentEvent::Speech {
            text,
            sender,
            complete,
        } => {
            let prefix = if *complete { "" } else { "[Incomplete]: " };
            Some(format!("\n{}: {}{}\n", sender, prefix, text))
        }
        AgentEvent::StateChanged(state) => Some(format!("\n[{}]\n", state_label(*state))),
        AgentEvent::MemorySaved { id } => Some(format!("\n[Memory saved #{}]\n", id)),
        // already reported through a system thought
        AgentEvent::Pruned { .. } | AgentEvent::Error(_) => None,
    }
}

fn state_label(state: RunState) -> &'static str {
    match state {
        RunState::Paused => "PAUSED",
        RunState::Running => "RUNNING",
        RunState::Terminated => "TERMINATED",
    }
}

/// Print events until the agent reports it has terminated.
pub fn spawn_renderer<W>(events: flume::Receiver<AgentEvent>, mut out: W) -> JoinHandle<()>
where
    W: Write + Send + 'static,
{
    std::thread::spawn(move || {
        for event in events.iter() {
            if let Some(text) = render_event(&event) {
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            if event == AgentEvent::StateChanged(RunState::Terminated) {
                break;
            }
        }
    })
}

/// Returns false once the console should stop reading.
pub fn apply<W: Write>(command: ConsoleCommand, handle: &AgentHandle, out: &mut W) -> Result<bool> {
    match command {
        ConsoleCommand::Start => {
            handle.start();
        }
        ConsoleCommand::Pause => {
            handle.pause();
        }
        ConsoleCommand::EndSession => handle.end_session(),
        ConsoleCommand::Delay(millis) => {
            handle.set_thought_delay(Duration::from_millis(millis));
            writeln!(out, "[thought delay {} ms]", millis)?;
        }
        ConsoleCommand::Status => {
            let status = handle.status();
            writeln!(
                out,
                "[{} | {} pending | {} ms delay]",
                state_label(status.state),
                status.pending_inputs,
                status.thought_delay_ms
            )?;
        }
        ConsoleCommand::Quit => {
            handle.shutdown();
            return Ok(false);
        }
        ConsoleCommand::Say(text) => {
            handle.submit_user_text(&text);
        }
        ConsoleCommand::Empty => {}
        ConsoleCommand::Invalid(message) => writeln!(out, "[{}]", message)?,
    }
    Ok(true)
}

/// Read commands until `/quit` or end of input. End of input shuts the
/// agent down the same way `/quit` does.
pub fn run<R: BufRead, W: Write>(input: R, handle: &AgentHandle, mut out: W) -> Result<()> {
    for line in input.lines() {
        if !apply(parse_line(&line?), handle, &mut out)? {
            return Ok(());
        }
        if handle.state() == RunState::Terminated {
            return Ok(());
        }
    }
    handle.shutdown();
    Ok(())
}
