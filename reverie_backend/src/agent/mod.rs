pub mod clock;
pub mod context;
pub mod input;
pub mod parser;
pub mod pruning;
pub mod summarizer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use flume::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::llm_client::CompletionClient;
use crate::memory::{self, MemoryStore};
use crate::prompt::PromptTemplate;

use self::clock::ClockInjector;
use self::context::SessionState;
use self::input::{InputQueue, PendingInput};
use self::parser::{ParsedSegment, SpeechParser};
use self::pruning::Pruner;
use self::summarizer::Summarizer;

/// Appended to every request and never stored in the history.
pub const STEERING_PROMPT: &str = "Continue your stream of consciousness. Reflect, observe, or decide to speak. \
     CRITICAL REMINDER: If you speak to the user, you MUST use double quotes for the entire message (e.g., \"Hello, User.\")";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Paused,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtTag {
    Thought,
    System,
    Input,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Thought {
        text: String,
        tag: ThoughtTag,
    },
    Speech {
        text: String,
        sender: String,
        complete: bool,
    },
    StateChanged(RunState),
    Pruned {
        removed_chars: usize,
    },
    MemorySaved {
        id: i64,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub state: RunState,
    pub pending_inputs: usize,
    pub thought_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    EndSession,
}

/// Applies a state transition unless the loop has already terminated.
/// Emits `StateChanged` only when the state actually moved.
fn transition(
    run_state: &watch::Sender<RunState>,
    event_tx: &Sender<AgentEvent>,
    next: impl FnOnce(RunState) -> Option<RunState>,
) -> bool {
    let mut moved_to = None;
    let changed = run_state.send_if_modified(|current| {
        if *current == RunState::Terminated {
            return false;
        }
        match next(*current) {
            Some(state) if state != *current => {
                *current = state;
                moved_to = Some(state);
                true
            }
            _ => false,
        }
    });

    if let Some(state) = moved_to {
        tracing::info!("Agent state -> {:?}", state);
        let _ = event_tx.send(AgentEvent::StateChanged(state));
    }
    changed
}

/// Control surface for a running agent loop. Cheap to clone; every method is
/// synchronous and never waits on the loop.
#[derive(Clone)]
pub struct AgentHandle {
    run_state: Arc<watch::Sender<RunState>>,
    inputs: InputQueue,
    commands: Sender<SessionCommand>,
    cancel: CancellationToken,
    thought_delay_ms: Arc<AtomicU64>,
    event_tx: Sender<AgentEvent>,
}

impl AgentHandle {
    pub fn start(&self) -> bool {
        transition(&self.run_state, &self.event_tx, |_| Some(RunState::Running))
    }

    pub fn pause(&self) -> bool {
        transition(&self.run_state, &self.event_tx, |_| Some(RunState::Paused))
    }

    pub fn toggle(&self) -> RunState {
        transition(&self.run_state, &self.event_tx, |current| match current {
            RunState::Running => Some(RunState::Paused),
            RunState::Paused => Some(RunState::Running),
            RunState::Terminated => None,
        });
        self.state()
    }

    /// Persist the current session and return to paused. The next start
    /// opens a fresh session.
    pub fn end_session(&self) {
        if self.commands.send(SessionCommand::EndSession).is_err() {
            tracing::warn!("End session requested but the agent loop is gone");
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue text from the listener. Blank text is ignored.
    pub fn submit_user_text(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        let input = PendingInput::user(text);
        let _ = self.event_tx.send(AgentEvent::Thought {
            text: input.notice(),
            tag: ThoughtTag::Input,
        });
        self.inputs.enqueue(input);
        true
    }

    pub fn set_thought_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.thought_delay_ms.store(millis, Ordering::Relaxed);
    }

    pub fn state(&self) -> RunState {
        *self.run_state.borrow()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            state: self.state(),
            pending_inputs: self.inputs.len(),
            thought_delay_ms: self.thought_delay_ms.load(Ordering::Relaxed),
        }
    }

    /// Wait until the loop reports `Terminated`.
    pub async fn terminated(&self) {
        let mut rx = self.run_state.subscribe();
        let _ = rx.wait_for(|state| *state == RunState::Terminated).await;
    }
}

/// How a streaming request stopped.
enum StreamEnd {
    Finished,
    Cancelled,
    Command(SessionCommand),
}

/// The orchestration loop. Owns the session exclusively; everything else
/// reaches it through the input queue, the run-state cell, or a command.
pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn CompletionClient>,
    store: Arc<dyn MemoryStore>,
    summarizer: Summarizer,
    pruner: Pruner,
    inputs: InputQueue,
    run_state: Arc<watch::Sender<RunState>>,
    commands: flume::Receiver<SessionCommand>,
    cancel: CancellationToken,
    thought_delay_ms: Arc<AtomicU64>,
    event_tx: Sender<AgentEvent>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn CompletionClient>,
        store: Arc<dyn MemoryStore>,
        event_tx: Sender<AgentEvent>,
    ) -> (Self, AgentHandle) {
        let (run_state, _) = watch::channel(RunState::Paused);
        let run_state = Arc::new(run_state);
        let (command_tx, command_rx) = flume::unbounded();
        let inputs = InputQueue::new();
        let cancel = CancellationToken::new();
        let thought_delay_ms = Arc::new(AtomicU64::new(config.thought_delay_ms));

        let handle = AgentHandle {
            run_state: run_state.clone(),
            inputs: inputs.clone(),
            commands: command_tx,
            cancel: cancel.clone(),
            thought_delay_ms: thought_delay_ms.clone(),
            event_tx: event_tx.clone(),
        };

        let agent = Self {
            summarizer: Summarizer::new(client.clone()),
            pruner: Pruner::new(config.max_context_chars),
            config,
            client,
            store,
            inputs,
            run_state,
            commands: command_rx,
            cancel,
            thought_delay_ms,
            event_tx,
        };

        (agent, handle)
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_thought(&self, text: impl Into<String>, tag: ThoughtTag) {
        self.emit(AgentEvent::Thought {
            text: text.into(),
            tag,
        });
    }

    fn set_state(&self, state: RunState) {
        transition(&self.run_state, &self.event_tx, |_| Some(state));
    }

    pub async fn run_loop(self) {
        tracing::info!("Agent loop starting...");

        let clock = ClockInjector::new(
            self.config.clock_interval(),
            self.inputs.clone(),
            self.run_state.subscribe(),
            self.event_tx.clone(),
            self.cancel.clone(),
        );
        let clock_task = tokio::spawn(clock.run());

        let mut run_rx = self.run_state.subscribe();
        let mut session: Option<SessionState> = None;

        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command, &mut session).await;
            }

            if self.cancel.is_cancelled() {
                break;
            }

            let state = *run_rx.borrow_and_update();
            if state != RunState::Running {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = run_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    command = self.commands.recv_async() => match command {
                        Ok(command) => self.handle_command(command, &mut session).await,
                        Err(_) => {
                            tracing::warn!("Agent handle dropped, stopping loop");
                            break;
                        }
                    },
                }
                continue;
            }

            if session.is_none() {
                match self.start_session() {
                    Ok(fresh) => session = Some(fresh),
                    Err(e) => {
                        tracing::error!("Session start aborted: {}", e);
                        self.emit_thought(format!("\n[ERROR: {}]\n", e), ThoughtTag::System);
                        self.emit(AgentEvent::Error(e.to_string()));
                        if e.is_fatal() {
                            self.set_state(RunState::Paused);
                        }
                        continue;
                    }
                }
            }

            let Some(active) = session.as_mut() else {
                continue;
            };

            match self.run_iteration(active).await {
                Ok(StreamEnd::Command(command)) => {
                    self.handle_command(command, &mut session).await;
                }
                Ok(StreamEnd::Finished) | Ok(StreamEnd::Cancelled) => {}
                Err(e) => {
                    tracing::error!("Agent iteration error: {}", e);
                    self.emit_thought(
                        format!(
                            "\n[CRITICAL ERROR: {} - Check completion service connectivity]\n",
                            e
                        ),
                        ThoughtTag::System,
                    );
                    self.emit(AgentEvent::Error(e.to_string()));

                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = sleep(self.config.error_backoff()) => {}
                    }
                }
            }
        }

        if let Some(active) = session.take() {
            self.persist_session(&active).await;
        }

        self.cancel.cancel();
        if let Err(e) = clock_task.await {
            tracing::warn!("Clock injector ended abnormally: {}", e);
        }

        self.set_state(RunState::Terminated);
        tracing::info!("Agent loop stopped");
    }

    async fn handle_command(&self, command: SessionCommand, session: &mut Option<SessionState>) {
        match command {
            SessionCommand::EndSession => {
                if let Some(active) = session.as_ref() {
                    if self.persist_session(active).await {
                        *session = None;
                        self.emit_thought("\n[SESSION ENDED]\n", ThoughtTag::System);
                    }
                }
                self.set_state(RunState::Paused);
            }
        }
    }

    /// Build a fresh session from the prompt template and recent memories.
    /// Nothing is mutated when the template is missing.
    fn start_session(&self) -> Result<SessionState, AgentError> {
        let template = PromptTemplate::load(&self.config.prompt_path)?;
        let memories = memory::load_recent(self.store.as_ref(), self.config.memory_preload_count);
        let session = SessionState::new(template.render(Local::now(), &memories));

        let kickoff = PendingInput::kickoff();
        self.emit_thought(
            format!(
                "\n*** {} ACTIVATED ***\n",
                self.config.agent_name.to_uppercase()
            ),
            ThoughtTag::System,
        );
        self.emit_thought(kickoff.notice(), ThoughtTag::System);
        self.inputs.enqueue(kickoff);

        tracing::info!("Session started at {}", session.started_at());
        Ok(session)
    }

    async fn run_iteration(&self, session: &mut SessionState) -> Result<StreamEnd, AgentError> {
        let drained = session.drain_inputs(&self.inputs);
        if drained > 0 {
            tracing::debug!("Folded {} pending inputs into context", drained);
        }

        // The session is only touched once the summary is back, so dropping
        // the prune on stop leaves it intact.
        let pruned = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            pruned = self.pruner.prune(session, &self.summarizer) => pruned,
        };
        if let Some(report) = pruned {
            self.emit_thought(report.notice(), ThoughtTag::System);
            self.emit(AgentEvent::Pruned {
                removed_chars: report.removed_chars,
            });
        }

        let messages = session.request_messages(STEERING_PROMPT);
        let options = self.config.chat_options();
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::info!("Stop signal received while opening the stream");
                return Ok(StreamEnd::Cancelled);
            }
            opened = self.client.chat_stream(&messages, &options) => opened,
        };
        let mut stream = opened.map_err(AgentError::CompletionTransport)?;

        let mut parser = SpeechParser::new();
        let mut failure = None;
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("Stop signal received mid-stream");
                    break StreamEnd::Cancelled;
                }
                command = self.commands.recv_async(), if !self.commands.is_disconnected() => {
                    match command {
                        Ok(command) => break StreamEnd::Command(command),
                        Err(_) => continue,
                    }
                }
                next = stream.next() => next,
            };

            match next {
                None => break StreamEnd::Finished,
                Some(Ok(fragment)) => {
                    for segment in parser.feed(&fragment) {
                        self.deliver(segment, session).await;
                    }
                }
                Some(Err(e)) => {
                    failure = Some(AgentError::CompletionTransport(e));
                    break StreamEnd::Finished;
                }
            }
        };

        if let Some(segment) = parser.finish() {
            self.deliver(segment, session).await;
        }
        session.append_thought_turn(&parser.into_monologue());

        match failure {
            Some(e) => Err(e),
            None => Ok(end),
        }
    }

    async fn deliver(&self, segment: ParsedSegment, session: &mut SessionState) {
        match segment {
            ParsedSegment::Thought(text) => {
                let paced = !text.trim().is_empty();
                self.emit_thought(text, ThoughtTag::Thought);
                if paced {
                    self.pace().await;
                }
            }
            ParsedSegment::Speech { text, complete } => {
                session.append_spoken_turn(&text, complete);
                self.emit(AgentEvent::Speech {
                    text,
                    sender: self.config.agent_name.clone(),
                    complete,
                });
            }
        }
    }

    async fn pace(&self) {
        let millis = self.thought_delay_ms.load(Ordering::Relaxed);
        if millis == 0 {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep(Duration::from_millis(millis)) => {}
        }
    }

    /// Consolidate the session into one memory record. Returns false only
    /// when a non-blank session could not be stored.
    async fn persist_session(&self, session: &SessionState) -> bool {
        if session.is_blank() {
            tracing::info!("Session is blank, nothing to remember");
            return true;
        }

        self.emit_thought("\n[Consolidating memories...]\n", ThoughtTag::System);
        let summary = self
            .summarizer
            .summarize_session(session.monologue(), session.transcript())
            .await;

        match self.store.persist(&summary) {
            Ok(record) => {
                self.emit(AgentEvent::MemorySaved { id: record.id });
                true
            }
            Err(e) => {
                tracing::error!("Failed to persist session memory: {:#}", e);
                self.emit(AgentEvent::Error(format!("Failed to save memory: {}", e)));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{ChatOptions, FragmentStream, GenerateOptions, Message, Role};
    use crate::memory::JsonFileStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures_util::{future, stream};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    enum Script {
        Fragments(Vec<&'static str>),
        Fail(&'static str),
        /// Yields the fragments, then breaks with a transport error.
        BreaksAfter(Vec<&'static str>, &'static str),
        Gated(flume::Receiver<String>),
        /// The service accepts the request but never answers.
        NeverOpens,
    }

    /// Plays back one script per streaming request; once they run out every
    /// request hangs until cancelled.
    struct ScriptedClient {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<Vec<Message>>>,
        summary: &'static str,
        generate_calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(scripts: Vec<Script>, summary: &'static str) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
                summary,
                generate_calls: AtomicUsize::new(0),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, index: usize) -> Vec<Message> {
            self.requests.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.summary.to_string())
        }

        async fn chat_stream(
            &self,
            messages: &[Message],
            _options: &ChatOptions,
        ) -> Result<FragmentStream> {
            self.requests.lock().unwrap().push(messages.to_vec());
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Fragments(fragments)) => {
                    let items: Vec<Result<String>> =
                        fragments.into_iter().map(|f| Ok(f.to_string())).collect();
                    Ok(Box::pin(stream::iter(items)))
                }
                Some(Script::Fail(message)) => Err(anyhow::anyhow!(message)),
                Some(Script::BreaksAfter(fragments, message)) => {
                    let mut items: Vec<Result<String>> =
                        fragments.into_iter().map(|f| Ok(f.to_string())).collect();
                    items.push(Err(anyhow::anyhow!(message)));
                    Ok(Box::pin(stream::iter(items)))
                }
                Some(Script::NeverOpens) => future::pending::<Result<FragmentStream>>().await,
                Some(Script::Gated(rx)) => {
                    Ok(Box::pin(rx.into_stream().map(Ok::<String, anyhow::Error>)))
                }
                None => Ok(Box::pin(stream::pending::<Result<String>>())),
            }
        }
    }

    struct Harness {
        handle: AgentHandle,
        events: flume::Receiver<AgentEvent>,
        seen: Vec<AgentEvent>,
        client: Arc<ScriptedClient>,
        store: Arc<JsonFileStore>,
        task: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(scripts: Vec<Script>, tweak: impl FnOnce(&mut AgentConfig)) -> Self {
            Self::with_summary(scripts, "I remembered the session.", tweak)
        }

        fn with_summary(
            scripts: Vec<Script>,
            summary: &'static str,
            tweak: impl FnOnce(&mut AgentConfig),
        ) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let prompt_path = dir.path().join("prompt.txt");
            std::fs::write(&prompt_path, "You are Reverie. Now: {timestamp}\n{memories}").unwrap();

            let mut config = AgentConfig::default();
            config.prompt_path = prompt_path.to_string_lossy().to_string();
            config.memory_dir = dir.path().join("memories").to_string_lossy().to_string();
            config.thought_delay_ms = 0;
            config.error_backoff_secs = 0;
            config.clock_interval_secs = 3600;
            tweak(&mut config);

            let client = ScriptedClient::new(scripts, summary);
            let store = Arc::new(JsonFileStore::new(&config.memory_dir).unwrap());
            let (event_tx, events) = flume::unbounded();
            let (agent, handle) = Agent::new(config, client.clone(), store.clone(), event_tx);
            let task = tokio::spawn(agent.run_loop());

            Self {
                handle,
                events,
                seen: Vec::new(),
                client,
                store,
                task,
                _dir: dir,
            }
        }

        /// Collect events until one matches, returning it.
        async fn wait_for(&mut self, pred: impl Fn(&AgentEvent) -> bool) -> AgentEvent {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv_async())
                    .await
                    .expect("timed out waiting for event")
                    .expect("event channel closed");
                self.seen.push(event.clone());
                if pred(&event) {
                    return event;
                }
            }
        }

        async fn wait_for_requests(&self, count: usize) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while self.client.request_count() < count {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for request #{}",
                    count
                );
                sleep(Duration::from_millis(5)).await;
            }
        }

        async fn shutdown(mut self) -> Self {
            self.handle.shutdown();
            (&mut self.task).await.expect("agent loop panicked");
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event);
            }
            self
        }

        fn thoughts(&self, tag: ThoughtTag) -> Vec<String> {
            self.seen
                .iter()
                .filter_map(|event| match event {
                    AgentEvent::Thought { text, tag: t } if *t == tag => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&AgentEvent) -> bool) -> usize {
            self.seen.iter().filter(|event| pred(event)).count()
        }
    }

    fn is_thought(event: &AgentEvent, expected: &str) -> bool {
        matches!(event, AgentEvent::Thought { text, tag: ThoughtTag::Thought } if text == expected)
    }

    #[tokio::test]
    async fn hello_turn_splits_thought_and_speech() {
        let mut h = Harness::new(
            vec![Script::Fragments(vec![" Thinking... \"Hi", " there!\" more thoughts"])],
            |_| {},
        );
        assert!(h.handle.submit_user_text("Hello"));
        assert!(h.handle.start());

        h.wait_for(|e| is_thought(e, " more thoughts")).await;
        assert_eq!(
            h.thoughts(ThoughtTag::Thought),
            vec![" Thinking... ".to_string(), " more thoughts".to_string()]
        );
        let speech: Vec<_> = h
            .seen
            .iter()
            .filter(|e| matches!(e, AgentEvent::Speech { .. }))
            .cloned()
            .collect();
        assert_eq!(
            speech,
            vec![AgentEvent::Speech {
                text: "Hi there!".to_string(),
                sender: "Reverie".to_string(),
                complete: true,
            }]
        );

        let first = h.client.request(0);
        assert_eq!(first[0].role, Role::System);
        assert!(first[0].content.contains("No previous memories."));
        assert!(first
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("User said: 'Hello'")));
        assert_eq!(first.last().unwrap().content, STEERING_PROMPT);

        h.wait_for_requests(2).await;
        let second = h.client.request(1);
        assert!(second
            .iter()
            .any(|m| m.content == "I said to the User: Hi there!"));
        assert!(second
            .iter()
            .any(|m| m.role == Role::Assistant && m.content == " Thinking...  more thoughts"));
        assert_eq!(
            second.iter().filter(|m| m.content == STEERING_PROMPT).count(),
            1
        );

        let h = h.shutdown().await;
        assert_eq!(h.count(|e| matches!(e, AgentEvent::MemorySaved { .. })), 1);
        let saved = h.store.recent(3).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].summary, "I remembered the session.");
    }

    #[tokio::test]
    async fn oversized_monologue_is_pruned_once_before_next_request() {
        let long_thought: &'static str = Box::leak("x".repeat(150).into_boxed_str());
        let mut h = Harness::new(vec![Script::Fragments(vec![long_thought])], |config| {
            config.max_context_chars = 100;
        });
        h.handle.start();

        h.wait_for_requests(2).await;
        let pruned = h
            .wait_for(|e| matches!(e, AgentEvent::Pruned { .. }))
            .await;

        let buffered = PendingInput::kickoff().notice().chars().count() + 150;
        assert_eq!(
            pruned,
            AgentEvent::Pruned {
                removed_chars: pruning::cut_length(buffered)
            }
        );
        assert_eq!(h.client.generate_calls.load(Ordering::SeqCst), 1);
        assert!(h
            .thoughts(ThoughtTag::System)
            .iter()
            .any(|t| t.contains("Context Pruning Occurred")));

        let h = h.shutdown().await;
        assert_eq!(h.count(|e| matches!(e, AgentEvent::Pruned { .. })), 1);
    }

    #[tokio::test]
    async fn transport_failure_backs_off_and_retries() {
        let mut h = Harness::new(
            vec![
                Script::Fail("connection refused"),
                Script::Fragments(vec!["recovered"]),
            ],
            |_| {},
        );
        h.handle.start();

        let error = h.wait_for(|e| matches!(e, AgentEvent::Error(_))).await;
        assert!(matches!(error, AgentEvent::Error(ref msg) if msg.contains("connection refused")));
        h.wait_for(|e| is_thought(e, "recovered")).await;

        assert!(h
            .thoughts(ThoughtTag::System)
            .iter()
            .any(|t| t.contains("[CRITICAL ERROR:") && t.contains("connection refused")));

        let retry = h.client.request(1);
        assert_eq!(
            retry.iter().filter(|m| m.content == STEERING_PROMPT).count(),
            1
        );
        assert_eq!(retry.last().unwrap().content, STEERING_PROMPT);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn broken_stream_flushes_speech_records_turn_and_retries() {
        let mut h = Harness::new(
            vec![Script::BreaksAfter(vec!["musing \"half a sen"], "stream reset")],
            |_| {},
        );
        h.handle.start();

        h.wait_for(|e| matches!(e, AgentEvent::Error(msg) if msg.contains("stream reset")))
            .await;
        assert_eq!(
            h.count(|e| *e
                == AgentEvent::Speech {
                    text: "half a sen".to_string(),
                    sender: "Reverie".to_string(),
                    complete: false,
                }),
            1
        );
        assert!(h
            .thoughts(ThoughtTag::System)
            .iter()
            .any(|t| t.contains("[CRITICAL ERROR:") && t.contains("stream reset")));

        h.wait_for_requests(2).await;
        let retry = h.client.request(1);
        assert!(retry
            .iter()
            .any(|m| m.role == Role::Assistant && m.content == "musing "));
        assert!(retry
            .iter()
            .any(|m| m.content == "I said to the User (incomplete): half a sen"));
        assert_eq!(retry.last().unwrap().content, STEERING_PROMPT);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_while_request_is_opening_still_persists() {
        let h = Harness::new(vec![Script::NeverOpens], |_| {});
        h.handle.start();
        h.wait_for_requests(1).await;

        let h = tokio::time::timeout(Duration::from_secs(3), h.shutdown())
            .await
            .expect("loop kept waiting on the unopened request");

        assert_eq!(h.handle.state(), RunState::Terminated);
        assert_eq!(h.count(|e| matches!(e, AgentEvent::MemorySaved { .. })), 1);
        assert_eq!(h.store.recent(3).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pause_lets_in_flight_request_finish() {
        let (gate_tx, gate_rx) = flume::unbounded();
        let mut h = Harness::new(vec![Script::Gated(gate_rx)], |_| {});
        h.handle.start();
        h.wait_for_requests(1).await;

        assert!(h.handle.pause());
        gate_tx.send("\"Still here\"".to_string()).unwrap();
        drop(gate_tx);

        h.wait_for(|e| matches!(e, AgentEvent::Speech { text, .. } if text == "Still here"))
            .await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.client.request_count(), 1);
        assert_eq!(h.handle.status().state, RunState::Paused);

        h.handle.start();
        h.wait_for_requests(2).await;
        let resumed = h.client.request(1);
        assert!(resumed
            .iter()
            .any(|m| m.content == "I said to the User: Still here"));

        h.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_mid_quote_flushes_incomplete_speech_and_persists_once() {
        let (gate_tx, gate_rx) = flume::unbounded();
        let mut h = Harness::new(vec![Script::Gated(gate_rx)], |_| {});
        h.handle.start();
        h.wait_for_requests(1).await;

        gate_tx
            .send("I think \"I was about to".to_string())
            .unwrap();
        h.wait_for(|e| is_thought(e, "I think ")).await;

        let h = h.shutdown().await;
        drop(gate_tx);

        assert_eq!(
            h.count(|e| *e
                == AgentEvent::Speech {
                    text: "I was about to".to_string(),
                    sender: "Reverie".to_string(),
                    complete: false,
                }),
            1
        );
        assert_eq!(h.count(|e| matches!(e, AgentEvent::MemorySaved { .. })), 1);
        assert_eq!(h.client.generate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.recent(10).unwrap().len(), 1);
        assert_eq!(
            h.seen.last(),
            Some(&AgentEvent::StateChanged(RunState::Terminated))
        );
        assert_eq!(h.handle.state(), RunState::Terminated);
        assert!(!h.handle.start());
    }

    #[tokio::test]
    async fn missing_prompt_aborts_start_without_side_effects() {
        let mut h = Harness::new(vec![], |config| {
            config.prompt_path = "/definitely/not/here/prompt.txt".to_string();
        });
        h.handle.start();

        let error = h.wait_for(|e| matches!(e, AgentEvent::Error(_))).await;
        assert!(matches!(error, AgentEvent::Error(ref msg) if msg.contains("not found")));
        h.wait_for(|e| *e == AgentEvent::StateChanged(RunState::Paused))
            .await;
        assert_eq!(h.handle.state(), RunState::Paused);
        assert_eq!(h.client.request_count(), 0);

        let h = h.shutdown().await;
        assert_eq!(h.count(|e| matches!(e, AgentEvent::MemorySaved { .. })), 0);
        assert!(h.store.recent(3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn ended_session_seeds_the_next_one() {
        let mut h = Harness::with_summary(
            vec![Script::Fragments(vec!["pondering the sea"])],
            "I pondered the sea.",
            |_| {},
        );
        h.handle.start();
        h.wait_for(|e| is_thought(e, "pondering the sea")).await;
        h.wait_for_requests(2).await;

        h.handle.end_session();
        h.wait_for(|e| matches!(e, AgentEvent::MemorySaved { .. }))
            .await;
        h.wait_for(|e| *e == AgentEvent::StateChanged(RunState::Paused))
            .await;
        assert_eq!(h.store.recent(3).unwrap()[0].summary, "I pondered the sea.");

        h.handle.start();
        h.wait_for_requests(3).await;
        let next_session = h.client.request(2);
        assert!(next_session[0].content.contains("PAST MEMORIES:"));
        assert!(next_session[0].content.contains("I pondered the sea."));
        assert!(!next_session
            .iter()
            .any(|m| m.content.contains("pondering the sea")));

        h.shutdown().await;
    }

    #[tokio::test]
    async fn handle_controls_and_status() {
        let h = Harness::new(vec![], |_| {});
        assert_eq!(h.handle.status().state, RunState::Paused);
        assert!(!h.handle.submit_user_text("   "));
        assert!(h.handle.submit_user_text("are you there?"));
        assert_eq!(h.handle.status().pending_inputs, 1);

        h.handle.set_thought_delay(Duration::from_millis(250));
        assert_eq!(h.handle.status().thought_delay_ms, 250);

        assert_eq!(h.handle.toggle(), RunState::Running);
        assert_eq!(h.handle.toggle(), RunState::Paused);
        assert!(!h.handle.pause());

        h.shutdown().await;
    }
}
