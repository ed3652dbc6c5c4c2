use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use flume::Sender;

use crate::agent::{Agent, AgentEvent, AgentHandle};
use crate::config::AgentConfig;
use crate::llm_client::{CompletionClient, LlmClient};
use crate::memory::{self, MemoryStore};

pub struct BackendRuntime {
    pub config: AgentConfig,
    pub handle: AgentHandle,
    pub store: Arc<dyn MemoryStore>,
    agent: Option<Agent>,
}

pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    event_tx: Sender<AgentEvent>,
    client: Option<Arc<dyn CompletionClient>>,
    store: Option<Arc<dyn MemoryStore>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Self {
        Self {
            config,
            event_tx,
            client: None,
            store: None,
        }
    }

    /// Use this completion client instead of the configured HTTP endpoint.
    pub fn with_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let client = match self.client {
            Some(client) => client,
            None => {
                tracing::info!(
                    "Completion endpoint: {} (model {})",
                    config.llm_api_url,
                    config.llm_model
                );
                Arc::new(LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone(),
                    config.llm_model.clone(),
                ))
            }
        };

        let store = match self.store {
            Some(store) => store,
            None => memory::open_store(&config).context("Failed to open memory store")?,
        };

        let (agent, handle) = Agent::new(config.clone(), client, store.clone(), self.event_tx);

        Ok(BackendRuntime {
            config,
            handle,
            store,
            agent: Some(agent),
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Run the agent loop on its own thread with its own tokio runtime. The
    /// thread exits once the loop has terminated and persisted its memory.
    pub fn spawn_agent_loop(&mut self) -> Result<JoinHandle<()>> {
        let agent = self
            .agent
            .take()
            .context("Agent loop already spawned")?;
        let rt = tokio::runtime::Runtime::new().context("Failed to start agent runtime")?;

        std::thread::Builder::new()
            .name("reverie-agent".to_string())
            .spawn(move || {
                rt.block_on(agent.run_loop());
                tracing::debug!("Agent thread exiting");
            })
            .context("Failed to spawn agent thread")
    }
}
