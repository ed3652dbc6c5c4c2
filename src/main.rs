mod console;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use reverie_backend::config::AgentConfig;
use reverie_backend::runtime::BackendRuntime;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,reverie=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Reverie console starting...");

    let config = AgentConfig::load();
    let agent_name = config.agent_name.clone();
    let (event_tx, event_rx) = flume::unbounded();
    let mut runtime =
        BackendRuntime::bootstrap(config, event_tx).context("failed to bootstrap runtime")?;

    let agent_thread = runtime.spawn_agent_loop()?;
    let renderer = console::spawn_renderer(event_rx, std::io::stdout());

    println!(
        "{} is asleep. /start, /pause, /end, /delay <ms>, /status, /quit. Anything else is said aloud.",
        agent_name
    );

    let stdin = std::io::stdin();
    let result = console::run(stdin.lock(), &runtime.handle, std::io::stdout());

    // The loop persists the session before it reports termination.
    runtime.handle.shutdown();
    agent_thread
        .join()
        .map_err(|_| anyhow!("agent thread panicked"))?;
    renderer
        .join()
        .map_err(|_| anyhow!("renderer thread panicked"))?;

    result
}
