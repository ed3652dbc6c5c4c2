pub mod files;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, MemoryBackendKind};

pub use files::JsonFileStore;
pub use sqlite::SqliteStore;

pub const RECORD_TYPE: &str = "Conversation Summary";
pub const NO_MEMORIES: &str = "No previous memories.";

/// One consolidated session, written once and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Time-based identifier; strictly increasing in creation order.
    #[serde(skip)]
    pub id: i64,
    pub timestamp: DateTime<Local>,
    #[serde(rename = "type", default = "default_record_type")]
    pub record_type: String,
    pub summary: String,
}

fn default_record_type() -> String {
    RECORD_TYPE.to_string()
}

impl MemoryRecord {
    pub fn new(id: i64, summary: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: Local::now(),
            record_type: RECORD_TYPE.to_string(),
            summary: summary.into(),
        }
    }
}

/// Durable storage for session memories.
///
/// Backends skip records they cannot read rather than failing the whole load.
pub trait MemoryStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// The `limit` most recent records, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<MemoryRecord>>;

    fn persist(&self, summary: &str) -> Result<MemoryRecord>;
}

/// Recent memories as a single prompt block, or the "no memories" sentinel.
pub fn load_recent(store: &dyn MemoryStore, limit: usize) -> String {
    match store.recent(limit) {
        Ok(records) => format_memories(&records),
        Err(e) => {
            tracing::warn!("Failed to load memories from {}: {:#}", store.backend_name(), e);
            NO_MEMORIES.to_string()
        }
    }
}

pub fn format_memories(records: &[MemoryRecord]) -> String {
    if records.is_empty() {
        return NO_MEMORIES.to_string();
    }

    let mut block = String::from("PAST MEMORIES:\n");
    for record in records {
        block.push_str(&format!(
            "[{}] {}\n",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.summary
        ));
    }
    block
}

/// Next identifier: the current time in millis, bumped past `last` if needed.
pub(crate) fn next_record_id(now_millis: i64, last: Option<i64>) -> i64 {
    match last {
        Some(last) if last >= now_millis => last + 1,
        _ => now_millis,
    }
}

pub fn open_store(config: &AgentConfig) -> Result<Arc<dyn MemoryStore>> {
    let store: Arc<dyn MemoryStore> = match config.memory_backend {
        MemoryBackendKind::Json => Arc::new(JsonFileStore::new(&config.memory_dir)?),
        MemoryBackendKind::Sqlite => Arc::new(SqliteStore::new(&config.database_path)?),
    };
    tracing::info!("Memory store ready ({})", store.backend_name());
    Ok(store)
}
