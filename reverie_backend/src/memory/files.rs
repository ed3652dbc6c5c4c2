use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

use super::{next_record_id, MemoryRecord, MemoryStore};
use crate::error::AgentError;

const FILE_PREFIX: &str = "memory_";
const FILE_SUFFIX: &str = ".json";

/// One pretty-printed JSON file per record: `memory_<millis>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create memory folder {:?}", dir))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: i64) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, id, FILE_SUFFIX))
    }

    /// Record files sorted by id, oldest first.
    fn record_files(&self) -> Result<Vec<(i64, PathBuf)>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list memory folder {:?}", self.dir))?;

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_record_id) else {
                continue;
            };
            files.push((id, entry.path()));
        }

        files.sort_by_key(|(id, _)| *id);
        Ok(files)
    }

    fn read_record(id: i64, path: &Path) -> Result<MemoryRecord> {
        let contents = fs::read_to_string(path)?;
        let mut record: MemoryRecord = serde_json::from_str(&contents)?;
        record.id = id;
        Ok(record)
    }
}

impl MemoryStore for JsonFileStore {
    fn backend_name(&self) -> &'static str {
        "json"
    }

    fn recent(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let files = self.record_files()?;
        let skip = files.len().saturating_sub(limit);

        let mut records = Vec::new();
        for (id, path) in files.into_iter().skip(skip) {
            match Self::read_record(id, &path) {
                Ok(record) => records.push(record),
                Err(source) => {
                    let error = AgentError::MemoryStoreRead {
                        location: path.display().to_string(),
                        source,
                    };
                    tracing::warn!("Skipping memory record: {}", error);
                }
            }
        }
        Ok(records)
    }

    fn persist(&self, summary: &str) -> Result<MemoryRecord> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("memory write lock poisoned"))?;

        let last = self.record_files()?.last().map(|(id, _)| *id);
        let mut id = next_record_id(Utc::now().timestamp_millis(), last);

        loop {
            let record = MemoryRecord::new(id, summary);
            let path = self.path_for(id);
            let file = OpenOptions::new().write(true).create_new(true).open(&path);
            let mut file = match file {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    id += 1;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {:?}", path));
                }
            };

            let json = record_json(&record)?;
            file.write_all(&json)
                .with_context(|| format!("Failed to write {:?}", path))?;

            tracing::info!("Memory saved: {:?}", path);
            return Ok(record);
        }
    }
}

/// Four-space indented, the layout existing memory folders already use.
fn record_json(record: &MemoryRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    record
        .serialize(&mut ser)
        .context("Failed to serialize memory")?;
    Ok(buf)
}

fn parse_record_id(file_name: &str) -> Option<i64> {
    file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}
