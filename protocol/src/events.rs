//! # Structured Event Log
//!
//! Every decision a node takes emits one JSON record to an append-only
//! sink. The record names and fields are an external contract: the
//! experiment harness and the log analytics consume these files, compute
//! first-receipt latencies from `gossip_first_seen`, and reconstruct
//! peer-view churn from `peer_add`/`peer_update`/`peer_evict`. Renaming an
//! event here breaks tooling that never sees this source tree.
//!
//! Records are one line each, compact separators, flushed per line so a
//! SIGINT-killed node leaves a readable file:
//!
//! ```text
//! {"ts_ms":1719000000123,"event":"recv_ok","node_id":"…","peer":"127.0.0.1:9001","bytes":211,"msg_type":"GOSSIP","msg_id":"…"}
//! ```
//!
//! The sink serializes writes internally, so one handle can be shared
//! across tasks without further coordination. `null` fields are dropped
//! rather than written.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::clock::Clock;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

enum Sink {
    /// Append-only file, one record per line.
    File(Mutex<fs::File>),
    /// In-memory capture for tests and embedded harnesses.
    Memory(Mutex<Vec<Value>>),
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Append-only structured event sink for one node.
pub struct EventLog {
    node_id: String,
    clock: Clock,
    sink: Sink,
    /// Path of the backing file, when file-backed. Reported in
    /// `node_listening` so the harness can find the log it should tail.
    path: Option<PathBuf>,
}

impl EventLog {
    /// Opens a file-backed log under `dir`, creating the directory if
    /// needed. The file name embeds port, open timestamp, and an id
    /// prefix so repeated runs never collide:
    /// `node-{port}-{ts_ms}-{id8}.jsonl`.
    pub fn to_dir(
        dir: impl AsRef<Path>,
        port: u16,
        node_id: &str,
        clock: Clock,
    ) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let id8: String = node_id.chars().take(8).collect();
        let path = dir.join(format!("node-{}-{}-{}.jsonl", port, clock.now_ms(), id8));
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            node_id: node_id.to_string(),
            clock,
            sink: Sink::File(Mutex::new(file)),
            path: Some(path),
        })
    }

    /// An in-memory log. Tests assert against [`events`](Self::events),
    /// the same surface the external analytics read from files.
    pub fn memory(node_id: &str, clock: Clock) -> Self {
        Self {
            node_id: node_id.to_string(),
            clock,
            sink: Sink::Memory(Mutex::new(Vec::new())),
            path: None,
        }
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends one record. `fields` must be a JSON object; its entries
    /// are merged after the standard `ts_ms`/`event`/`node_id` triple,
    /// with `null` values dropped.
    pub fn log(&self, event: &str, fields: Value) {
        let mut record = Map::new();
        record.insert("ts_ms".to_string(), Value::from(self.clock.now_ms()));
        record.insert("event".to_string(), Value::from(event));
        record.insert("node_id".to_string(), Value::from(self.node_id.clone()));
        if let Value::Object(map) = fields {
            for (key, value) in map {
                if !value.is_null() {
                    record.insert(key, value);
                }
            }
        }
        let record = Value::Object(record);

        match &self.sink {
            Sink::File(file) => {
                let mut line = record.to_string();
                line.push('\n');
                let mut file = file.lock();
                // Best effort: a failing log write must not take the node down.
                if file.write_all(line.as_bytes()).is_err() {
                    tracing::warn!(event, "event log write failed");
                }
                let _ = file.flush();
            }
            Sink::Memory(events) => events.lock().push(record),
        }
    }

    /// Snapshot of everything logged so far (memory sink only; empty
    /// for file-backed logs).
    pub fn events(&self) -> Vec<Value> {
        match &self.sink {
            Sink::Memory(events) => events.lock().clone(),
            Sink::File(_) => Vec::new(),
        }
    }

    /// All records whose `event` field equals `name` (memory sink only).
    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|record| record.get("event").and_then(Value::as_str) == Some(name))
            .collect()
    }

    /// Flushes the backing file. Called once at shutdown, after the
    /// final `node_shutdown` record.
    pub fn flush(&self) {
        if let Sink::File(file) = &self.sink {
            let _ = file.lock().flush();
        }
    }
}
