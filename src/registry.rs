//! Collaborator seams and the capability registry.
//!
//! The orchestration core talks to everything outside itself (identity
//! allocation, result persistence, monitor forwarding) through the narrow
//! traits defined here. Implementations are registered under a capability
//! name once at startup and resolved by name; an unknown name resolves to
//! `None`, which is a normal configuration outcome, not an error.
//!
//! # Built-in Implementations
//!
//! | Capability | Name | Implementation |
//! |------------|------|----------------|
//! | identity | `uuid` | [`UuidIdentity`] |
//! | result sink | `file` | [`FileResultSink`] |
//! | result sink | `log` | [`LogResultSink`] |
//! | monitor sink | `log` | [`LogMonitorSink`] |

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::distributor::ReceivedDocument;
use crate::monitor::MonitorEvent;
use crate::results::Verdict;

/// Allocates testrun identifiers.
///
/// Ids are opaque strings, unique across the system's lifetime.
pub trait IdentityAllocator: Send + Sync {
    /// Returns a fresh, never-before-issued testrun id.
    fn new_testrun_id(&self) -> String;
}

/// Receives a finished testrun's verdict and collected documents.
///
/// Implementations own their failure handling; a sink that cannot deliver
/// logs and moves on, it never fails the testrun that already happened.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Accepts the terminal verdict and every collected document.
    async fn accept(&self, testrun_id: &str, verdict: Verdict, documents: &[ReceivedDocument]);
}

/// Receives a finished testrun's monitor event stream.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    /// Accepts the full event stream, in collection order.
    async fn accept(&self, testrun_id: &str, events: &[MonitorEvent]);
}

/// UUIDv4-based [`IdentityAllocator`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdentity;

impl IdentityAllocator for UuidIdentity {
    fn new_testrun_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// [`ResultSink`] that writes each document under an output directory.
///
/// Files are named `<package>.<environment>.xml` inside a per-testrun
/// subdirectory. Parent directories are created as needed.
pub struct FileResultSink {
    output_dir: PathBuf,
}

impl FileResultSink {
    /// Creates a sink rooted at `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl ResultSink for FileResultSink {
    async fn accept(&self, testrun_id: &str, verdict: Verdict, documents: &[ReceivedDocument]) {
        let dir = self.output_dir.join(testrun_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("failed to create result directory {}: {e}", dir.display());
            return;
        }

        for document in documents {
            let name = format!("{}.{}.xml", document.package, document.environment);
            let path = dir.join(name);
            if let Err(e) = std::fs::write(&path, &document.content) {
                error!("failed to write {}: {e}", path.display());
            }
        }
        info!(
            "testrun {testrun_id}: verdict {verdict}, {} documents written to {}",
            documents.len(),
            dir.display()
        );
    }
}

/// [`ResultSink`] that only logs the verdict.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn accept(&self, testrun_id: &str, verdict: Verdict, documents: &[ReceivedDocument]) {
        info!(
            "testrun {testrun_id}: verdict {verdict} over {} documents",
            documents.len()
        );
    }
}

/// [`MonitorSink`] that logs each event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMonitorSink;

#[async_trait]
impl MonitorSink for LogMonitorSink {
    async fn accept(&self, testrun_id: &str, events: &[MonitorEvent]) {
        for event in events {
            info!("testrun {testrun_id}: {event}");
        }
    }
}

/// Name → implementation mapping for every capability kind.
///
/// Populated once at startup; [`resolve_result_sink`] and friends look a
/// name up without side effects.
///
/// [`resolve_result_sink`]: Self::resolve_result_sink
#[derive(Default)]
pub struct PluginRegistry {
    identities: HashMap<String, Arc<dyn IdentityAllocator>>,
    result_sinks: HashMap<String, Arc<dyn ResultSink>>,
    monitor_sinks: HashMap<String, Arc<dyn MonitorSink>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in implementations registered.
    ///
    /// `output_dir` roots the `file` result sink.
    pub fn with_defaults(output_dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();
        registry.register_identity("uuid", Arc::new(UuidIdentity));
        registry.register_result_sink("file", Arc::new(FileResultSink::new(output_dir)));
        registry.register_result_sink("log", Arc::new(LogResultSink));
        registry.register_monitor_sink("log", Arc::new(LogMonitorSink));
        registry
    }

    /// Registers an identity allocator under `name`.
    pub fn register_identity(&mut self, name: impl Into<String>, it: Arc<dyn IdentityAllocator>) {
        self.identities.insert(name.into(), it);
    }

    /// Registers a result sink under `name`.
    pub fn register_result_sink(&mut self, name: impl Into<String>, sink: Arc<dyn ResultSink>) {
        self.result_sinks.insert(name.into(), sink);
    }

    /// Registers a monitor sink under `name`.
    pub fn register_monitor_sink(&mut self, name: impl Into<String>, sink: Arc<dyn MonitorSink>) {
        self.monitor_sinks.insert(name.into(), sink);
    }

    /// Resolves an identity allocator, or `None` if nothing is registered
    /// under `name`.
    pub fn resolve_identity(&self, name: &str) -> Option<Arc<dyn IdentityAllocator>> {
        self.identities.get(name).cloned()
    }

    /// Resolves a result sink by name.
    pub fn resolve_result_sink(&self, name: &str) -> Option<Arc<dyn ResultSink>> {
        self.result_sinks.get(name).cloned()
    }

    /// Resolves a monitor sink by name.
    pub fn resolve_monitor_sink(&self, name: &str) -> Option<Arc<dyn MonitorSink>> {
        self.monitor_sinks.get(name).cloned()
    }
}
