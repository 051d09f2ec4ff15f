//! farmout: a distributed test dispatcher.
//!
//! This crate orchestrates test suites across a pool of remote workers
//! (hardware devices and the hosts driving them), dispatching work over a
//! message broker and folding the XML results that stream back into a
//! single pass/fail verdict.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Routing** ([`routing`]): device properties → routing key and
//!   per-testrun response queue
//! - **Codec** ([`codec`]): versioned DTOs crossing the broker boundary
//! - **Broker** ([`broker`]): the transport seam (AMQP or in-process)
//! - **Distributor** ([`distributor`]): publishes tasks, enforces queue and
//!   execution timeouts, collects results
//! - **Results** ([`results`]): schema validation, significant/insignificant
//!   classification, verdict aggregation
//! - **Hub** ([`hub`]): top-level testrun sequencing
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use farmout::broker::amqp::AmqpBroker;
//! use farmout::event::EventBus;
//! use farmout::hub::{Hub, TestrunOptions};
//! use farmout::registry::PluginRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(AmqpBroker::connect("amqp://localhost").await?);
//!     let registry = PluginRegistry::with_defaults("test-results");
//!
//!     let hub = Hub::new(
//!         broker,
//!         farmout::config::DispatchSettings::default().dispatch_config(),
//!         registry.resolve_identity("uuid").unwrap(),
//!         registry.resolve_result_sink("file").unwrap(),
//!         registry.resolve_monitor_sink("log").unwrap(),
//!     );
//!
//!     let device = BTreeMap::from([("devicegroup".to_string(), "g1".to_string())]);
//!     let options = TestrunOptions::new(device)
//!         .with_packages("hardware", vec!["sanity-tests".into()]);
//!
//!     let summary = hub.run(options, EventBus::new()).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod distributor;
pub mod environment;
pub mod event;
pub mod hub;
pub mod monitor;
pub mod registry;
pub mod report;
pub mod results;
pub mod routing;
pub mod task;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use distributor::{DispatchConfig, DispatchError, DispatchOutcome, Distributor};
pub use environment::Environment;
pub use hub::{Hub, TestrunOptions, TestrunStatus, TestrunSummary};
pub use results::{PackageResults, Verdict};
pub use routing::RoutingKey;
pub use task::{Task, TaskCondition, TaskState};
