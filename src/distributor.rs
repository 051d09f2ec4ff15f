//! Task distribution and result collection.
//!
//! The distributor drives one testrun's worth of tasks from publish to
//! completion or timeout:
//!
//! ```text
//!  Distributor                      Broker                      Workers
//!       │                             │                            │
//!       │ declare response queue      │                            │
//!       │ probe worker queues ───────►│  (passive declare)         │
//!       │ publish Dispatch per task ─►│───────────────────────────►│
//!       │                             │                            │
//!       │ ◄── StateChange START ──────│◄───────────────────────────│
//!       │ ◄── Results / Monitor ──────│◄───────────────────────────│
//!       │ ◄── StateChange FINISH ─────│◄───────────────────────────│
//!       ▼                             │                            │
//!  DispatchOutcome                    │                            │
//! ```
//!
//! Dispatch and collection are decoupled per task: documents and monitor
//! events are folded into the outcome as they arrive, whichever task they
//! belong to. Two timeout windows guard the run:
//!
//! - **queue timeout**: no worker claimed *any* task after publishing.
//!   The pool's queue exists but nothing is serving it.
//! - **execution timeout**: some worker claimed a task but the full task
//!   set never finished. A worker accepted work and disappeared.
//!
//! On either timeout (or any broker failure mid-run) the outcome still
//! carries everything received up to that point; partial results are never
//! discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, MessageStream};
use crate::codec::{self, CodecError, DispatchMessage, Message};
use crate::environment::Environment;
use crate::event::{EventBus, TestrunEvent};
use crate::monitor::{MonitorEvent, MonitorKind};
use crate::routing::{self, RoutingKey};
use crate::task::{Task, TaskCondition};

/// Sender name the distributor stamps on its own monitor events.
const SENDER: &str = "distributor";

/// Timeout windows for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Window for the first worker to claim any task, counted from publish.
    pub queue_timeout: Duration,
    /// Global window for the whole task set to finish, counted from the
    /// first claim.
    pub execution_timeout: Duration,
}

/// One task paired with the routing key that selects its worker pool.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    /// The task to publish.
    pub task: Task,
    /// Worker-pool address; doubles as the dispatch queue name.
    pub routing_key: RoutingKey,
}

/// A raw results document received from a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedDocument {
    /// Test package the document covers.
    pub package: String,
    /// Environment the package ran in.
    pub environment: Environment,
    /// The XML document body, unparsed.
    pub content: String,
}

/// Errors that terminate a dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No broker queue exists for a targeted worker pool. Distinguishes "no
    /// worker registered for this device group" from "worker registered but
    /// slow".
    #[error("queue '{queue}' does not exist: no worker pool is registered for it")]
    QueueDoesNotExist {
        /// The missing queue's name.
        queue: String,
    },

    /// No worker claimed any dispatched task within the window.
    #[error("no worker started any task within {timeout:?}")]
    QueueTimeout {
        /// The configured window, for the caller's report.
        timeout: Duration,
    },

    /// A worker claimed a task but the task set never finished.
    #[error("started tasks did not finish within {timeout:?}")]
    ExecutionTimeout {
        /// The configured window, for the caller's report.
        timeout: Duration,
    },

    /// The broker failed mid-dispatch.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A message of ours could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Everything a dispatch produced.
///
/// Always populated as far as the run got: when [`error`](Self::error) is
/// set, the task states, documents and monitors collected before the
/// failure are still here.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Final observed state of every dispatched task.
    pub tasks: Vec<Task>,
    /// Results documents received, in arrival order.
    pub documents: Vec<ReceivedDocument>,
    /// Monitor events: received from workers plus the distributor's own.
    pub monitors: Vec<MonitorEvent>,
    /// The terminating error, if the dispatch did not complete normally.
    pub error: Option<DispatchError>,
}

impl DispatchOutcome {
    /// Returns `true` if every task finished and no error terminated the run.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.tasks.iter().all(Task::is_finished)
    }
}

enum Incoming {
    Message(Message),
    ConsumerFailed(BrokerError),
}

/// Publishes a testrun's tasks and collects what streams back.
///
/// One distributor instance serves one testrun; concurrent testruns each
/// get their own instance, response queue and event bus; there is no
/// shared mutable state between them.
pub struct Distributor<B> {
    broker: Arc<B>,
    config: DispatchConfig,
    bus: EventBus,
}

impl<B: Broker + 'static> Distributor<B> {
    /// Creates a distributor over the given broker.
    pub fn new(broker: Arc<B>, config: DispatchConfig, bus: EventBus) -> Self {
        Self {
            broker,
            config,
            bus,
        }
    }

    /// Dispatches the task set and drives it to completion or timeout.
    ///
    /// Never returns an `Err`: failures land in
    /// [`DispatchOutcome::error`] next to whatever was collected first.
    pub async fn dispatch(&self, testrun_id: &str, items: Vec<DispatchItem>) -> DispatchOutcome {
        let response_queue = routing::response_queue(testrun_id);
        let mut outcome = DispatchOutcome::default();
        let cancel = CancellationToken::new();

        let result = self
            .run(testrun_id, &response_queue, items, &cancel, &mut outcome)
            .await;
        cancel.cancel();

        if let Err(error) = result {
            warn!("testrun {testrun_id}: dispatch terminated: {error}");
            outcome.error = Some(error);
        }

        // The response queue is owned by this run; tear it down regardless
        // of how the run ended.
        if let Err(e) = self.broker.delete_queue(&response_queue).await {
            debug!("testrun {testrun_id}: could not delete {response_queue}: {e}");
        }
        self.bus.publish(TestrunEvent::Ended);
        outcome
    }

    async fn run(
        &self,
        testrun_id: &str,
        response_queue: &str,
        items: Vec<DispatchItem>,
        cancel: &CancellationToken,
        outcome: &mut DispatchOutcome,
    ) -> Result<(), DispatchError> {
        self.broker.declare_queue(response_queue).await?;

        // Probe every target queue before publishing anything: a missing
        // queue means no worker pool is registered for that routing key,
        // and dispatching the rest would only strand them.
        for item in &items {
            let queue = item.routing_key.as_str();
            if !self.broker.queue_exists(queue).await? {
                return Err(DispatchError::QueueDoesNotExist {
                    queue: queue.to_string(),
                });
            }
        }

        let stream = self
            .broker
            .consume(response_queue, &format!("distributor-{testrun_id}"))
            .await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, tx, cancel.clone()));

        let mut index: HashMap<String, usize> = HashMap::new();
        for item in &items {
            index.insert(item.task.id().to_string(), outcome.tasks.len());
            outcome.tasks.push(item.task.clone());
        }

        for item in &items {
            let payload = codec::encode(&Message::Dispatch(DispatchMessage {
                testrun_id: testrun_id.to_string(),
                task: item.task.clone(),
                response_queue: response_queue.to_string(),
            }))?;

            self.broker
                .publish(item.routing_key.as_str(), &payload)
                .await
                .map_err(|e| match e {
                    // Queue deleted between the probe and the publish: same
                    // failure path as a failed probe.
                    BrokerError::NotFound(queue) => DispatchError::QueueDoesNotExist { queue },
                    other => DispatchError::Broker(other),
                })?;

            info!(
                "testrun {testrun_id}: dispatched task {} ({} packages) to {}",
                item.task.id(),
                item.task.packages().len(),
                item.routing_key
            );
            self.bus.publish(TestrunEvent::TaskDispatched {
                task_id: item.task.id().to_string(),
            });
            outcome.monitors.push(MonitorEvent::new(
                MonitorKind::TaskDispatched,
                SENDER,
                format!("task {} -> {}", item.task.id(), item.routing_key),
            ));
        }

        // Collection. The deadline is the queue window until the first
        // worker claims a task, then the global execution window.
        let queue_deadline = Instant::now() + self.config.queue_timeout;
        let mut exec_deadline: Option<Instant> = None;

        while !outcome.tasks.iter().all(Task::is_finished) {
            let deadline = exec_deadline.unwrap_or(queue_deadline);
            let incoming = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    return Err(match exec_deadline {
                        None => DispatchError::QueueTimeout {
                            timeout: self.config.queue_timeout,
                        },
                        Some(_) => DispatchError::ExecutionTimeout {
                            timeout: self.config.execution_timeout,
                        },
                    });
                }
                Ok(None) => {
                    return Err(BrokerError::Consume(
                        "response stream ended before all tasks finished".to_string(),
                    )
                    .into());
                }
                Ok(Some(incoming)) => incoming,
            };

            let message = match incoming {
                Incoming::Message(message) => message,
                Incoming::ConsumerFailed(e) => return Err(e.into()),
            };

            match message {
                Message::StateChange(change) => {
                    let Some(&slot) = index.get(&change.task_id) else {
                        warn!(
                            "testrun {testrun_id}: state change for unknown task {}",
                            change.task_id
                        );
                        continue;
                    };
                    let task = &mut outcome.tasks[slot];
                    match task.transition(change.condition) {
                        Ok(()) => match change.condition {
                            TaskCondition::Start => {
                                debug!("testrun {testrun_id}: task {} started", task.id());
                                if exec_deadline.is_none() {
                                    exec_deadline =
                                        Some(Instant::now() + self.config.execution_timeout);
                                }
                                self.bus.publish(TestrunEvent::TaskStarted {
                                    task_id: change.task_id.clone(),
                                });
                                outcome.monitors.push(MonitorEvent::new(
                                    MonitorKind::TaskStarted,
                                    SENDER,
                                    format!("task {}", change.task_id),
                                ));
                            }
                            TaskCondition::Finish => {
                                debug!("testrun {testrun_id}: task {} finished", task.id());
                                self.bus.publish(TestrunEvent::TaskFinished {
                                    task_id: change.task_id.clone(),
                                });
                                outcome.monitors.push(MonitorEvent::new(
                                    MonitorKind::TaskFinished,
                                    SENDER,
                                    format!("task {}", change.task_id),
                                ));
                            }
                        },
                        Err(e) => {
                            warn!("testrun {testrun_id}: rejected wire transition: {e}");
                            outcome.monitors.push(MonitorEvent::new(
                                MonitorKind::WorkerError,
                                SENDER,
                                format!("rejected transition for task {}: {e}", change.task_id),
                            ));
                        }
                    }
                }
                Message::Results(results) => {
                    debug!(
                        "testrun {testrun_id}: results for {} on {}",
                        results.package, results.environment
                    );
                    self.bus.publish(TestrunEvent::DocumentReceived {
                        package: results.package.clone(),
                        environment: results.environment.clone(),
                    });
                    outcome.monitors.push(MonitorEvent::new(
                        MonitorKind::ResultsReceived,
                        SENDER,
                        format!("{} on {}", results.package, results.environment),
                    ));
                    outcome.documents.push(ReceivedDocument {
                        package: results.package,
                        environment: results.environment,
                        content: results.document,
                    });
                }
                Message::Monitor(mut event) => {
                    event.mark_received();
                    outcome.monitors.push(event);
                }
                Message::Error(report) => {
                    warn!(
                        "testrun {testrun_id}: worker error {}: {}",
                        report.code, report.message
                    );
                    outcome.monitors.push(MonitorEvent::new(
                        MonitorKind::WorkerError,
                        SENDER,
                        format!("worker error {}: {}", report.code, report.message),
                    ));
                }
                Message::Dispatch(_) => {
                    warn!("testrun {testrun_id}: dispatch message on response queue, ignoring");
                }
            }
        }

        info!("testrun {testrun_id}: all tasks finished");
        Ok(())
    }
}

async fn pump(
    mut stream: MessageStream,
    tx: mpsc::UnboundedSender<Incoming>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                None => break,
                Some(Ok(payload)) => match codec::decode(&payload) {
                    Ok(message) => {
                        if tx.send(Incoming::Message(message)).is_err() {
                            break;
                        }
                    }
                    // A payload we cannot decode is dropped whole; it must
                    // never half-apply.
                    Err(e) => warn!("dropping undecodable message: {e}"),
                },
                Some(Err(e)) => {
                    let _ = tx.send(Incoming::ConsumerFailed(e));
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::codec::{ErrorReport, ResultsMessage, StateChangeMessage};

    const WORKER_QUEUE: &str = "g1";

    fn config() -> DispatchConfig {
        DispatchConfig {
            queue_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(5),
        }
    }

    fn item(id: &str, environment: &str, priority: u32) -> DispatchItem {
        let properties = std::collections::BTreeMap::from([(
            "devicegroup".to_string(),
            WORKER_QUEUE.to_string(),
        )]);
        DispatchItem {
            task: Task::new(
                id,
                vec!["sanity-tests".into()],
                environment.into(),
                priority,
            ),
            routing_key: RoutingKey::from_properties(&properties).unwrap(),
        }
    }

    fn passing_doc() -> String {
        r#"<testresults version="1.0"><case name="t" result="PASS"/></testresults>"#.to_string()
    }

    async fn publish(broker: &MemoryBroker, queue: &str, message: &Message) {
        broker
            .publish(queue, &codec::encode(message).unwrap())
            .await
            .unwrap();
    }

    /// Worker double: claims every dispatched task, streams one results
    /// document, then finishes it. The worker queue must already exist.
    async fn run_worker(broker: MemoryBroker, tasks_expected: usize) {
        let mut stream = broker.consume(WORKER_QUEUE, "worker").await.unwrap();

        for _ in 0..tasks_expected {
            let payload = stream.next().await.unwrap().unwrap();
            let Message::Dispatch(dispatch) = codec::decode(&payload).unwrap() else {
                panic!("worker expected a dispatch message");
            };
            let reply = dispatch.response_queue;
            let task_id = dispatch.task.id().to_string();

            publish(
                &broker,
                &reply,
                &Message::StateChange(StateChangeMessage {
                    task_id: task_id.clone(),
                    condition: TaskCondition::Start,
                }),
            )
            .await;
            publish(
                &broker,
                &reply,
                &Message::Results(ResultsMessage {
                    package: dispatch.task.packages()[0].clone(),
                    environment: dispatch.task.environment().clone(),
                    document: passing_doc(),
                }),
            )
            .await;
            publish(
                &broker,
                &reply,
                &Message::Monitor(MonitorEvent::new(
                    MonitorKind::TaskStarted,
                    "worker",
                    "progress",
                )),
            )
            .await;
            publish(
                &broker,
                &reply,
                &Message::StateChange(StateChangeMessage {
                    task_id,
                    condition: TaskCondition::Finish,
                }),
            )
            .await;
        }
    }

    #[tokio::test]
    async fn test_dispatch_completes() {
        let broker = MemoryBroker::new();
        broker.declare_queue(WORKER_QUEUE).await.unwrap();
        tokio::spawn(run_worker(broker.clone(), 2));

        let distributor = Distributor::new(Arc::new(broker), config(), EventBus::new());
        let outcome = distributor
            .dispatch("42", vec![item("t1", "hardware", 0), item("t2", "host.hardware", 1)])
            .await;

        assert!(outcome.is_complete(), "error: {:?}", outcome.error);
        assert_eq!(outcome.documents.len(), 2);
        assert!(outcome.tasks.iter().all(Task::is_finished));
        // Worker monitor events got their receive stamp
        assert!(
            outcome
                .monitors
                .iter()
                .filter(|m| m.sender() == "worker")
                .all(|m| m.received().is_some())
        );
    }

    #[tokio::test]
    async fn test_missing_queue_fails_before_publish() {
        let broker = MemoryBroker::new();
        let distributor = Distributor::new(Arc::new(broker), config(), EventBus::new());

        let outcome = distributor.dispatch("43", vec![item("t1", "hardware", 0)]).await;
        match &outcome.error {
            Some(DispatchError::QueueDoesNotExist { queue }) => {
                assert_eq!(queue.as_str(), WORKER_QUEUE);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(outcome.documents.is_empty());
    }

    #[tokio::test]
    async fn test_queue_timeout_when_no_worker_starts() {
        let broker = MemoryBroker::new();
        broker.declare_queue(WORKER_QUEUE).await.unwrap();

        let config = DispatchConfig {
            queue_timeout: Duration::from_millis(100),
            execution_timeout: Duration::from_secs(5),
        };
        let distributor = Distributor::new(Arc::new(broker), config, EventBus::new());
        let outcome = distributor.dispatch("44", vec![item("t1", "hardware", 0)]).await;

        match &outcome.error {
            Some(DispatchError::QueueTimeout { timeout }) => {
                assert_eq!(*timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(outcome.documents.is_empty());
        assert!(!outcome.tasks[0].is_finished());
    }

    #[tokio::test]
    async fn test_execution_timeout_preserves_partials() {
        let broker = MemoryBroker::new();
        broker.declare_queue(WORKER_QUEUE).await.unwrap();

        // Worker claims the task and sends one document, then goes dark.
        let worker_broker = broker.clone();
        tokio::spawn(async move {
            let mut stream = worker_broker.consume(WORKER_QUEUE, "worker").await.unwrap();
            let payload = stream.next().await.unwrap().unwrap();
            let Message::Dispatch(dispatch) = codec::decode(&payload).unwrap() else {
                panic!("worker expected a dispatch message");
            };
            let reply = dispatch.response_queue;
            publish(
                &worker_broker,
                &reply,
                &Message::StateChange(StateChangeMessage {
                    task_id: dispatch.task.id().to_string(),
                    condition: TaskCondition::Start,
                }),
            )
            .await;
            publish(
                &worker_broker,
                &reply,
                &Message::Results(ResultsMessage {
                    package: "sanity-tests".into(),
                    environment: "hardware".into(),
                    document: passing_doc(),
                }),
            )
            .await;
        });

        let config = DispatchConfig {
            queue_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_millis(150),
        };
        let distributor = Distributor::new(Arc::new(broker), config, EventBus::new());
        let outcome = distributor.dispatch("45", vec![item("t1", "hardware", 0)]).await;

        assert!(matches!(
            outcome.error,
            Some(DispatchError::ExecutionTimeout { .. })
        ));
        // The document that arrived before the timeout is preserved.
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.tasks[0].state(), crate::task::TaskState::Started);
    }

    #[tokio::test]
    async fn test_undecodable_messages_are_dropped() {
        let broker = MemoryBroker::new();
        broker.declare_queue(WORKER_QUEUE).await.unwrap();

        let worker_broker = broker.clone();
        tokio::spawn(async move {
            let mut stream = worker_broker.consume(WORKER_QUEUE, "worker").await.unwrap();
            let payload = stream.next().await.unwrap().unwrap();
            let Message::Dispatch(dispatch) = codec::decode(&payload).unwrap() else {
                panic!("worker expected a dispatch message");
            };
            let reply = dispatch.response_queue;
            let task_id = dispatch.task.id().to_string();

            // Garbage first; the distributor must drop it and keep going.
            worker_broker.publish(&reply, b"not a message").await.unwrap();
            publish(
                &worker_broker,
                &reply,
                &Message::StateChange(StateChangeMessage {
                    task_id: task_id.clone(),
                    condition: TaskCondition::Start,
                }),
            )
            .await;
            publish(
                &worker_broker,
                &reply,
                &Message::StateChange(StateChangeMessage {
                    task_id,
                    condition: TaskCondition::Finish,
                }),
            )
            .await;
        });

        let distributor = Distributor::new(Arc::new(broker), config(), EventBus::new());
        let outcome = distributor.dispatch("46", vec![item("t1", "hardware", 0)]).await;
        assert!(outcome.is_complete(), "error: {:?}", outcome.error);
    }

    #[tokio::test]
    async fn test_worker_error_recorded_as_monitor() {
        let broker = MemoryBroker::new();
        broker.declare_queue(WORKER_QUEUE).await.unwrap();

        let worker_broker = broker.clone();
        tokio::spawn(async move {
            let mut stream = worker_broker.consume(WORKER_QUEUE, "worker").await.unwrap();
            let payload = stream.next().await.unwrap().unwrap();
            let Message::Dispatch(dispatch) = codec::decode(&payload).unwrap() else {
                panic!("worker expected a dispatch message");
            };
            let reply = dispatch.response_queue;
            let task_id = dispatch.task.id().to_string();

            publish(
                &worker_broker,
                &reply,
                &Message::StateChange(StateChangeMessage {
                    task_id: task_id.clone(),
                    condition: TaskCondition::Start,
                }),
            )
            .await;
            publish(
                &worker_broker,
                &reply,
                &Message::Error(ErrorReport {
                    code: 6001,
                    message: "conductor crashed".into(),
                    context: None,
                }),
            )
            .await;
            publish(
                &worker_broker,
                &reply,
                &Message::StateChange(StateChangeMessage {
                    task_id,
                    condition: TaskCondition::Finish,
                }),
            )
            .await;
        });

        let distributor = Distributor::new(Arc::new(broker), config(), EventBus::new());
        let outcome = distributor.dispatch("47", vec![item("t1", "hardware", 0)]).await;

        assert!(outcome.is_complete());
        assert!(
            outcome
                .monitors
                .iter()
                .any(|m| m.kind() == MonitorKind::WorkerError
                    && m.description().contains("6001"))
        );
    }
}
