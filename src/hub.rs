//! Testrun coordination.
//!
//! The hub is the top-level sequencer for one orchestration:
//!
//! 1. Allocate a testrun id (via the [`IdentityAllocator`] collaborator)
//! 2. Build the task set from the caller's package/environment options,
//!    device targets before host targets
//! 3. Drive the [`Distributor`] to completion or timeout
//! 4. Feed every collected document through the [`ResultsPipeline`];
//!    schema failures are recorded per document and never abort the rest
//! 5. Forward the verdict and the monitor stream to the configured sinks
//!
//! A testrun always terminates with exactly one status: a [`Verdict`]
//! (PASS / FAIL / NO_CASES) or the dispatch error that cut it short. In the
//! error case everything received before the cut still gets aggregated and
//! forwarded; partial results are never silently discarded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::distributor::{DispatchConfig, DispatchError, DispatchItem, Distributor};
use crate::environment::Environment;
use crate::event::EventBus;
use crate::monitor::{MonitorEvent, MonitorKind};
use crate::registry::{IdentityAllocator, MonitorSink, ResultSink};
use crate::results::{PackageResults, ResultsPipeline, SchemaValidationError, Verdict};
use crate::routing::{InvalidPropertiesError, RoutingKey};
use crate::task::Task;

/// Sender name the hub stamps on its own monitor events.
const SENDER: &str = "hub";

/// Lifecycle phases of one testrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestrunPhase {
    /// Id allocated, task set not yet published.
    Created,
    /// Task set handed to the distributor.
    Dispatched,
    /// Collected documents are being validated and aggregated.
    Collecting,
    /// Terminal status reached and forwarded. Terminal.
    Finished,
}

/// The testrun record the hub owns for the lifetime of one orchestration.
struct Testrun {
    id: String,
    phase: TestrunPhase,
}

impl Testrun {
    fn new(id: &str) -> Self {
        debug!("testrun {id}: created");
        Self {
            id: id.to_string(),
            phase: TestrunPhase::Created,
        }
    }

    fn advance(&mut self, next: TestrunPhase) {
        debug!("testrun {}: {:?} -> {next:?}", self.id, self.phase);
        self.phase = next;
    }
}

/// User-supplied options for one testrun.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use farmout::hub::TestrunOptions;
///
/// let device = BTreeMap::from([("devicegroup".to_string(), "g1".to_string())]);
/// let options = TestrunOptions::new(device)
///     .with_packages("hardware", vec!["sanity-tests".into()])
///     .with_packages("host.hardware", vec!["host-tests".into()])
///     .with_insignificant_tests_matter(true);
/// # let _ = options;
/// ```
#[derive(Debug, Clone)]
pub struct TestrunOptions {
    /// Device properties the routing key is derived from.
    pub device_properties: BTreeMap<String, String>,
    /// Test packages per environment, in the order supplied.
    pub packages: Vec<(Environment, Vec<String>)>,
    /// Whether insignificant cases count toward the verdict.
    pub insignificant_tests_matter: bool,
}

impl TestrunOptions {
    /// Creates options targeting the given device properties.
    pub fn new(device_properties: BTreeMap<String, String>) -> Self {
        Self {
            device_properties,
            packages: Vec::new(),
            insignificant_tests_matter: false,
        }
    }

    /// Adds a package list for one environment.
    pub fn with_packages(
        mut self,
        environment: impl Into<Environment>,
        packages: Vec<String>,
    ) -> Self {
        self.packages.push((environment.into(), packages));
        self
    }

    /// Sets whether insignificant cases count toward the verdict.
    pub fn with_insignificant_tests_matter(mut self, matter: bool) -> Self {
        self.insignificant_tests_matter = matter;
        self
    }
}

/// One results document that failed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaFailure {
    /// Package the rejected document covered.
    pub package: String,
    /// Environment the package ran in.
    pub environment: Environment,
    /// Why the document was rejected.
    pub error: SchemaValidationError,
}

/// Terminal status of a testrun.
#[derive(Debug)]
pub enum TestrunStatus {
    /// Dispatch and collection completed; this is the aggregate verdict.
    Verdict(Verdict),
    /// Dispatch was cut short; partial results were still aggregated.
    Failed(DispatchError),
}

impl std::fmt::Display for TestrunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestrunStatus::Verdict(verdict) => write!(f, "{verdict}"),
            TestrunStatus::Failed(error) => write!(f, "{error}"),
        }
    }
}

/// Everything one testrun produced.
///
/// # Exit Codes
///
/// [`exit_code`](Self::exit_code) maps the status to conventional codes:
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | PASS |
/// | 1 | FAIL |
/// | 2 | NO_CASES, nothing contributed to the verdict |
/// | 3 | a queue/timeout/broker error terminated the run |
#[derive(Debug)]
pub struct TestrunSummary {
    /// The allocated testrun id.
    pub testrun_id: String,
    /// The single terminal status.
    pub status: TestrunStatus,
    /// Aggregate verdict over every valid document (partial set if the run
    /// was cut short).
    pub verdict: Verdict,
    /// Classified results per (package, environment).
    pub package_results: Vec<PackageResults>,
    /// Documents rejected by schema validation.
    pub schema_failures: Vec<SchemaFailure>,
    /// Final observed task states.
    pub tasks: Vec<Task>,
    /// The full monitor event stream.
    pub monitors: Vec<MonitorEvent>,
    /// Wall-clock duration of the whole testrun.
    pub duration: Duration,
}

impl TestrunSummary {
    /// Returns `true` iff the testrun completed and every contributing
    /// document passed.
    pub fn success(&self) -> bool {
        matches!(self.status, TestrunStatus::Verdict(Verdict::Pass))
    }

    /// Returns the conventional process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            TestrunStatus::Verdict(Verdict::Pass) => 0,
            TestrunStatus::Verdict(Verdict::Fail) => 1,
            TestrunStatus::Verdict(Verdict::NoCases) => 2,
            TestrunStatus::Failed(_) => 3,
        }
    }
}

/// Top-level coordinator tying the distributor, the results pipeline and
/// the external sinks together.
///
/// # Type Parameters
///
/// - `B`: the broker implementation tasks are dispatched over
pub struct Hub<B> {
    broker: Arc<B>,
    config: DispatchConfig,
    identity: Arc<dyn IdentityAllocator>,
    result_sink: Arc<dyn ResultSink>,
    monitor_sink: Arc<dyn MonitorSink>,
}

impl<B: Broker + 'static> Hub<B> {
    /// Creates a hub with the given collaborators.
    pub fn new(
        broker: Arc<B>,
        config: DispatchConfig,
        identity: Arc<dyn IdentityAllocator>,
        result_sink: Arc<dyn ResultSink>,
        monitor_sink: Arc<dyn MonitorSink>,
    ) -> Self {
        Self {
            broker,
            config,
            identity,
            result_sink,
            monitor_sink,
        }
    }

    /// Runs one testrun to its terminal status.
    ///
    /// `bus` receives the run's lifecycle events; subscribe before calling
    /// to observe progress. Concurrent testruns are independent: each call
    /// allocates its own id, response queue and task set.
    ///
    /// # Errors
    ///
    /// [`InvalidPropertiesError`] if the device properties cannot produce a
    /// routing key; nothing is dispatched in that case.
    pub async fn run(
        &self,
        options: TestrunOptions,
        bus: EventBus,
    ) -> Result<TestrunSummary, InvalidPropertiesError> {
        let start = std::time::Instant::now();

        // Bad properties must be rejected before anything is published.
        let routing_key = RoutingKey::from_properties(&options.device_properties)?;

        let testrun_id = self.identity.new_testrun_id();
        let mut testrun = Testrun::new(&testrun_id);
        let mut monitors = vec![MonitorEvent::new(
            MonitorKind::TestrunRequested,
            SENDER,
            format!("routing key {routing_key}"),
        )];

        let items = build_tasks(&testrun_id, &options, &routing_key);
        info!(
            "testrun {testrun_id}: {} tasks for routing key {routing_key}",
            items.len()
        );

        let distributor = Distributor::new(self.broker.clone(), self.config, bus);
        testrun.advance(TestrunPhase::Dispatched);
        let mut outcome = distributor.dispatch(&testrun_id, items).await;

        testrun.advance(TestrunPhase::Collecting);
        let pipeline = ResultsPipeline::new(options.insignificant_tests_matter);
        let mut package_results = Vec::new();
        let mut schema_failures = Vec::new();
        let mut judgments = Vec::new();

        for document in &outcome.documents {
            match pipeline.process(&document.package, &document.environment, &document.content) {
                Ok(processed) => {
                    judgments.push(processed.judgment);
                    package_results.push(processed.results);
                }
                Err(error) => {
                    // A rejected document is a per-document failure; the
                    // remaining documents still count.
                    warn!(
                        "testrun {testrun_id}: invalid results for {} on {}: {error}",
                        document.package, document.environment
                    );
                    schema_failures.push(SchemaFailure {
                        package: document.package.clone(),
                        environment: document.environment.clone(),
                        error,
                    });
                }
            }
        }

        let verdict = Verdict::aggregate(judgments);
        let status = match outcome.error.take() {
            Some(error) => TestrunStatus::Failed(error),
            None => TestrunStatus::Verdict(verdict),
        };

        monitors.append(&mut outcome.monitors);
        monitors.push(MonitorEvent::new(
            MonitorKind::TestrunEnded,
            SENDER,
            format!("status {status}"),
        ));

        self.result_sink
            .accept(&testrun_id, verdict, &outcome.documents)
            .await;
        self.monitor_sink.accept(&testrun_id, &monitors).await;

        testrun.advance(TestrunPhase::Finished);
        info!("testrun {testrun_id}: {status}");

        Ok(TestrunSummary {
            testrun_id,
            status,
            verdict,
            package_results,
            schema_failures,
            tasks: outcome.tasks,
            monitors,
            duration: start.elapsed(),
        })
    }
}

/// Builds the dispatch items for a testrun: one task per environment with a
/// non-empty package list, device targets before host targets, priority in
/// emission order.
fn build_tasks(
    testrun_id: &str,
    options: &TestrunOptions,
    routing_key: &RoutingKey,
) -> Vec<DispatchItem> {
    let (host, device): (Vec<_>, Vec<_>) = options
        .packages
        .iter()
        .filter(|(_, packages)| !packages.is_empty())
        .partition(|(environment, _)| environment.is_host());

    device
        .into_iter()
        .chain(host)
        .enumerate()
        .map(|(ordinal, (environment, packages))| DispatchItem {
            task: Task::new(
                format!("{testrun_id}.{ordinal}"),
                packages.clone(),
                environment.clone(),
                ordinal as u32,
            ),
            routing_key: routing_key.clone(),
        })
        .collect()
}
