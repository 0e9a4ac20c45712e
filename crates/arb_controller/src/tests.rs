use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arb_registry::{Discovered, RegistryConfig, TrackedInstance};
use async_trait::async_trait;
use core_types::{
    AddressState, CycleOutcome, InstanceCatalog, InstanceDefinition, InstanceDependencies, Ledger,
    LedgerEvent, PriceOracle, ProjectionSnapshot, RejectReason, Request, ResponseFinalized,
    SimulatedResponse, Simulator, TxId, BASE_ASSET, SYNTHETIC_TX_ID,
};
use infra_mutex::{Serializer, DECISION_LOCK, STATE_LOCK};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use state_projection::StateProjection;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use watchdog_lock::{ExpiryHook, WatchdogExpiry, WatchdogLock};

use crate::{Collaborators, ControllerConfig, ReactiveController};

const OPERATOR: &str = "OPERATOR";

#[derive(Debug, Clone)]
enum Script {
    Profit(f64),
    Bounce(&'static str),
    Overdraw,
}

struct FakeSimulator {
    script: Mutex<Script>,
    fanout: HashMap<String, Vec<String>>,
    delay: Duration,
    inside: AtomicUsize,
    max_inside: AtomicUsize,
    seen_pool_balances: Mutex<Vec<i64>>,
}

impl FakeSimulator {
    fn new(script: Script, delay: Duration) -> Self {
        let mut fanout = HashMap::new();
        fanout.insert("POOL1".to_string(), vec!["CURVE1".to_string()]);
        Self {
            script: Mutex::new(script),
            fanout,
            delay,
            inside: AtomicUsize::new(0),
            max_inside: AtomicUsize::new(0),
            seen_pool_balances: Mutex::new(Vec::new()),
        }
    }
}

fn profit_vars(profit: f64) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("profit".to_string(), json!(profit));
    vars
}

#[async_trait]
impl Simulator for FakeSimulator {
    async fn simulate(
        &self,
        request: &Request,
        target: &str,
        snapshot: &mut ProjectionSnapshot,
    ) -> Result<Vec<SimulatedResponse>> {
        if request.tx_id == SYNTHETIC_TX_ID {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside.fetch_max(now, Ordering::SeqCst);
            self.seen_pool_balances
                .lock()
                .push(snapshot.balance("POOL1", BASE_ASSET));
            tokio::time::sleep(self.delay).await;
            self.inside.fetch_sub(1, Ordering::SeqCst);

            let script = self.script.lock().clone();
            return Ok(match script {
                Script::Profit(profit) => {
                    vec![SimulatedResponse::succeeded(target, profit_vars(profit))]
                }
                Script::Bounce(error) => vec![SimulatedResponse::bounced(target, error)],
                Script::Overdraw => {
                    snapshot.credit(target, "stable", -10);
                    vec![SimulatedResponse::succeeded(target, profit_vars(5.0))]
                }
            });
        }

        snapshot.credit(target, BASE_ASSET, request.amount as i64);
        snapshot.set_state_var(target, "last_trigger", json!(request.tx_id));
        let mut out = vec![SimulatedResponse::succeeded(target, Map::new())];
        for extra in self.fanout.get(target).into_iter().flatten() {
            out.push(SimulatedResponse::succeeded(extra, Map::new()));
        }
        Ok(out)
    }
}

struct FakeLedger {
    serializer: Arc<Serializer>,
    watchdog: Arc<WatchdogLock>,
    refuse: AtomicBool,
    next: AtomicU64,
    submissions: Mutex<Vec<Request>>,
    unlocked_submissions: AtomicUsize,
    payments: Mutex<Vec<(String, u64)>>,
    states: Mutex<HashMap<String, AddressState>>,
}

impl FakeLedger {
    fn new(serializer: Arc<Serializer>, watchdog: Arc<WatchdogLock>) -> Self {
        Self {
            serializer,
            watchdog,
            refuse: AtomicBool::new(false),
            next: AtomicU64::new(1),
            submissions: Mutex::new(Vec::new()),
            unlocked_submissions: AtomicUsize::new(0),
            payments: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    fn set_balance(&self, address: &str, base: i64) {
        self.states.lock().insert(
            address.to_string(),
            AddressState {
                balances: [(BASE_ASSET.to_string(), base)].into_iter().collect(),
                ..AddressState::default()
            },
        );
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn submit_request(
        &self,
        target: &str,
        amount: u64,
        payload: &Value,
    ) -> Result<Option<TxId>> {
        if !(self.watchdog.is_held() && self.serializer.is_locked(DECISION_LOCK)) {
            self.unlocked_submissions.fetch_add(1, Ordering::SeqCst);
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let tx_id = format!("OWN-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.submissions.lock().push(Request {
            tx_id: tx_id.clone(),
            author: OPERATOR.to_string(),
            target: target.to_string(),
            amount,
            payload: payload.clone(),
        });
        Ok(Some(tx_id))
    }

    async fn read_transaction(&self, tx_id: &str) -> Result<Request> {
        self.submissions
            .lock()
            .iter()
            .find(|r| r.tx_id == tx_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown transaction {tx_id}"))
    }

    async fn read_address_state(&self, address: &str) -> Result<AddressState> {
        Ok(self.states.lock().get(address).cloned().unwrap_or_default())
    }

    async fn send_payment(&self, to: &str, amount: u64) -> Result<Option<TxId>> {
        self.payments.lock().push((to.to_string(), amount));
        Ok(Some(format!(
            "PAY-{}",
            self.next.fetch_add(1, Ordering::SeqCst)
        )))
    }
}

#[derive(Default)]
struct FakeCatalog {
    deps: HashMap<String, InstanceDependencies>,
}

#[async_trait]
impl InstanceCatalog for FakeCatalog {
    async fn instances_by_base(&self, _bases: &[String]) -> Result<Vec<InstanceDefinition>> {
        Ok(Vec::new())
    }

    async fn definition(&self, address: &str) -> Result<InstanceDefinition> {
        anyhow::bail!("no definition for {address}")
    }

    async fn dependencies(&self, definition: &InstanceDefinition) -> Result<InstanceDependencies> {
        Ok(self
            .deps
            .get(&definition.address)
            .cloned()
            .unwrap_or_default())
    }
}

struct UnitOracle;

impl PriceOracle for UnitOracle {
    fn to_reference(&self, asset: &str, amount: f64) -> Option<f64> {
        (asset == BASE_ASSET).then_some(amount)
    }
}

struct Fixture {
    ctl: Arc<ReactiveController>,
    sim: Arc<FakeSimulator>,
    ledger: Arc<FakeLedger>,
    serializer: Arc<Serializer>,
    watchdog: Arc<WatchdogLock>,
    _dir: TempDir,
}

impl Fixture {
    fn locks_released(&self) -> bool {
        !self.serializer.is_locked(DECISION_LOCK)
            && !self.serializer.is_locked(STATE_LOCK)
            && !self.watchdog.is_held()
    }
}

fn discovered(address: &str, trigger: &[&str], pools: &[&str]) -> Discovered {
    let deps = InstanceDependencies {
        trigger: trigger.iter().map(|s| s.to_string()).collect(),
        pools: pools.iter().map(|s| s.to_string()).collect(),
        ..InstanceDependencies::default()
    };
    let mut followed = vec![address.to_string()];
    followed.extend(deps.trigger.iter().cloned());
    Discovered {
        instance: TrackedInstance::new(address, true).with_dependencies(&deps),
        followed,
    }
}

async fn fixture_with(script: Script, delay: Duration, catalog: FakeCatalog) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let serializer = Arc::new(Serializer::new());
    let projection = Arc::new(StateProjection::new(serializer.clone()));
    let watchdog = Arc::new(
        WatchdogLock::open(dir.path().join("arblock"), Duration::from_secs(60)).expect("lock file"),
    );
    let sim = Arc::new(FakeSimulator::new(script, delay));
    let ledger = Arc::new(FakeLedger::new(serializer.clone(), watchdog.clone()));
    ledger.set_balance("ARB1", 1_000_000);
    ledger.set_balance("POOL1", 100_000);

    let cfg = ControllerConfig {
        operator_address: OPERATOR.to_string(),
        min_profit: Some(0.1),
        ..ControllerConfig::default()
    };
    let registry_cfg = RegistryConfig {
        base_addresses: vec!["BASE".to_string()],
        owner: Some("me".to_string()),
        ..RegistryConfig::default()
    };
    let ctl = Arc::new(ReactiveController::new(
        cfg,
        registry_cfg,
        projection,
        watchdog.clone(),
        Collaborators {
            simulator: sim.clone(),
            ledger: ledger.clone(),
            catalog: Arc::new(catalog),
            oracle: Arc::new(UnitOracle),
        },
    ));
    ctl.register(discovered("ARB1", &["CURVE1", "POOL1"], &["POOL1"]))
        .await
        .expect("register");
    Fixture {
        ctl,
        sim,
        ledger,
        serializer,
        watchdog,
        _dir: dir,
    }
}

async fn fixture(script: Script) -> Fixture {
    fixture_with(script, Duration::ZERO, FakeCatalog::default()).await
}

fn external_request(tx: &str, target: &str, amount: u64) -> LedgerEvent {
    LedgerEvent::RequestObserved(Request {
        tx_id: tx.to_string(),
        author: "ALICE".to_string(),
        target: target.to_string(),
        amount,
        payload: json!({ "swap": 1 }),
    })
}

fn response(address: &str, trigger: &str, root: &str) -> LedgerEvent {
    LedgerEvent::ResponseFinalized(ResponseFinalized {
        address: address.to_string(),
        trigger_tx: trigger.to_string(),
        root_trigger_tx: root.to_string(),
        trigger_address: "ALICE".to_string(),
        bounced: false,
        error: None,
        response_vars: Map::new(),
    })
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.await.expect("reaction task");
    }
}

#[tokio::test]
async fn request_touching_dependency_runs_exactly_one_cycle() {
    let fx = fixture(Script::Profit(5.0)).await;
    let handles = fx
        .ctl
        .handle_event(external_request("T1", "POOL1", 500))
        .await
        .expect("handle");
    assert_eq!(handles.len(), 1);
    join_all(handles).await;

    let stats = fx.ctl.stats();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.submitted + stats.rejected, 1);
    assert!(fx.locks_released());
}

#[tokio::test]
async fn repeated_root_trigger_is_evaluated_once() {
    let fx = fixture(Script::Profit(5.0)).await;
    let first = fx
        .ctl
        .handle_event(response("CURVE1", "T1", "T1"))
        .await
        .expect("first");
    join_all(first).await;
    let second = fx
        .ctl
        .handle_event(response("CURVE1", "T2", "T1"))
        .await
        .expect("second");
    join_all(second).await;

    let stats = fx.ctl.stats();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.duplicates, 1);
    assert!(fx.locks_released());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn alternating_roots_each_run_a_cycle_in_delivery_order() {
    for _ in 0..50 {
        let fx = fixture(Script::Bounce("no route")).await;
        let mut handles = Vec::new();
        for (trigger, root) in [("T1", "A"), ("T2", "B"), ("T3", "A")] {
            let spawned = fx
                .ctl
                .handle_event(response("CURVE1", trigger, root))
                .await
                .expect("response");
            handles.extend(spawned);
        }
        join_all(handles).await;

        let stats = fx.ctl.stats();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.duplicates, 0);
        assert!(fx.locks_released());
    }
}

#[tokio::test]
async fn bounced_simulation_never_submits() {
    let fx = fixture(Script::Bounce("no arb opportunity exists")).await;
    let outcome = fx.ctl.estimate_and_act("ARB1").await.expect("cycle");
    assert_eq!(
        outcome,
        CycleOutcome::Rejected(RejectReason::WouldBounce {
            error: "no arb opportunity exists".to_string()
        })
    );
    assert!(outcome_text(&outcome).starts_with("would bounce"));
    assert_eq!(fx.ledger.submission_count(), 0);
    assert!(fx.locks_released());
}

#[tokio::test]
async fn small_profit_never_submits() {
    let fx = fixture(Script::Profit(0.05)).await;
    let outcome = fx.ctl.estimate_and_act("ARB1").await.expect("cycle");
    assert!(matches!(
        outcome,
        CycleOutcome::Rejected(RejectReason::ProfitTooSmall { .. })
    ));
    assert!(outcome_text(&outcome).starts_with("profit too small"));
    assert_eq!(fx.ledger.submission_count(), 0);
    assert!(fx.locks_released());
}

#[tokio::test]
async fn negative_balance_never_submits() {
    let fx = fixture(Script::Overdraw).await;
    let outcome = fx.ctl.estimate_and_act("ARB1").await.expect("cycle");
    assert_eq!(
        outcome,
        CycleOutcome::Rejected(RejectReason::NegativeBalance {
            asset: "stable".to_string(),
            balance: -10
        })
    );
    assert_eq!(fx.ledger.submission_count(), 0);
}

fn outcome_text(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::Rejected(reason) => reason.to_string(),
        CycleOutcome::Submitted { tx_id } => format!("submitted {tx_id}"),
    }
}

#[tokio::test]
async fn accepted_cycle_submits_and_folds_own_request() {
    let fx = fixture(Script::Profit(5.0)).await;
    let outcome = fx.ctl.estimate_and_act("ARB1").await.expect("cycle");
    let CycleOutcome::Submitted { tx_id } = outcome else {
        panic!("expected submission, got {outcome:?}");
    };
    assert_eq!(fx.ledger.submission_count(), 1);
    assert_eq!(fx.ledger.unlocked_submissions.load(Ordering::SeqCst), 0);

    let snap = fx.ctl.projection().snapshot().await;
    assert_eq!(snap.state_var("ARB1", "last_trigger"), Some(&json!(tx_id)));
    assert_eq!(snap.balance("ARB1", BASE_ASSET), 1_010_000);
    assert!(fx.locks_released());

    // The ledger echo of our own request is not folded a second time.
    let echo = fx
        .ledger
        .read_transaction(&tx_id)
        .await
        .expect("read back");
    let handles = fx
        .ctl
        .handle_event(LedgerEvent::RequestObserved(echo))
        .await
        .expect("echo");
    assert!(handles.is_empty());
    assert_eq!(
        fx.ctl.projection().snapshot().await.balance("ARB1", BASE_ASSET),
        1_010_000
    );
}

#[tokio::test]
async fn refused_submission_is_a_rejection() {
    let fx = fixture(Script::Profit(5.0)).await;
    fx.ledger.refuse.store(true, Ordering::SeqCst);
    let outcome = fx.ctl.estimate_and_act("ARB1").await.expect("cycle");
    assert_eq!(
        outcome,
        CycleOutcome::Rejected(RejectReason::SubmissionFailed)
    );
    assert!(fx.locks_released());
}

#[tokio::test]
async fn our_bounced_response_is_ignored() {
    let fx = fixture(Script::Profit(5.0)).await;
    let handles = fx
        .ctl
        .handle_event(LedgerEvent::ResponseFinalized(ResponseFinalized {
            address: "CURVE1".to_string(),
            trigger_tx: "OWN-9".to_string(),
            root_trigger_tx: "OWN-9".to_string(),
            trigger_address: OPERATOR.to_string(),
            bounced: true,
            error: Some("insufficient funds".to_string()),
            response_vars: Map::new(),
        }))
        .await
        .expect("handle");
    assert!(handles.is_empty());
    assert_eq!(fx.ctl.stats().cycles, 0);
}

#[tokio::test]
async fn unrelated_activity_causes_no_cycle() {
    let fx = fixture(Script::Profit(5.0)).await;
    let handles = fx
        .ctl
        .handle_event(external_request("T1", "ELSEWHERE", 10))
        .await
        .expect("handle");
    assert!(handles.is_empty());
    let handles = fx
        .ctl
        .handle_event(response("ELSEWHERE", "T2", "T2"))
        .await
        .expect("handle");
    assert!(handles.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_cycles_never_interleave() {
    let fx = fixture_with(
        Script::Profit(5.0),
        Duration::from_millis(10),
        FakeCatalog::default(),
    )
    .await;
    fx.ctl
        .register(discovered("ARB2", &["POOL1"], &["POOL1"]))
        .await
        .expect("register");

    let mut handles = Vec::new();
    for n in 0..3 {
        let tx = format!("T{n}");
        handles.extend(
            fx.ctl
                .handle_event(external_request(&tx, "POOL1", 100))
                .await
                .expect("handle"),
        );
    }
    handles.extend(
        fx.ctl
            .handle_event(LedgerEvent::ExternalPriceUpdated)
            .await
            .expect("price"),
    );
    join_all(handles).await;

    assert_eq!(fx.ctl.stats().cycles, 8);
    assert_eq!(fx.sim.max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(fx.ledger.unlocked_submissions.load(Ordering::SeqCst), 0);
    assert!(fx.locks_released());
}

#[tokio::test]
async fn snapshot_reflects_every_delivered_update() {
    let fx = fixture(Script::Bounce("no arb opportunity exists")).await;
    let mut handles = fx
        .ctl
        .handle_event(external_request("T1", "POOL1", 500))
        .await
        .expect("first");
    handles.extend(
        fx.ctl
            .handle_event(external_request("T2", "POOL1", 700))
            .await
            .expect("second"),
    );
    join_all(handles).await;

    let seen = fx.sim.seen_pool_balances.lock().clone();
    assert_eq!(seen.len(), 2);
    // Never a partially applied update; the later cycle sees both.
    assert!(seen.iter().all(|b| *b == 100_500 || *b == 101_200));
    assert_eq!(seen.last(), Some(&101_200));
}

#[tokio::test]
async fn price_update_reevaluates_every_owned_instance() {
    let fx = fixture(Script::Bounce("no arb opportunity exists")).await;
    fx.ctl
        .register(discovered("ARB2", &["CURVE2"], &[]))
        .await
        .expect("register");
    let mut foreign = discovered("ARB3", &["CURVE3"], &[]);
    foreign.instance.owned = false;
    fx.ctl.register(foreign).await.expect("register");

    let handles = fx
        .ctl
        .handle_event(LedgerEvent::ExternalPriceUpdated)
        .await
        .expect("handle");
    join_all(handles).await;
    assert_eq!(fx.ctl.stats().cycles, 2);
}

#[tokio::test]
async fn defined_instance_is_registered_and_followed() {
    let mut catalog = FakeCatalog::default();
    catalog.deps.insert(
        "ARB9".to_string(),
        InstanceDependencies {
            trigger: vec!["CURVE9".to_string()],
            followed: vec!["FUND9".to_string()],
            ..InstanceDependencies::default()
        },
    );
    let fx = fixture_with(Script::Profit(5.0), Duration::ZERO, catalog).await;
    fx.ledger.set_balance("FUND9", 77);

    let handles = fx
        .ctl
        .handle_event(LedgerEvent::InstanceDefined(InstanceDefinition {
            address: "ARB9".to_string(),
            base: "BASE".to_string(),
            owner: Some("me".to_string()),
            params: Map::new(),
        }))
        .await
        .expect("define");
    assert!(handles.is_empty());
    assert_eq!(fx.ctl.resolve(&["CURVE9".to_string()]), vec!["ARB9".to_string()]);
    let snap = fx.ctl.projection().snapshot().await;
    assert_eq!(snap.balance("FUND9", BASE_ASSET), 77);
}

#[tokio::test]
async fn top_up_pays_only_depleted_pools() {
    let fx = fixture(Script::Profit(5.0)).await;
    fx.ledger.set_balance("POOL7", 40_000);
    fx.ledger.set_balance("POOL8", 60_000);
    let deps = InstanceDependencies {
        pools: vec!["POOL7".to_string(), "POOL8".to_string()],
        ..InstanceDependencies::default()
    };
    fx.ctl
        .register(Discovered {
            instance: TrackedInstance::new("ARB2", false).with_dependencies(&deps),
            followed: vec!["POOL7".to_string(), "POOL8".to_string()],
        })
        .await
        .expect("register");

    let sent = fx.ctl.top_up_pools().await;
    assert_eq!(sent, 1);
    assert_eq!(
        *fx.ledger.payments.lock(),
        vec![("POOL7".to_string(), 10_000)]
    );
    assert_eq!(fx.ctl.stats().topups, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_holder_past_ceiling_trips_its_watchdog() {
    let fx = fixture(Script::Profit(5.0)).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let hook: ExpiryHook = {
        let fired = fired.clone();
        Arc::new(move |_expiry: &WatchdogExpiry| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    let other = WatchdogLock::open(fx.watchdog.path(), Duration::from_millis(50))
        .expect("other lock")
        .with_expiry_hook(hook);
    other.lock().await.expect("other holder");

    let cycle = {
        let ctl = fx.ctl.clone();
        tokio::spawn(async move { ctl.estimate_and_act("ARB1").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(fx.ctl.stats().cycles, 0);
    assert!(!cycle.is_finished());

    other.unlock().expect("other release");
    let outcome = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .expect("cycle resumes")
        .expect("join")
        .expect("cycle");
    assert!(outcome.is_submitted());
    assert!(fx.locks_released());
}
