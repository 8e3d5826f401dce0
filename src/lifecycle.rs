//! The init state processor & lifecycle (component G): sequences the
//! publisher (D) and adapter controller (F) operations asynchronously on a
//! dedicated event-loop thread, exposes run-state/health to the host, and
//! performs ordered teardown.
//!
//! Grounded on the teacher's `Session::new` (spawn a background task, return
//! a handle the caller can join) and `gatt/local.rs`'s drop-triggered
//! `oneshot`-unregister idiom, generalised into a full run-state/health
//! state machine — no direct teacher analogue carries a multi-stage init
//! checklist, so this is built from the same primitives the teacher already
//! reaches for (`tokio::sync::watch`, a dedicated `tokio::runtime::Runtime`,
//! `tokio::spawn`).

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use displaydoc::Display;
use tokio::sync::{mpsc, watch};

use crate::{
    adapter::{AdapterController, AdapterEvent},
    advertisement::{build_advertisement_interface, AdvertisementIncludes, AdvertisementType},
    config::{truncate_to_byte_budget, ServerConfig, ADVERTISING_AD_BUDGET},
    dsl::{apply_all, ServerBuilder},
    is_retryable,
    path::ObjectPath,
    publisher::Publisher,
    queue::{UpdateEntry, UpdateQueue},
    retry::{retry_async, RetryPolicy},
    tree::{NodeId, Tree},
    Error, ErrorKind, Result,
};

/// The run-state half of spec §4.G's state machine. The intermediate
/// asynchronous milestones (`bus → name → object-mgr → adapter-iface →
/// adapter-configured → tree-registered → application-registered`) are
/// sequenced inside [`Initializing`](RunState::Initializing) rather than
/// modelled as distinct public states; a caller only ever observes the five
/// states named here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display)]
pub enum RunState {
    /// not yet started
    Uninitialized,
    /// running the startup checklist
    Initializing,
    /// serving GATT traffic
    Running,
    /// tearing down
    Stopping,
    /// fully torn down
    Stopped,
}

/// Health, separate from run-state: monotone non-improving once set away
/// from `Ok` (spec §4.G). `FailedInit` precedes `Running`; `FailedRun`
/// follows it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display)]
pub enum Health {
    /// ok
    Ok,
    /// failed before reaching Running
    FailedInit,
    /// failed after reaching Running
    FailedRun,
}

impl Health {
    fn encode(self) -> u8 {
        match self {
            Health::Ok => 0,
            Health::FailedInit => 1,
            Health::FailedRun => 2,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            0 => Health::Ok,
            1 => Health::FailedInit,
            _ => Health::FailedRun,
        }
    }
}

/// An atomically-swappable health cell. The first `escalate` call away from
/// `Ok` wins; subsequent calls are no-ops, realizing the monotone
/// non-improving invariant without ever handing `Ok` back out once lost.
struct HealthCell(AtomicU8);

impl HealthCell {
    fn new() -> Self {
        Self(AtomicU8::new(Health::Ok.encode()))
    }

    fn get(&self) -> Health {
        Health::decode(self.0.load(Ordering::Acquire))
    }

    fn escalate(&self, to: Health) {
        let _ = self.0.compare_exchange(Health::Ok.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Resources produced by the startup checklist, threaded into the main
/// serve loop and torn down in reverse on shutdown.
struct Resources {
    publisher: Publisher,
    adapter: AdapterController,
    adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
    advertisement_node: Option<NodeId>,
}

/// Everything the event-loop thread needs, owned for its lifetime.
struct EventLoopCtx {
    config: ServerConfig,
    bus_name: String,
    enable_bondable: bool,
    tree: Arc<RwLock<Tree>>,
    health: Arc<HealthCell>,
    queue: Arc<UpdateQueue>,
    run_state_tx: watch::Sender<RunState>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    init_signal: std::sync::mpsc::SyncSender<()>,
}

/// A running (or failed-to-start) server. Returned by [`start`]; the only
/// surface a host needs after startup. Thread-safe: the update queue and the
/// run-state/health accessors are the two cross-thread surfaces spec §5
/// names, and both are reachable here.
pub struct ServerHandle {
    run_state_rx: watch::Receiver<RunState>,
    health: Arc<HealthCell>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    queue: Arc<UpdateQueue>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    #[allow(dead_code)]
    tree: Arc<RwLock<Tree>>,
}

impl ServerHandle {
    /// Atomically reads the current run-state.
    pub fn run_state(&self) -> RunState {
        *self.run_state_rx.borrow()
    }

    /// `true` iff the run-state is currently `Running`.
    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Atomically reads the current health.
    pub fn health(&self) -> Health {
        self.health.get()
    }

    /// Enqueues a characteristic/descriptor change notification (spec
    /// §6.2's `push_update`). Always succeeds; callable from any thread.
    pub fn push_update(&self, object_path: ObjectPath, interface_name: &'static str) {
        self.queue.push_front(UpdateEntry { object_path, interface_name });
    }

    /// Pops the oldest queued update (spec §6.2's `pop_update`); `keep`
    /// leaves it in place.
    pub fn pop_update(&self, keep: bool) -> Option<UpdateEntry> {
        self.queue.pop_back(keep)
    }

    /// Non-blocking: asks the event-loop thread to begin shutdown.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Blocks until the event-loop thread has joined, then restores the
    /// default (silent) log sink table. Returns success iff health is `Ok`.
    pub fn wait_until_stopped(&self) -> Result<()> {
        if let Some(handle) = self.thread.lock().expect("thread handle mutex poisoned").take() {
            let _ = handle.join();
        }
        crate::logging::clear_all();
        match self.health.get() {
            Health::Ok => Ok(()),
            other => Err(Error::new(ErrorKind::Failed, format!("terminated with health {other}"))),
        }
    }

    /// `trigger_shutdown` then `wait_until_stopped`, composed (spec §6.2).
    pub fn shutdown_and_wait(&self) -> Result<()> {
        self.trigger_shutdown();
        self.wait_until_stopped()
    }
}

/// Validates `config`, applies every registered configurator to a fresh
/// tree, spawns the event-loop thread, and blocks the caller for up to
/// `config.init_timeout_ms` waiting for the run-state to reach `Running`.
/// Returns the started handle, or a failure if `Running` was not reached in
/// time (the event-loop thread is asked to shut down before returning).
pub fn start(config: ServerConfig) -> Result<ServerHandle> {
    let bondable = config.enable_bondable;
    start_with_bondable(config, bondable)
}

/// Same as [`start`], with an explicit pairing policy overriding
/// `config.enable_bondable` (spec §6.2's `start_with_bondable`).
pub fn start_with_bondable(config: ServerConfig, bondable: bool) -> Result<ServerHandle> {
    let (bus_name, root_path) = config.validate()?;

    let mut tree = Tree::new(root_path);
    let root = tree.root();
    {
        let mut builder = ServerBuilder::new(&mut tree, root);
        apply_all(&mut builder);
    }
    let tree = Arc::new(RwLock::new(tree));

    let (run_state_tx, run_state_rx) = watch::channel(RunState::Uninitialized);
    let health = Arc::new(HealthCell::new());
    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
    let queue = Arc::new(UpdateQueue::new());
    let (init_signal, init_wait) = std::sync::mpsc::sync_channel::<()>(1);

    let ctx = EventLoopCtx {
        config: config.clone(),
        bus_name,
        enable_bondable: bondable,
        tree: tree.clone(),
        health: health.clone(),
        queue: queue.clone(),
        run_state_tx,
        shutdown_rx,
        init_signal,
    };

    let thread = thread::Builder::new()
        .name("bzperi-event-loop".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build the bzperi event-loop runtime");
            runtime.block_on(run_event_loop(ctx));
        })
        .expect("failed to spawn the bzperi event-loop thread");

    // Wake on either a successful transition into Running or a terminal
    // init failure; either way the event-loop thread signals once.
    let _ = init_wait.recv_timeout(Duration::from_millis(config.init_timeout_ms as u64));

    let handle = ServerHandle { run_state_rx, health, shutdown_tx, queue, thread: Mutex::new(Some(thread)), tree };
    if handle.is_running() {
        Ok(handle)
    } else {
        handle.trigger_shutdown();
        Err(Error::new(
            ErrorKind::Failed,
            format!("bzperi did not reach Running within {} ms (health: {})", config.init_timeout_ms, handle.health()),
        ))
    }
}

async fn run_event_loop(mut ctx: EventLoopCtx) {
    let _ = ctx.run_state_tx.send(RunState::Initializing);

    match init_checklist(&ctx).await {
        Ok(resources) => {
            let _ = ctx.run_state_tx.send(RunState::Running);
            let _ = ctx.init_signal.send(());
            serve(ctx, resources).await;
        }
        Err(err) => {
            log::error!("bzperi initialization failed: {err}");
            ctx.health.escalate(Health::FailedInit);
            let _ = ctx.run_state_tx.send(RunState::Stopped);
            let _ = ctx.init_signal.send(());
        }
    }
}

/// Runs the `bus → name → object-mgr → adapter-iface → adapter-configured →
/// tree-registered → application-registered` checklist (spec §4.G),
/// retrying flaky steps per component F's retry policy.
async fn init_checklist(ctx: &EventLoopCtx) -> Result<Resources> {
    let publisher = Publisher::connect(ctx.tree.clone()).await?;
    publisher.acquire_name(&ctx.bus_name).await?;

    let (mut adapter, adapter_events) = retry_async(RetryPolicy::default_policy(), |e: &Error| is_retryable(&e.kind), || {
        AdapterController::initialize(publisher.connection.clone(), None)
    })
    .await?;

    // adapter-configured: an adapter is only usable once Powered=true (spec
    // §3.2); this gates advancement to tree-registered below regardless of
    // whether advertising is enabled, per scenario 5's retry-then-advance
    // requirement.
    if !adapter.info.powered {
        retry_async(RetryPolicy::default_policy(), |e: &Error| is_retryable(&e.kind), || adapter.set_powered(true)).await?;
    }

    if ctx.enable_bondable {
        retry_async(RetryPolicy::default_policy(), |e: &Error| is_retryable(&e.kind), || adapter.set_bondable(true)).await?;
    }
    if !ctx.config.advertising_name.is_empty() {
        let short =
            (!ctx.config.advertising_short_name.is_empty()).then(|| truncate_to_byte_budget(&ctx.config.advertising_short_name, ADVERTISING_AD_BUDGET));
        retry_async(RetryPolicy::default_policy(), |e: &Error| is_retryable(&e.kind), || {
            adapter.set_name(&ctx.config.advertising_name, short.as_deref())
        })
        .await?;
    }
    if ctx.config.enable_discoverable {
        retry_async(RetryPolicy::default_policy(), |e: &Error| is_retryable(&e.kind), || adapter.set_discoverable(true, None)).await?;
    }

    let root = ctx.tree.read().expect("tree lock poisoned").root();
    retry_async(RetryPolicy::default_policy(), |e: &Error| is_retryable(&e.kind), || publisher.register_tree(root)).await?;

    let advertisement_node = if ctx.config.enable_advertising {
        let node = {
            let mut tree = ctx.tree.write().expect("tree lock poisoned");
            let root = tree.root();
            let node = tree.add_internal_child(root, "advertisement0")?;
            let uuids = tree.service_uuids();
            let iface = build_advertisement_interface(
                AdvertisementType::Peripheral,
                &uuids,
                AdvertisementIncludes::default(),
                adapter.advertisement_local_name.clone(),
            );
            tree.add_interface(node, iface)?;
            node
        };
        publisher.register_node(node).await?;
        Some(node)
    } else {
        None
    };

    let app_path = ctx.tree.read().expect("tree lock poisoned").path_of(root).clone();
    retry_async(RetryPolicy::default_policy(), |e: &Error| is_retryable(&e.kind), || adapter.register_application(&app_path)).await?;

    if let Some(node) = advertisement_node {
        let adv_path = ctx.tree.read().expect("tree lock poisoned").path_of(node).clone();
        retry_async(RetryPolicy::advertising_policy(), |e: &Error| is_retryable(&e.kind), || adapter.set_advertising_async(true, &adv_path)).await?;
    }

    Ok(Resources { publisher, adapter, adapter_events, advertisement_node })
}

/// The steady-state loop: dispatches one queued update per 10 ms tick
/// (spec §4.E), tracks device connect/disconnect, reacts to BlueZ loss, and
/// exits on `trigger_shutdown`, tearing down in reverse order.
async fn serve(ctx: EventLoopCtx, mut resources: Resources) {
    let EventLoopCtx { run_state_tx, mut shutdown_rx, queue, tree, health, config: _, bus_name: _, enable_bondable: _, init_signal: _ } = ctx;
    let mut tick = tokio::time::interval(Duration::from_millis(10));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                dispatch_one(&queue, &tree, &resources.publisher);
            }
            event = resources.adapter_events.recv() => {
                match event {
                    Some(AdapterEvent::DeviceConnected(device)) => {
                        log::info!("device connected: {}", device.path);
                        resources.adapter.devices.insert(device.path.clone(), device);
                    }
                    Some(AdapterEvent::DeviceDisconnected(path)) => {
                        log::info!("device disconnected: {path}");
                        resources.adapter.devices.remove(&path);
                    }
                    Some(AdapterEvent::BlueZGone) => {
                        recover_from_bluez_loss(&tree, &health, &mut resources).await;
                    }
                    None => {}
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    let _ = run_state_tx.send(RunState::Stopping);
    resources.adapter.cancel_subscriptions();
    if let Some(node) = resources.advertisement_node {
        let path = tree.read().expect("tree lock poisoned").path_of(node).clone();
        if let Err(e) = resources.adapter.set_advertising_async(false, &path).await {
            log::warn!("failed to unregister advertisement during shutdown: {e}");
        }
    }
    let _ = run_state_tx.send(RunState::Stopped);
}

/// Pops one entry and, if its characteristic/descriptor still carries a
/// readable `Value` property, re-reads it and emits `PropertiesChanged`.
/// Per spec §9's Open Question decision, the dispatcher reads the current
/// value straight off the tree rather than threading a publisher handle
/// into the DSL's characteristic closures.
fn dispatch_one(queue: &UpdateQueue, tree: &Arc<RwLock<Tree>>, publisher: &Publisher) {
    let Some(entry) = queue.pop_back(false) else { return };
    let value = {
        let tree = tree.read().expect("tree lock poisoned");
        let Some(prop) = tree.find_property(&entry.object_path, entry.interface_name, "Value") else {
            log::warn!("queued update for {} has no Value property", entry.object_path);
            return;
        };
        let Some(get) = &prop.get else { return };
        match get() {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Value getter failed for {}: {e}", entry.object_path);
                return;
            }
        }
    };

    let mut changed = BTreeMap::new();
    changed.insert("Value".to_string(), value);
    if let Err(e) = publisher.emit_properties_changed(&entry.object_path, entry.interface_name, changed) {
        log::warn!("failed to emit PropertiesChanged for {}: {e}", entry.object_path);
    }
}

/// Spec §4.F/§8.4 scenario 6: on BlueZ loss, wait 5 s and attempt recovery;
/// on a second failure, back off 15 s and retry once more; if that also
/// fails, escalate health to `FailedRun`.
async fn recover_from_bluez_loss(tree: &Arc<RwLock<Tree>>, health: &Arc<HealthCell>, resources: &mut Resources) {
    log::warn!("org.bluez vanished from the bus; scheduling recovery");
    tokio::time::sleep(Duration::from_secs(5)).await;
    if try_recover(tree, resources).await.is_ok() {
        log::info!("recovered from BlueZ loss");
        return;
    }

    log::warn!("first bzperi recovery attempt failed; backing off 15s before retrying");
    tokio::time::sleep(Duration::from_secs(15)).await;
    match try_recover(tree, resources).await {
        Ok(()) => log::info!("recovered from BlueZ loss on second attempt"),
        Err(e) => {
            log::error!("bzperi failed to recover from BlueZ loss: {e}");
            health.escalate(Health::FailedRun);
        }
    }
}

async fn try_recover(tree: &Arc<RwLock<Tree>>, resources: &mut Resources) -> Result<()> {
    resources.adapter.cancel_subscriptions();
    let (adapter, adapter_events) = AdapterController::initialize(resources.publisher.connection.clone(), None).await?;
    resources.adapter = adapter;
    resources.adapter_events = adapter_events;

    let root = tree.read().expect("tree lock poisoned").root();
    let app_path = tree.read().expect("tree lock poisoned").path_of(root).clone();
    resources.adapter.register_application(&app_path).await?;

    if let Some(node) = resources.advertisement_node {
        let adv_path = tree.read().expect("tree lock poisoned").path_of(node).clone();
        resources.adapter.set_advertising_async(true, &adv_path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_invalid_config_before_touching_the_bus() {
        // service_name validation happens before the event-loop thread is
        // ever spawned, so this must fail fast with no D-Bus connection.
        let cfg = ServerConfig::new("not-bzperi");
        let err = start(cfg).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidServiceName);
    }

    #[test]
    fn start_rejects_out_of_range_init_timeout_before_touching_the_bus() {
        let cfg = ServerConfig::new("bzperi").with_init_timeout_ms(50);
        let err = start(cfg).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn health_escalation_is_monotone_non_improving() {
        let h = HealthCell::new();
        assert_eq!(h.get(), Health::Ok);
        h.escalate(Health::FailedRun);
        assert_eq!(h.get(), Health::FailedRun);
        h.escalate(Health::FailedInit);
        assert_eq!(h.get(), Health::FailedRun, "first failure wins and is never overwritten");
    }

    #[test]
    fn run_state_display_matches_spec_names() {
        assert_eq!(RunState::Running.to_string(), "serving GATT traffic");
        assert_eq!(Health::Ok.to_string(), "ok");
    }
}
