//! Owns the three background loops (Engine, Workers, Monitor) as a single
//! `Lifecycle` context, replacing the module-level `_running` booleans and
//! task handles the original implementation scatters across
//! `event_engine.py`/`workers.py`/`ops_monitor.py`, per `spec.md` §9's
//! design note to fold that global state into one owner.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::Config;
use crate::engine::Engine;
use crate::monitor::Monitor;
use crate::queue::Queue;
use crate::store::Store;
use crate::workers::WorkerPool;

/// Implemented by each of the three long-running loops so `Supervised<T>`
/// can start, stop, and restart them uniformly.
#[async_trait]
pub trait RunLoop: Send + Sync + 'static {
    async fn run_loop(&self, cancel: CancellationToken);
}

#[async_trait]
impl RunLoop for Engine {
    async fn run_loop(&self, cancel: CancellationToken) {
        self.run(cancel).await;
    }
}

#[async_trait]
impl RunLoop for WorkerPool {
    async fn run_loop(&self, cancel: CancellationToken) {
        self.run(cancel).await;
    }
}

#[async_trait]
impl RunLoop for Monitor {
    async fn run_loop(&self, cancel: CancellationToken) {
        self.run(cancel).await;
    }
}

struct SupervisedState {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// A restartable background task. `is_alive` and `restart` are what the
/// Monitor calls on the Engine and Worker pool to implement auto-restart
/// with escalation; `start`/`stop` are what the process entry point calls.
pub struct Supervised<T: RunLoop> {
    component: Arc<T>,
    state: Mutex<SupervisedState>,
}

impl<T: RunLoop> Supervised<T> {
    pub fn new(component: Arc<T>) -> Self {
        Self {
            component,
            state: Mutex::new(SupervisedState { cancel: CancellationToken::new(), handle: None }),
        }
    }

    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let component = self.component.clone();
        let task_cancel = cancel.clone();
        state.handle = Some(tokio::spawn(async move {
            component.run_loop(task_cancel).await;
        }));
        state.cancel = cancel;
    }

    pub async fn is_alive(&self) -> bool {
        self.state.lock().await.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the current run (if any), joins it, then starts a fresh one
    /// under a new cancellation token. Mirrors the original's
    /// `stop(); start()` restart sequences in `ops_monitor.py`.
    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.cancel.cancel();
        if let Some(handle) = state.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Wires Store/Bus/Queue/Engine/Workers/Monitor together for one process
/// and owns their start/stop lifecycle.
pub struct Lifecycle {
    store: Store,
    bus: Bus,
    queue: Queue,
    engine: Arc<Supervised<Engine>>,
    workers: Arc<Supervised<WorkerPool>>,
    monitor: Arc<Supervised<Monitor>>,
    monitor_enabled: bool,
}

impl Lifecycle {
    pub fn new(config: &Config, store: Store) -> Self {
        let bus = Bus::new(store.clone());
        let queue = Queue::new(store.clone());

        let engine_component =
            Arc::new(Engine::new(store.clone(), queue.clone(), bus.clone(), config.engine_tick()));
        let engine = Arc::new(Supervised::new(engine_component));

        let workers_component =
            Arc::new(WorkerPool::new(store.clone(), queue.clone(), bus.clone(), config.worker_pool_size));
        let workers = Arc::new(Supervised::new(workers_component));

        let monitor_component =
            Arc::new(Monitor::new(store.clone(), bus.clone(), config, engine.clone(), workers.clone()));
        let monitor = Arc::new(Supervised::new(monitor_component));

        Self { store, bus, queue, engine, workers, monitor, monitor_enabled: config.ops_monitor_enabled }
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn queue(&self) -> Queue {
        self.queue.clone()
    }

    pub fn engine(&self) -> Arc<Supervised<Engine>> {
        self.engine.clone()
    }

    pub fn workers(&self) -> Arc<Supervised<WorkerPool>> {
        self.workers.clone()
    }

    pub fn monitor(&self) -> Arc<Supervised<Monitor>> {
        self.monitor.clone()
    }

    /// Starts Engine and Workers, then the Monitor so it never observes a
    /// system that hasn't finished starting up.
    pub async fn start(&self) {
        self.engine.start().await;
        self.workers.start().await;
        if self.monitor_enabled {
            self.monitor.start().await;
        }
    }

    /// Monitor -> Engine -> Workers -> Store, per `spec.md` §5. The store's
    /// connection pool has no explicit close step; it is dropped last,
    /// naturally, once every task that might still use it has joined.
    pub async fn stop(&self) {
        self.monitor.stop().await;
        self.engine.stop().await;
        self.workers.stop().await;
    }
}
