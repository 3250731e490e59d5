//! Motor de recolección: lifecycle engine for ant-colony food collection
//! tasks.
//!
//! A task walks a fixed state machine (`pendiente` → `lista` → `en_proceso`
//! → `completada`, with `cancelada`/`fallida` reachable from any non-terminal
//! state), driven by external food and worker providers and a one-shot timer
//! per running task. Every transition commits atomically to an embedded sled
//! store together with the event describing it, so a restart can always
//! rebuild the live timers from what was persisted.
//!
//! Layering, outermost first: [`facade::Facade`] is the only surface an HTTP
//! front-end should call; it delegates control to [`engine::Engine`], which
//! owns per-task linearisation and the generation-guarded timers and writes
//! exclusively through [`store::TaskStore`]; [`events::EventLog`] fans the
//! persisted events out to live subscribers.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod facade;
pub mod model;
pub mod providers;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Engine, RecoveryStats};
pub use error::{EngineError, Result};
pub use events::EventLog;
pub use facade::Facade;
pub use model::{
    Event, EventKind, FoodItem, FoodSnapshot, Task, TaskFilter, TaskState, WorkerAssignment,
    WorkerBatch,
};
pub use providers::{
    FoodProvider, InMemoryFoodProvider, InMemoryWorkerProvider, WorkerProvider,
};
pub use store::{SledStore, TaskStore};

use std::sync::Arc;
use tracing::info;

/// A fully wired engine instance: store, event log, engine and facade.
///
/// [`RecoleccionSystem::start`] opens the store, runs startup recovery and
/// returns a handle the embedding process keeps for its lifetime. Dropping
/// the handle without calling [`shutdown`](RecoleccionSystem::shutdown)
/// leaves timers running until the runtime itself stops.
pub struct RecoleccionSystem {
    engine: Arc<Engine>,
    store: Arc<SledStore>,
    facade: Facade,
    recovery: RecoveryStats,
}

impl RecoleccionSystem {
    pub async fn start(
        config: EngineConfig,
        food: Arc<dyn FoodProvider>,
        workers: Arc<dyn WorkerProvider>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(EngineError::InvalidArgument)?;
        let store = Arc::new(SledStore::open(&config.store_path)?);
        let events = EventLog::new(store.clone(), config.event_buffer);
        let engine = Engine::new(
            store.clone(),
            events,
            food,
            workers,
            Arc::new(config),
        );
        let recovery = engine.recover().await?;
        let facade = Facade::new(engine.clone(), store.clone());
        info!(
            "sistema de recolección iniciado ({} tareas rearmadas)",
            recovery.re_armed
        );
        Ok(Self {
            engine,
            store,
            facade,
            recovery,
        })
    }

    pub fn facade(&self) -> &Facade {
        &self.facade
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// What the startup recovery scan found and did.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<Event> {
        self.facade.subscribe()
    }

    /// Stop the timers and flush the store. After this returns the sled
    /// files can be reopened by another instance.
    pub async fn shutdown(self) -> Result<()> {
        self.engine.shutdown().await;
        self.store.flush().await?;
        info!("sistema de recolección detenido");
        Ok(())
    }
}

/// Install the process-wide tracing subscriber. Call once at startup;
/// respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
