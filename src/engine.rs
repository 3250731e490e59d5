use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EventLog;
use crate::model::{EventKind, Task, TaskFilter, TaskState, WorkerBatch};
use crate::providers::{FoodProvider, WorkerProvider};
use crate::store::TaskStore;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Statistics from the startup recovery scan.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    /// Tasks left waiting for an external trigger.
    pub pending: usize,
    pub ready: usize,
    /// Running tasks whose timer was re-armed with the remaining duration.
    pub re_armed: usize,
    /// Running tasks already past their deadline, completed immediately.
    pub completed_overdue: usize,
    pub failed: usize,
}

/// Task lifecycle engine.
///
/// Owns the state machine, the per-task linearisation and the timer
/// subsystem. Operations on the same task id observe a total order (a
/// per-task mutex); operations on different tasks run in parallel and rely
/// on the store's transactions for isolation.
///
/// Each `start` allocates a fresh generation for the task. The scheduled
/// timer captures `(task_id, generation)` and its handler proceeds only if
/// the task is still running under that generation, so a cancel or manual
/// completion that commits first turns the expiry into a no-op.
pub struct Engine {
    store: Arc<dyn TaskStore>,
    events: EventLog,
    food: Arc<dyn FoodProvider>,
    workers: Arc<dyn WorkerProvider>,
    config: Arc<EngineConfig>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    generations: DashMap<String, u64>,
    timers: DashMap<String, TimerEntry>,
    shutting_down: AtomicBool,
}

impl Engine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: EventLog,
        food: Arc<dyn FoodProvider>,
        workers: Arc<dyn WorkerProvider>,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            food,
            workers,
            config,
            locks: DashMap::new(),
            generations: DashMap::new(),
            timers: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn food_provider(&self) -> &Arc<dyn FoodProvider> {
        &self.food
    }

    pub fn worker_provider(&self) -> &Arc<dyn WorkerProvider> {
        &self.workers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Look up the food, capture its snapshot and create the task in
    /// `pendiente`.
    pub async fn create(&self, task_id: &str, food_id: &str) -> Result<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let food = match timeout(self.config.provider_timeout, self.food.get_food(food_id)).await
        {
            Ok(Ok(Some(food))) => food,
            Ok(Ok(None)) => {
                return Err(EngineError::FoodNotFound {
                    food_id: food_id.to_string(),
                })
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(EngineError::FoodProviderUnavailable {
                    reason: format!("sin respuesta tras {:?}", self.config.provider_timeout),
                })
            }
        };
        if !food.disponible {
            return Err(EngineError::FoodUnavailable {
                food_id: food_id.to_string(),
            });
        }
        if !food.is_well_formed() {
            return Err(EngineError::InvalidArgument(format!(
                "alimento {} con atributos inválidos",
                food_id
            )));
        }

        let (task, event) = self.store.create_task(task_id, food.snapshot()).await?;
        self.events.publish(&event);
        info!("tarea {} creada para alimento {}", task_id, food_id);
        Ok(task)
    }

    /// Reserve workers for a pending task.
    ///
    /// With no batch supplied, a fresh one of exactly the required size is
    /// requested from the worker provider; a short batch is handed back and
    /// rejected, never partially reserved.
    pub async fn reserve(&self, task_id: &str, batch: Option<WorkerBatch>) -> Result<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.store.load_task(task_id).await?;
        if task.estado != TaskState::Pending {
            return Err(EngineError::IllegalState {
                task_id: task_id.to_string(),
                from: task.estado,
                to: TaskState::Ready,
            });
        }
        let required = task.alimento.cantidad_hormigas_necesarias;

        let batch = match batch {
            Some(batch) => {
                if batch.hormigas.len() as u32 != required {
                    return Err(EngineError::WorkerCountMismatch {
                        task_id: task_id.to_string(),
                        required,
                        got: batch.hormigas.len() as u32,
                    });
                }
                batch
            }
            None => {
                let batch = match timeout(
                    self.config.provider_timeout,
                    self.workers.request_batch(required),
                )
                .await
                {
                    Ok(Ok(batch)) => batch,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(EngineError::WorkerProviderUnavailable {
                            reason: format!(
                                "sin respuesta tras {:?}",
                                self.config.provider_timeout
                            ),
                        })
                    }
                };
                if (batch.hormigas.len() as u32) < required {
                    let offered = batch.hormigas.len() as u32;
                    warn!(
                        "lote {} insuficiente para tarea {}: {} de {}",
                        batch.lote_id, task_id, offered, required
                    );
                    // Hand the short batch straight back.
                    if let Err(e) = self
                        .workers
                        .release_batch(&batch.lote_id, &batch.hormigas, 0)
                        .await
                    {
                        warn!(
                            "no se pudo devolver el lote corto {}: {}",
                            batch.lote_id, e
                        );
                    }
                    return Err(EngineError::InsufficientWorkers {
                        task_id: task_id.to_string(),
                        required,
                        offered,
                    });
                }
                batch
            }
        };

        let (task, event) = self
            .store
            .reserve_task(task_id, &batch.lote_id, &batch.hormigas)
            .await?;
        self.events.publish(&event);
        info!(
            "tarea {} reservada con lote {} ({} hormigas)",
            task_id, batch.lote_id, required
        );
        Ok(task)
    }

    /// Start a ready task and arm its one-shot completion timer.
    pub async fn start(self: &Arc<Self>, task_id: &str) -> Result<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let (task, event) = self.store.start_task(task_id, Utc::now()).await?;
        let generation = self.bump_generation(task_id);
        self.spawn_timer(
            task_id,
            generation,
            Duration::from_secs(task.alimento.tiempo_recoleccion),
        );
        self.events.publish(&event);
        info!(
            "tarea {} iniciada; timer de {}s (generación {})",
            task_id, task.alimento.tiempo_recoleccion, generation
        );
        Ok(task)
    }

    /// Complete a running task before its timer fires.
    ///
    /// The override is clamped to the snapshot's stock points; a negative
    /// override is rejected outright.
    pub async fn complete_manual(
        &self,
        task_id: &str,
        collected_override: Option<i64>,
    ) -> Result<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.store.load_task(task_id).await?;
        if task.estado != TaskState::Running {
            return Err(EngineError::IllegalState {
                task_id: task_id.to_string(),
                from: task.estado,
                to: TaskState::Completed,
            });
        }
        let stock = task.alimento.puntos_stock;
        let collected = match collected_override {
            Some(c) if c < 0 => {
                return Err(EngineError::InvalidArgument(
                    "la cantidad recolectada no puede ser negativa".to_string(),
                ))
            }
            Some(c) => (c as u32).min(stock),
            None => stock,
        };

        let (task, event) = self
            .store
            .complete_task(task_id, Utc::now(), collected, false)
            .await?;
        // Invalidate the armed timer only after the commit: if the commit
        // had failed the task would still be running and the timer must
        // stay live to retry at expiry.
        self.bump_generation(task_id);
        self.abort_timer(task_id);
        self.events.publish(&event);
        info!(
            "tarea {} completada manualmente; recolectado {}",
            task_id, collected
        );
        self.release_workers(&task).await;
        self.notify_food_collected(&task).await;
        Ok(task)
    }

    /// Cancel a task from any non-terminal state. Idempotent: cancelling an
    /// already-cancelled task returns its unchanged row and emits nothing.
    pub async fn cancel(&self, task_id: &str, reason: Option<&str>) -> Result<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let reason = reason.unwrap_or("cancelada por el usuario");
        let (task, event) = self.store.cancel_task(task_id, Utc::now(), reason).await?;
        match event {
            Some(event) => {
                self.bump_generation(task_id);
                self.abort_timer(task_id);
                self.events.publish(&event);
                info!("tarea {} cancelada: {}", task_id, reason);
                if task.hormigas_lote_id.is_some() {
                    self.release_workers(&task).await;
                }
            }
            None => debug!("tarea {} ya estaba cancelada", task_id),
        }
        Ok(task)
    }

    /// Move a task to `fallida`, recording the reason. Used by the timer
    /// handler when an expiry cannot be committed.
    pub async fn fail(&self, task_id: &str, reason: &str) -> Result<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        self.fail_locked(task_id, reason).await
    }

    /// Seconds until auto-completion for a running task; `None` when the
    /// question does not apply.
    pub async fn time_remaining(&self, task_id: &str) -> Result<Option<u64>> {
        let task = self.store.load_task(task_id).await?;
        Ok(task.remaining_seconds(Utc::now()))
    }

    /// Startup scan: pending and ready tasks are left for their external
    /// trigger; running tasks get their timer re-armed from the persisted
    /// start instant, or complete immediately at `start + duration` when the
    /// deadline already passed. No `task_started` event is re-emitted.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let tasks = self.store.list_tasks(&TaskFilter::default()).await?;

        for task in tasks {
            match task.estado {
                TaskState::Pending => stats.pending += 1,
                TaskState::Ready => stats.ready += 1,
                TaskState::Running => {
                    let started = match task.fecha_inicio {
                        Some(started) => started,
                        None => {
                            error!("tarea {} en_proceso sin fecha_inicio", task.id);
                            if let Err(e) = self
                                .fail(&task.id, "estado inconsistente: sin fecha_inicio")
                                .await
                            {
                                error!("no se pudo marcar {} como fallida: {}", task.id, e);
                            }
                            stats.failed += 1;
                            continue;
                        }
                    };
                    let deadline = started
                        + chrono::Duration::seconds(task.alimento.tiempo_recoleccion as i64);
                    let generation = self.bump_generation(&task.id);
                    let now = Utc::now();
                    if deadline <= now {
                        // Overdue: the end instant is the persisted deadline,
                        // not wall-clock now, so restart latency never
                        // corrupts the timeline. Same retry-then-fail policy
                        // as a live expiry; a task must never be left running
                        // without a timer.
                        let lock = self.task_lock(&task.id);
                        let _guard = lock.lock().await;
                        if self
                            .complete_auto_locked(&task.id, deadline, task.alimento.puntos_stock)
                            .await
                        {
                            info!("tarea {} completada al recuperar (vencida)", task.id);
                            stats.completed_overdue += 1;
                        } else {
                            stats.failed += 1;
                        }
                    } else {
                        let remaining =
                            (deadline - now).to_std().unwrap_or(Duration::ZERO);
                        self.spawn_timer(&task.id, generation, remaining);
                        debug!("timer de tarea {} rearmado: {:?} restantes", task.id, remaining);
                        stats.re_armed += 1;
                    }
                }
                _ => {}
            }
        }

        info!(
            "recuperación completa: {} pendientes, {} listas, {} rearmadas, {} vencidas, {} fallidas",
            stats.pending, stats.ready, stats.re_armed, stats.completed_overdue, stats.failed
        );
        Ok(stats)
    }

    /// Cancel every armed timer and wait for the handlers to wind down.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let task_ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        let count = task_ids.len();
        for task_id in task_ids {
            if let Some((_, entry)) = self.timers.remove(&task_id) {
                entry.handle.abort();
                let _ = entry.handle.await;
            }
        }
        info!("engine detenido; {} timers cancelados", count);
    }

    // ---- timer subsystem ----

    fn spawn_timer(self: &Arc<Self>, task_id: &str, generation: u64, delay: Duration) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let engine = Arc::clone(self);
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            engine.handle_expiry(&id, generation).await;
        });
        if let Some(previous) = self
            .timers
            .insert(task_id.to_string(), TimerEntry { generation, handle })
        {
            previous.handle.abort();
        }
    }

    /// Timer expiry handler. Runs under the task lock; a cancel or manual
    /// completion that committed first leaves either a stale generation or a
    /// non-running state, and the expiry becomes a no-op with no events.
    pub(crate) async fn handle_expiry(&self, task_id: &str, generation: u64) {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if self.current_generation(task_id) != generation {
            debug!(
                "timer obsoleto para tarea {} (generación {})",
                task_id, generation
            );
            return;
        }
        let task = match self.store.load_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!("timer de tarea {}: no se pudo leer el estado: {}", task_id, e);
                return;
            }
        };
        if task.estado != TaskState::Running {
            debug!(
                "timer de tarea {} llegó tarde (estado {})",
                task_id, task.estado
            );
            return;
        }

        self.complete_auto_locked(task_id, Utc::now(), task.alimento.puntos_stock)
            .await;
        self.timers
            .remove_if(task_id, |_, entry| entry.generation == generation);
    }

    /// Commit an automatic completion with bounded retries; when the retries
    /// are exhausted the task moves to `fallida` instead of staying running
    /// without a timer. Caller must hold the task lock. Returns whether the
    /// completion committed.
    async fn complete_auto_locked(
        &self,
        task_id: &str,
        end: chrono::DateTime<Utc>,
        collected: u32,
    ) -> bool {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.complete_task(task_id, end, collected, true).await {
                Ok((task, event)) => {
                    self.events.publish(&event);
                    info!(
                        "tarea {} completada automáticamente; recolectado {}",
                        task_id, collected
                    );
                    self.release_workers(&task).await;
                    self.notify_food_collected(&task).await;
                    return true;
                }
                Err(EngineError::IllegalState { .. }) | Err(EngineError::TaskNotFound { .. }) => {
                    // Lost the race at the store; nothing to do.
                    debug!("expiración de tarea {} perdió la carrera", task_id);
                    return false;
                }
                Err(e) if e.is_transient() && attempt < self.config.timer_retry_attempts => {
                    warn!(
                        "expiración de tarea {}: intento {} falló: {}",
                        task_id, attempt, e
                    );
                    sleep(self.config.timer_retry_backoff).await;
                }
                Err(e) => {
                    error!(
                        "expiración de tarea {} agotó los intentos: {}",
                        task_id, e
                    );
                    if let Err(fail_err) = self
                        .fail_locked(task_id, &format!("fallo del timer: {}", e))
                        .await
                    {
                        error!("no se pudo marcar {} como fallida: {}", task_id, fail_err);
                    }
                    return false;
                }
            }
        }
    }

    // ---- internals ----

    fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn bump_generation(&self, task_id: &str) -> u64 {
        let mut entry = self.generations.entry(task_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn current_generation(&self, task_id: &str) -> u64 {
        self.generations.get(task_id).map(|g| *g).unwrap_or(0)
    }

    fn abort_timer(&self, task_id: &str) {
        if let Some((_, entry)) = self.timers.remove(task_id) {
            entry.handle.abort();
        }
    }

    /// Caller must hold the task lock.
    async fn fail_locked(&self, task_id: &str, reason: &str) -> Result<Task> {
        let (task, event) = self.store.fail_task(task_id, Utc::now(), reason).await?;
        if let Some(event) = event {
            self.bump_generation(task_id);
            self.abort_timer(task_id);
            self.events.publish(&event);
            warn!("tarea {} fallida: {}", task_id, reason);
            if task.hormigas_lote_id.is_some() {
                self.release_workers(&task).await;
            }
        }
        Ok(task)
    }

    /// Best-effort release at the provider boundary. The assignment rows in
    /// the store were already stamped by the terminal transition and remain
    /// the source of truth; a provider failure is recorded as an event and
    /// never rolls anything back.
    async fn release_workers(&self, task: &Task) {
        let Some(lote_id) = task.hormigas_lote_id.clone() else {
            return;
        };
        let hormigas: Vec<String> = match self.store.list_assignments(&task.id).await {
            Ok(rows) => rows.into_iter().map(|r| r.hormiga_id).collect(),
            Err(e) => {
                warn!("no se pudieron leer las asignaciones de {}: {}", task.id, e);
                Vec::new()
            }
        };

        let outcome = timeout(
            self.config.provider_timeout,
            self.workers
                .release_batch(&lote_id, &hormigas, task.alimento_recolectado),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {
                self.emit(
                    EventKind::WorkerBatchReleased,
                    format!("Lote {} devuelto ({} hormigas)", lote_id, hormigas.len()),
                    json!({
                        "tarea_id": task.id,
                        "lote_id": lote_id,
                        "hormigas": hormigas.len(),
                        "alimento_recolectado": task.alimento_recolectado,
                    }),
                )
                .await;
            }
            Ok(Err(e)) => {
                warn!("fallo al devolver el lote {}: {}", lote_id, e);
                self.emit(
                    EventKind::WorkerReleaseFailed,
                    format!("No se pudo devolver el lote {}: {}", lote_id, e),
                    json!({ "tarea_id": task.id, "lote_id": lote_id, "motivo": e.to_string() }),
                )
                .await;
            }
            Err(_) => {
                warn!("tiempo agotado al devolver el lote {}", lote_id);
                self.emit(
                    EventKind::WorkerReleaseFailed,
                    format!("Tiempo agotado al devolver el lote {}", lote_id),
                    json!({ "tarea_id": task.id, "lote_id": lote_id, "motivo": "timeout" }),
                )
                .await;
            }
        }
    }

    async fn notify_food_collected(&self, task: &Task) {
        let outcome = timeout(
            self.config.provider_timeout,
            self.food
                .mark_collected(&task.alimento_id, task.alimento_recolectado),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "no se pudo marcar el alimento {} como recolectado: {}",
                task.alimento_id, e
            ),
            Err(_) => warn!(
                "tiempo agotado al marcar el alimento {} como recolectado",
                task.alimento_id
            ),
        }
    }

    async fn emit(&self, kind: EventKind, description: String, payload: serde_json::Value) {
        match self.store.append_event(kind, description, payload).await {
            Ok(event) => self.events.publish(&event),
            Err(e) => warn!("no se pudo registrar el evento {}: {}", kind, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, FoodItem, FoodSnapshot, WorkerAssignment};
    use crate::providers::{InMemoryFoodProvider, InMemoryWorkerProvider};
    use crate::store::SledStore;
    use chrono::DateTime;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    /// Store decorator whose `complete_task` fails a fixed number of times
    /// with `StoreUnavailable` before delegating.
    struct FlakyStore {
        inner: Arc<SledStore>,
        complete_failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: Arc<SledStore>, failures: u32) -> Self {
            Self {
                inner,
                complete_failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait::async_trait]
    impl TaskStore for FlakyStore {
        async fn create_task(&self, task_id: &str, snapshot: FoodSnapshot) -> Result<(Task, Event)> {
            self.inner.create_task(task_id, snapshot).await
        }

        async fn reserve_task(
            &self,
            task_id: &str,
            batch_id: &str,
            worker_ids: &[String],
        ) -> Result<(Task, Event)> {
            self.inner.reserve_task(task_id, batch_id, worker_ids).await
        }

        async fn start_task(&self, task_id: &str, start: DateTime<Utc>) -> Result<(Task, Event)> {
            self.inner.start_task(task_id, start).await
        }

        async fn complete_task(
            &self,
            task_id: &str,
            end: DateTime<Utc>,
            collected: u32,
            automatic: bool,
        ) -> Result<(Task, Event)> {
            if self.complete_failures.load(Ordering::Relaxed) > 0 {
                self.complete_failures.fetch_sub(1, Ordering::Relaxed);
                return Err(EngineError::StoreUnavailable("corte simulado".to_string()));
            }
            self.inner
                .complete_task(task_id, end, collected, automatic)
                .await
        }

        async fn cancel_task(
            &self,
            task_id: &str,
            end: DateTime<Utc>,
            reason: &str,
        ) -> Result<(Task, Option<Event>)> {
            self.inner.cancel_task(task_id, end, reason).await
        }

        async fn fail_task(
            &self,
            task_id: &str,
            end: DateTime<Utc>,
            reason: &str,
        ) -> Result<(Task, Option<Event>)> {
            self.inner.fail_task(task_id, end, reason).await
        }

        async fn load_task(&self, task_id: &str) -> Result<Task> {
            self.inner.load_task(task_id).await
        }

        async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
            self.inner.list_tasks(filter).await
        }

        async fn list_assignments(&self, task_id: &str) -> Result<Vec<WorkerAssignment>> {
            self.inner.list_assignments(task_id).await
        }

        async fn active_assignment_count(&self) -> Result<u64> {
            self.inner.active_assignment_count().await
        }

        async fn append_event(
            &self,
            kind: EventKind,
            description: String,
            payload: Value,
        ) -> Result<Event> {
            self.inner.append_event(kind, description, payload).await
        }

        async fn list_events(&self, limit: Option<usize>) -> Result<Vec<Event>> {
            self.inner.list_events(limit).await
        }

        async fn event_count(&self) -> Result<u64> {
            self.inner.event_count().await
        }

        async fn flush(&self) -> Result<()> {
            self.inner.flush().await
        }
    }

    /// Pool that always issues a single worker and refuses every return.
    struct StingyPool;

    #[async_trait::async_trait]
    impl WorkerProvider for StingyPool {
        async fn is_available(&self) -> bool {
            true
        }

        async fn request_batch(&self, _count: u32) -> Result<WorkerBatch> {
            Ok(WorkerBatch {
                lote_id: "L-corto".to_string(),
                hormigas: vec!["H1".to_string()],
            })
        }

        async fn release_batch(
            &self,
            _batch_id: &str,
            _worker_ids: &[String],
            _collected: u32,
        ) -> Result<()> {
            Err(EngineError::WorkerProviderUnavailable {
                reason: "devoluciones cerradas".to_string(),
            })
        }
    }

    async fn seed_overdue_running(store: &SledStore, task_id: &str) -> DateTime<Utc> {
        let started = Utc::now() - chrono::Duration::seconds(100);
        store
            .create_task(task_id, FoodItem::new("A1", "Hoja de roble", 2, 10, 3).snapshot())
            .await
            .unwrap();
        store
            .reserve_task(task_id, "L1", &["H1".to_string(), "H2".to_string()])
            .await
            .unwrap();
        store.start_task(task_id, started).await.unwrap();
        started
    }

    fn engine_over(store: Arc<dyn TaskStore>) -> Arc<Engine> {
        let events = EventLog::new(store.clone(), 64);
        Engine::new(
            store,
            events,
            Arc::new(InMemoryFoodProvider::with_foods([FoodItem::new(
                "A1",
                "Hoja de roble",
                2,
                10,
                3,
            )])),
            Arc::new(InMemoryWorkerProvider::new()),
            Arc::new(EngineConfig::default()),
        )
    }

    struct Fixture {
        engine: Arc<Engine>,
        store: Arc<SledStore>,
        food: Arc<InMemoryFoodProvider>,
        workers: Arc<InMemoryWorkerProvider>,
        _dir: TempDir,
    }

    fn fixture_with_pool(workers: InMemoryWorkerProvider) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SledStore::open(dir.path().join("store")).unwrap());
        let food = Arc::new(InMemoryFoodProvider::with_foods([
            FoodItem::new("A1", "Hoja de roble", 2, 10, 3),
            FoodItem::new("A2", "Semilla de girasol", 1, 5, 60),
            FoodItem::new("A4", "Néctar", 4, 20, 10),
        ]));
        let workers = Arc::new(workers);
        let events = EventLog::new(store.clone(), 64);
        let engine = Engine::new(
            store.clone(),
            events,
            food.clone(),
            workers.clone(),
            Arc::new(EngineConfig::default()),
        );
        Fixture {
            engine,
            store,
            food,
            workers,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_pool(InMemoryWorkerProvider::new())
    }

    async fn event_kinds(store: &SledStore) -> Vec<EventKind> {
        let events: Vec<Event> = store.list_events(None).await.unwrap();
        events.iter().rev().map(|e| e.tipo_evento).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_completion_happy_path() {
        let f = fixture();
        f.engine.create("T1001", "A1").await.unwrap();
        f.engine.reserve("T1001", None).await.unwrap();
        f.engine.start("T1001").await.unwrap();

        // Past the 3-second collection window.
        sleep(Duration::from_secs(4)).await;

        let task = f.store.load_task("T1001").await.unwrap();
        assert_eq!(task.estado, TaskState::Completed);
        assert_eq!(task.alimento_recolectado, 10);
        assert!(task.automatica);
        assert!(task.fecha_fin.unwrap() >= task.fecha_inicio.unwrap());

        assert_eq!(
            event_kinds(&f.store).await,
            vec![
                EventKind::TaskCreated,
                EventKind::TaskWorkersReserved,
                EventKind::TaskStarted,
                EventKind::TaskCompletedAuto,
                EventKind::WorkerBatchReleased,
            ]
        );
        assert_eq!(f.workers.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_completion_with_override() {
        let f = fixture();
        f.engine.create("T1002", "A2").await.unwrap();
        f.engine.reserve("T1002", None).await.unwrap();
        f.engine.start("T1002").await.unwrap();

        sleep(Duration::from_secs(2)).await;
        let task = f.engine.complete_manual("T1002", Some(3)).await.unwrap();
        assert_eq!(task.estado, TaskState::Completed);
        assert_eq!(task.alimento_recolectado, 3);
        assert!(!task.automatica);

        // The obsolete timer must stay silent.
        sleep(Duration::from_secs(90)).await;
        let kinds = event_kinds(&f.store).await;
        assert!(!kinds.contains(&EventKind::TaskCompletedAuto));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::TaskCompletedManual)
                .count(),
            1
        );
        assert_eq!(f.workers.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_clamped_to_stock() {
        let f = fixture();
        f.engine.create("T1", "A2").await.unwrap();
        f.engine.reserve("T1", None).await.unwrap();
        f.engine.start("T1").await.unwrap();

        let task = f.engine.complete_manual("T1", Some(999)).await.unwrap();
        assert_eq!(task.alimento_recolectado, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_override_rejected() {
        let f = fixture();
        f.engine.create("T1", "A2").await.unwrap();
        f.engine.reserve("T1", None).await.unwrap();
        f.engine.start("T1").await.unwrap();

        let err = f.engine.complete_manual("T1", Some(-1)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        let task = f.store.load_task("T1").await.unwrap();
        assert_eq!(task.estado, TaskState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_start_silences_timer() {
        let f = fixture();
        f.engine.create("T1003", "A1").await.unwrap();
        f.engine.reserve("T1003", None).await.unwrap();
        f.engine.start("T1003").await.unwrap();

        sleep(Duration::from_secs(1)).await;
        let task = f.engine.cancel("T1003", Some("cambio de plan")).await.unwrap();
        assert_eq!(task.estado, TaskState::Cancelled);
        assert_eq!(f.workers.outstanding(), 0);

        let before = f.store.event_count().await.unwrap();
        sleep(Duration::from_secs(10)).await;
        // No secondary events from the dead timer.
        assert_eq!(f.store.event_count().await.unwrap(), before);
        let kinds = event_kinds(&f.store).await;
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::WorkerBatchReleased)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let f = fixture();
        f.engine.create("T1", "A1").await.unwrap();
        f.engine.cancel("T1", None).await.unwrap();
        let before = f.store.event_count().await.unwrap();

        let task = f.engine.cancel("T1", Some("otra vez")).await.unwrap();
        assert_eq!(task.estado, TaskState::Cancelled);
        assert_eq!(f.store.event_count().await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_then_cancel_without_reserve() {
        let f = fixture();
        f.engine.create("T1", "A1").await.unwrap();
        let task = f.engine.cancel("T1", None).await.unwrap();
        assert_eq!(task.estado, TaskState::Cancelled);
        assert!(f.store.list_assignments("T1").await.unwrap().is_empty());
        let kinds = event_kinds(&f.store).await;
        assert!(!kinds.contains(&EventKind::WorkerBatchReleased));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_expiry_is_noop() {
        let f = fixture();
        f.engine.create("T1", "A2").await.unwrap();
        f.engine.reserve("T1", None).await.unwrap();
        f.engine.start("T1").await.unwrap();
        f.engine.complete_manual("T1", None).await.unwrap();
        let before = f.store.event_count().await.unwrap();

        // Replays the captured (task_id, generation) of the superseded timer.
        f.engine.handle_expiry("T1", 1).await;
        assert_eq!(f.store.event_count().await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_create_rejected() {
        let f = fixture();
        f.engine.create("T1004", "A1").await.unwrap();
        let err = f.engine.create("T1004", "A1").await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTask { .. }));
        let kinds = event_kinds(&f.store).await;
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::TaskCreated)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_workers_leaves_task_pending() {
        let f = fixture_with_pool(InMemoryWorkerProvider::with_capacity(2));
        f.engine.create("T1", "A4").await.unwrap();

        let err = f.engine.reserve("T1", None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientWorkers {
                required: 4,
                offered: 2,
                ..
            }
        ));
        let task = f.store.load_task("T1").await.unwrap();
        assert_eq!(task.estado, TaskState::Pending);
        // The short batch went straight back to the pool.
        assert_eq!(f.workers.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_batch_requires_exact_size() {
        let f = fixture();
        f.engine.create("T1", "A1").await.unwrap();
        let batch = WorkerBatch {
            lote_id: "L-externo".to_string(),
            hormigas: vec!["H1".to_string()],
        };
        let err = f.engine.reserve("T1", Some(batch)).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerCountMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_round_trip() {
        let f = fixture();
        f.engine.create("T1", "A2").await.unwrap();
        f.engine.reserve("T1", None).await.unwrap();
        assert_eq!(f.workers.outstanding(), 1);
        f.engine.start("T1").await.unwrap();
        f.engine.complete_manual("T1", None).await.unwrap();
        assert_eq!(f.workers.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_outages_surface_and_leave_no_state() {
        let f = fixture();
        f.food.set_online(false);
        let err = f.engine.create("T1", "A1").await.unwrap_err();
        assert!(matches!(err, EngineError::FoodProviderUnavailable { .. }));
        assert!(f.store.load_task("T1").await.is_err());

        f.food.set_online(true);
        f.engine.create("T1", "A1").await.unwrap();
        f.workers.set_online(false);
        let err = f.engine.reserve("T1", None).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerProviderUnavailable { .. }));
        let task = f.store.load_task("T1").await.unwrap();
        assert_eq!(task.estado, TaskState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_unavailable_food() {
        let f = fixture();
        let err = f.engine.create("T1", "A9").await.unwrap_err();
        assert!(matches!(err, EngineError::FoodNotFound { .. }));

        f.food.mark_collected("A1", 10).await.unwrap();
        let err = f.engine.create("T1", "A1").await.unwrap_err();
        assert!(matches!(err, EngineError::FoodUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_remaining_sentinel() {
        let f = fixture();
        f.engine.create("T1", "A2").await.unwrap();
        assert_eq!(f.engine.time_remaining("T1").await.unwrap(), None);

        f.engine.reserve("T1", None).await.unwrap();
        f.engine.start("T1").await.unwrap();
        let remaining = f.engine.time_remaining("T1").await.unwrap().unwrap();
        assert!(remaining <= 60);

        let err = f.engine.time_remaining("T9").await.unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_release_failure_keeps_terminal_state() {
        let f = fixture();
        f.engine.create("T1", "A2").await.unwrap();
        f.engine.reserve("T1", None).await.unwrap();
        f.engine.start("T1").await.unwrap();

        f.workers.set_online(false);
        let task = f.engine.complete_manual("T1", None).await.unwrap();
        assert_eq!(task.estado, TaskState::Completed);

        let kinds = event_kinds(&f.store).await;
        assert!(kinds.contains(&EventKind::WorkerReleaseFailed));
        assert!(!kinds.contains(&EventKind::WorkerBatchReleased));
        // Store rows are the source of truth and were released regardless.
        let rows = f.store.list_assignments("T1").await.unwrap();
        assert!(rows.iter().all(|r| r.fecha_liberacion.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timers() {
        let f = fixture();
        f.engine.create("T1", "A2").await.unwrap();
        f.engine.reserve("T1", None).await.unwrap();
        f.engine.start("T1").await.unwrap();

        f.engine.shutdown().await;
        sleep(Duration::from_secs(120)).await;
        // Timer never fired after shutdown.
        let task = f.store.load_task("T1").await.unwrap();
        assert_eq!(task.estado, TaskState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_retries_overdue_commit_after_store_hiccup() {
        let dir = TempDir::new().unwrap();
        let sled = Arc::new(SledStore::open(dir.path().join("store")).unwrap());
        let started = seed_overdue_running(&sled, "T1").await;

        // One commit fails, the retry lands.
        let engine = engine_over(Arc::new(FlakyStore::new(sled.clone(), 1)));
        let stats = engine.recover().await.unwrap();
        assert_eq!(stats.completed_overdue, 1);
        assert_eq!(stats.failed, 0);

        let task = sled.load_task("T1").await.unwrap();
        assert_eq!(task.estado, TaskState::Completed);
        assert!(task.automatica);
        assert_eq!(
            task.fecha_fin.unwrap(),
            started + chrono::Duration::seconds(3)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_fails_overdue_task_when_store_stays_down() {
        let dir = TempDir::new().unwrap();
        let sled = Arc::new(SledStore::open(dir.path().join("store")).unwrap());
        seed_overdue_running(&sled, "T1").await;

        // More outages than retry attempts: the task must not be stranded
        // running with no timer.
        let engine = engine_over(Arc::new(FlakyStore::new(sled.clone(), 99)));
        let stats = engine.recover().await.unwrap();
        assert_eq!(stats.completed_overdue, 0);
        assert_eq!(stats.failed, 1);

        let task = sled.load_task("T1").await.unwrap();
        assert_eq!(task.estado, TaskState::Failed);
        assert!(task.motivo.as_deref().unwrap().contains("fallo del timer"));
        let rows = sled.list_assignments("T1").await.unwrap();
        assert!(rows.iter().all(|r| r.fecha_liberacion.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_batch_return_failure_does_not_mask_shortage() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SledStore::open(dir.path().join("store")).unwrap());
        let events = EventLog::new(store.clone(), 64);
        let engine = Engine::new(
            store.clone(),
            events,
            Arc::new(InMemoryFoodProvider::with_foods([FoodItem::new(
                "A1",
                "Hoja de roble",
                2,
                10,
                3,
            )])),
            Arc::new(StingyPool),
            Arc::new(EngineConfig::default()),
        );

        engine.create("T1", "A1").await.unwrap();
        let err = engine.reserve("T1", None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientWorkers {
                required: 2,
                offered: 1,
                ..
            }
        ));
        let task = store.load_task("T1").await.unwrap();
        assert_eq!(task.estado, TaskState::Pending);
    }
}
