use crate::error::{EngineError, Result};
use crate::model::{Event, EventKind, FoodSnapshot, Task, TaskFilter, TaskState, WorkerAssignment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional, TransactionalTree};
use std::path::Path;
use tracing::{debug, info};

type TxnResult<T> = std::result::Result<T, ConflictableTransactionError<EngineError>>;

/// Persistence gateway: the sole writer to the embedded store.
///
/// Every mutating operation is a single transaction that also appends the
/// event describing the transition, so the event log can never disagree
/// with the task table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task in state `pendiente`.
    async fn create_task(&self, task_id: &str, snapshot: FoodSnapshot) -> Result<(Task, Event)>;

    /// Transition `pendiente -> lista` and record the worker assignments.
    async fn reserve_task(
        &self,
        task_id: &str,
        batch_id: &str,
        worker_ids: &[String],
    ) -> Result<(Task, Event)>;

    /// Transition `lista -> en_proceso` and stamp the start instant.
    async fn start_task(&self, task_id: &str, start: DateTime<Utc>) -> Result<(Task, Event)>;

    /// Transition `en_proceso -> completada`; stamps the end instant, the
    /// collected amount and the automatic flag, and releases assignments.
    async fn complete_task(
        &self,
        task_id: &str,
        end: DateTime<Utc>,
        collected: u32,
        automatic: bool,
    ) -> Result<(Task, Event)>;

    /// Cancel from any non-terminal state. Idempotent on already-cancelled:
    /// returns without mutation and without a second event.
    async fn cancel_task(
        &self,
        task_id: &str,
        end: DateTime<Utc>,
        reason: &str,
    ) -> Result<(Task, Option<Event>)>;

    /// Fail from any non-terminal state. Idempotent on already-failed.
    async fn fail_task(
        &self,
        task_id: &str,
        end: DateTime<Utc>,
        reason: &str,
    ) -> Result<(Task, Option<Event>)>;

    async fn load_task(&self, task_id: &str) -> Result<Task>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn list_assignments(&self, task_id: &str) -> Result<Vec<WorkerAssignment>>;

    /// Assignments not yet released, across all tasks.
    async fn active_assignment_count(&self) -> Result<u64>;

    /// Append a standalone event row (side-effects outside a transition).
    async fn append_event(
        &self,
        kind: EventKind,
        description: String,
        payload: Value,
    ) -> Result<Event>;

    /// Most recent events first.
    async fn list_events(&self, limit: Option<usize>) -> Result<Vec<Event>>;

    async fn event_count(&self) -> Result<u64>;

    async fn flush(&self) -> Result<()>;
}

/// Sled-backed implementation. One tree per table, mirroring the relational
/// layout of the original service: `tareas`, `asignaciones_hormiga_tarea`
/// (one row per task holding its assignment list) and `eventos` keyed by a
/// big-endian monotonic id so iteration order is commit order.
pub struct SledStore {
    db: sled::Db,
    tareas: sled::Tree,
    asignaciones: sled::Tree,
    eventos: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let tareas = db.open_tree("tareas")?;
        let asignaciones = db.open_tree("asignaciones_hormiga_tarea")?;
        let eventos = db.open_tree("eventos")?;
        info!("store abierto en {:?}", path.as_ref());
        Ok(Self {
            db,
            tareas,
            asignaciones,
            eventos,
        })
    }

    fn decode_task(bytes: &[u8]) -> TxnResult<Task> {
        bincode::deserialize(bytes)
            .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e)))
    }

    fn encode_task(task: &Task) -> TxnResult<Vec<u8>> {
        bincode::serialize(task)
            .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e)))
    }

    fn load_in_txn(tree: &TransactionalTree, task_id: &str) -> TxnResult<Task> {
        let bytes = tree.get(task_id.as_bytes())?.ok_or_else(|| {
            ConflictableTransactionError::Abort(EngineError::task_not_found(task_id))
        })?;
        Self::decode_task(&bytes)
    }

    fn put_in_txn(tree: &TransactionalTree, task: &Task) -> TxnResult<()> {
        tree.insert(task.id.as_bytes(), Self::encode_task(task)?)?;
        Ok(())
    }

    fn append_in_txn(
        eventos: &TransactionalTree,
        kind: EventKind,
        descripcion: String,
        payload: Value,
    ) -> TxnResult<Event> {
        let id = eventos.generate_id()?;
        let event = Event {
            id,
            tipo_evento: kind,
            descripcion,
            datos_adicionales: payload,
            fecha_evento: Utc::now(),
        };
        let bytes = serde_json::to_vec(&event)
            .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e)))?;
        eventos.insert(&id.to_be_bytes(), bytes)?;
        Ok(event)
    }

    /// Stamp `fecha_liberacion` on every still-active assignment of a task.
    fn release_in_txn(
        asignaciones: &TransactionalTree,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> TxnResult<()> {
        if let Some(bytes) = asignaciones.get(task_id.as_bytes())? {
            let mut rows: Vec<WorkerAssignment> = bincode::deserialize(&bytes)
                .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e)))?;
            for row in &mut rows {
                if row.fecha_liberacion.is_none() {
                    row.fecha_liberacion = Some(at);
                }
            }
            let encoded = bincode::serialize(&rows)
                .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e)))?;
            asignaciones.insert(task_id.as_bytes(), encoded)?;
        }
        Ok(())
    }

    fn unwrap_txn<T>(
        result: std::result::Result<T, TransactionError<EngineError>>,
    ) -> Result<T> {
        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => EngineError::StoreUnavailable(e.to_string()),
        })
    }

    fn illegal(task: &Task, to: TaskState) -> ConflictableTransactionError<EngineError> {
        ConflictableTransactionError::Abort(EngineError::IllegalState {
            task_id: task.id.clone(),
            from: task.estado,
            to,
        })
    }
}

#[async_trait]
impl TaskStore for SledStore {
    async fn create_task(&self, task_id: &str, snapshot: FoodSnapshot) -> Result<(Task, Event)> {
        let result = (&self.tareas, &self.asignaciones, &self.eventos).transaction(
            |(tareas, _asignaciones, eventos)| {
                if tareas.get(task_id.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        EngineError::DuplicateTask {
                            task_id: task_id.to_string(),
                        },
                    ));
                }
                let task = Task::new(task_id, snapshot.clone());
                Self::put_in_txn(tareas, &task)?;
                let event = Self::append_in_txn(
                    eventos,
                    EventKind::TaskCreated,
                    format!(
                        "Tarea {} creada para alimento {}",
                        task.id, task.alimento_id
                    ),
                    json!({
                        "tarea_id": task.id,
                        "alimento_id": task.alimento_id,
                        "hormigas_necesarias": task.alimento.cantidad_hormigas_necesarias,
                        "puntos_stock": task.alimento.puntos_stock,
                        "tiempo_recoleccion": task.alimento.tiempo_recoleccion,
                    }),
                )?;
                Ok((task, event))
            },
        );
        let created = Self::unwrap_txn(result)?;
        debug!("tarea {} creada", task_id);
        Ok(created)
    }

    async fn reserve_task(
        &self,
        task_id: &str,
        batch_id: &str,
        worker_ids: &[String],
    ) -> Result<(Task, Event)> {
        let result = (&self.tareas, &self.asignaciones, &self.eventos).transaction(
            |(tareas, asignaciones, eventos)| {
                let mut task = Self::load_in_txn(tareas, task_id)?;
                if task.estado != TaskState::Pending {
                    return Err(Self::illegal(&task, TaskState::Ready));
                }
                let required = task.alimento.cantidad_hormigas_necesarias;
                if worker_ids.len() as u32 != required {
                    return Err(ConflictableTransactionError::Abort(
                        EngineError::WorkerCountMismatch {
                            task_id: task_id.to_string(),
                            required,
                            got: worker_ids.len() as u32,
                        },
                    ));
                }

                let now = Utc::now();
                let rows: Vec<WorkerAssignment> = worker_ids
                    .iter()
                    .map(|worker_id| WorkerAssignment {
                        tarea_id: task_id.to_string(),
                        hormiga_id: worker_id.clone(),
                        lote_id: batch_id.to_string(),
                        fecha_asignacion: now,
                        fecha_liberacion: None,
                    })
                    .collect();
                let encoded = bincode::serialize(&rows)
                    .map_err(|e| ConflictableTransactionError::Abort(EngineError::from(e)))?;
                asignaciones.insert(task_id.as_bytes(), encoded)?;

                task.estado = TaskState::Ready;
                task.hormigas_lote_id = Some(batch_id.to_string());
                task.hormigas_asignadas = required;
                Self::put_in_txn(tareas, &task)?;

                let event = Self::append_in_txn(
                    eventos,
                    EventKind::TaskWorkersReserved,
                    format!(
                        "Tarea {}: lote {} reservado con {} hormigas",
                        task_id, batch_id, required
                    ),
                    json!({
                        "tarea_id": task_id,
                        "lote_id": batch_id,
                        "hormigas": worker_ids,
                    }),
                )?;
                Ok((task, event))
            },
        );
        Self::unwrap_txn(result)
    }

    async fn start_task(&self, task_id: &str, start: DateTime<Utc>) -> Result<(Task, Event)> {
        let result = (&self.tareas, &self.asignaciones, &self.eventos).transaction(
            |(tareas, _asignaciones, eventos)| {
                let mut task = Self::load_in_txn(tareas, task_id)?;
                if task.estado != TaskState::Ready {
                    return Err(Self::illegal(&task, TaskState::Running));
                }
                task.estado = TaskState::Running;
                task.fecha_inicio = Some(start);
                Self::put_in_txn(tareas, &task)?;

                let event = Self::append_in_txn(
                    eventos,
                    EventKind::TaskStarted,
                    format!(
                        "Tarea {} iniciada; duración {}s",
                        task_id, task.alimento.tiempo_recoleccion
                    ),
                    json!({
                        "tarea_id": task_id,
                        "fecha_inicio": start,
                        "tiempo_recoleccion": task.alimento.tiempo_recoleccion,
                    }),
                )?;
                Ok((task, event))
            },
        );
        Self::unwrap_txn(result)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        end: DateTime<Utc>,
        collected: u32,
        automatic: bool,
    ) -> Result<(Task, Event)> {
        let result = (&self.tareas, &self.asignaciones, &self.eventos).transaction(
            |(tareas, asignaciones, eventos)| {
                let mut task = Self::load_in_txn(tareas, task_id)?;
                if task.estado != TaskState::Running {
                    return Err(Self::illegal(&task, TaskState::Completed));
                }
                if collected > task.alimento.puntos_stock {
                    return Err(ConflictableTransactionError::Abort(
                        EngineError::InvalidArgument(format!(
                            "recolectado {} excede los puntos de stock {}",
                            collected, task.alimento.puntos_stock
                        )),
                    ));
                }
                task.estado = TaskState::Completed;
                task.fecha_fin = Some(end);
                task.alimento_recolectado = collected;
                task.automatica = automatic;
                Self::put_in_txn(tareas, &task)?;
                Self::release_in_txn(asignaciones, task_id, end)?;

                let (kind, modo) = if automatic {
                    (EventKind::TaskCompletedAuto, "automáticamente")
                } else {
                    (EventKind::TaskCompletedManual, "manualmente")
                };
                let event = Self::append_in_txn(
                    eventos,
                    kind,
                    format!(
                        "Tarea {} completada {}; recolectado {}",
                        task_id, modo, collected
                    ),
                    json!({
                        "tarea_id": task_id,
                        "alimento_id": task.alimento_id,
                        "alimento_recolectado": collected,
                        "automatica": automatic,
                        "fecha_fin": end,
                    }),
                )?;
                Ok((task, event))
            },
        );
        Self::unwrap_txn(result)
    }

    async fn cancel_task(
        &self,
        task_id: &str,
        end: DateTime<Utc>,
        reason: &str,
    ) -> Result<(Task, Option<Event>)> {
        let result = (&self.tareas, &self.asignaciones, &self.eventos).transaction(
            |(tareas, asignaciones, eventos)| {
                let mut task = Self::load_in_txn(tareas, task_id)?;
                if task.estado == TaskState::Cancelled {
                    return Ok((task, None));
                }
                if task.estado.is_terminal() {
                    return Err(Self::illegal(&task, TaskState::Cancelled));
                }
                task.estado = TaskState::Cancelled;
                task.fecha_fin = Some(end);
                task.motivo = Some(reason.to_string());
                Self::put_in_txn(tareas, &task)?;
                Self::release_in_txn(asignaciones, task_id, end)?;

                let event = Self::append_in_txn(
                    eventos,
                    EventKind::TaskCancelled,
                    format!("Tarea {} cancelada: {}", task_id, reason),
                    json!({
                        "tarea_id": task_id,
                        "motivo": reason,
                        "fecha_fin": end,
                    }),
                )?;
                Ok((task, Some(event)))
            },
        );
        Self::unwrap_txn(result)
    }

    async fn fail_task(
        &self,
        task_id: &str,
        end: DateTime<Utc>,
        reason: &str,
    ) -> Result<(Task, Option<Event>)> {
        let result = (&self.tareas, &self.asignaciones, &self.eventos).transaction(
            |(tareas, asignaciones, eventos)| {
                let mut task = Self::load_in_txn(tareas, task_id)?;
                if task.estado == TaskState::Failed {
                    return Ok((task, None));
                }
                if task.estado.is_terminal() {
                    return Err(Self::illegal(&task, TaskState::Failed));
                }
                task.estado = TaskState::Failed;
                task.fecha_fin = Some(end);
                task.motivo = Some(reason.to_string());
                Self::put_in_txn(tareas, &task)?;
                Self::release_in_txn(asignaciones, task_id, end)?;

                let event = Self::append_in_txn(
                    eventos,
                    EventKind::TaskFailed,
                    format!("Tarea {} fallida: {}", task_id, reason),
                    json!({
                        "tarea_id": task_id,
                        "motivo": reason,
                        "fecha_fin": end,
                    }),
                )?;
                Ok((task, Some(event)))
            },
        );
        Self::unwrap_txn(result)
    }

    async fn load_task(&self, task_id: &str) -> Result<Task> {
        let bytes = self
            .tareas
            .get(task_id.as_bytes())?
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for row in self.tareas.iter() {
            let (_, bytes) = row?;
            let task: Task = bincode::deserialize(&bytes)?;
            if filter.matches(&task) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.fecha_creacion.cmp(&b.fecha_creacion));
        Ok(tasks)
    }

    async fn list_assignments(&self, task_id: &str) -> Result<Vec<WorkerAssignment>> {
        match self.asignaciones.get(task_id.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn active_assignment_count(&self) -> Result<u64> {
        let mut count = 0;
        for row in self.asignaciones.iter() {
            let (_, bytes) = row?;
            let rows: Vec<WorkerAssignment> = bincode::deserialize(&bytes)?;
            count += rows.iter().filter(|a| a.fecha_liberacion.is_none()).count() as u64;
        }
        Ok(count)
    }

    async fn append_event(
        &self,
        kind: EventKind,
        description: String,
        payload: Value,
    ) -> Result<Event> {
        let id = self.db.generate_id()?;
        let event = Event {
            id,
            tipo_evento: kind,
            descripcion: description,
            datos_adicionales: payload,
            fecha_evento: Utc::now(),
        };
        self.eventos
            .insert(id.to_be_bytes(), serde_json::to_vec(&event)?)?;
        Ok(event)
    }

    async fn list_events(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for row in self.eventos.iter().rev() {
            let (_, bytes) = row?;
            events.push(serde_json::from_slice(&bytes)?);
            if let Some(limit) = limit {
                if events.len() >= limit {
                    break;
                }
            }
        }
        Ok(events)
    }

    async fn event_count(&self) -> Result<u64> {
        Ok(self.eventos.len() as u64)
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
