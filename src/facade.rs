use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::model::{Event, FoodItem, Task, TaskFilter, TaskState, WorkerBatch};
use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::debug;

/// Wire projection of a task. Field names follow the Spanish surface of the
/// service; the HTTP layer serialises these as-is.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    pub alimento_id: String,
    pub alimento_nombre: String,
    pub estado: TaskState,
    pub hormigas_lote_id: Option<String>,
    pub hormigas_asignadas: u32,
    pub fecha_creacion: DateTime<Utc>,
    pub fecha_inicio: Option<DateTime<Utc>>,
    pub fecha_fin: Option<DateTime<Utc>>,
    pub alimento_recolectado: u32,
    pub automatica: bool,
    pub motivo: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            alimento_id: task.alimento_id.clone(),
            alimento_nombre: task.alimento.nombre.clone(),
            estado: task.estado,
            hormigas_lote_id: task.hormigas_lote_id.clone(),
            hormigas_asignadas: task.hormigas_asignadas,
            fecha_creacion: task.fecha_creacion,
            fecha_inicio: task.fecha_inicio,
            fecha_fin: task.fecha_fin,
            alimento_recolectado: task.alimento_recolectado,
            automatica: task.automatica,
            motivo: task.motivo.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub status: &'static str,
    pub version: &'static str,
    pub entorno_disponible: bool,
    pub comunicacion_disponible: bool,
}

/// `GET /tareas/{id}/status`: state plus times and counts.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub tarea_id: String,
    pub estado: TaskState,
    pub fecha_creacion: DateTime<Utc>,
    pub fecha_inicio: Option<DateTime<Utc>>,
    pub fecha_fin: Option<DateTime<Utc>>,
    pub hormigas_asignadas: u32,
    pub alimento_recolectado: u32,
    pub tiempo_restante_segundos: Option<u64>,
    pub progreso_porcentaje: Option<f64>,
}

/// `GET /tareas/{id}/tiempo-restante`: only answerable while running.
#[derive(Debug, Clone, Serialize)]
pub struct TimeRemainingView {
    pub tarea_id: String,
    pub tiempo_restante_segundos: u64,
    pub tiempo_restante_minutos: f64,
    pub progreso_porcentaje: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatisticsView {
    pub total_tareas: u64,
    pub tareas_pendientes: u64,
    pub tareas_listas: u64,
    pub tareas_en_proceso: u64,
    pub tareas_completadas: u64,
    pub tareas_canceladas: u64,
    pub tareas_fallidas: u64,
    pub total_alimento_recolectado: u64,
    /// Workers held by tasks in `lista` or `en_proceso`.
    pub hormigas_reservadas: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventsView {
    pub total: u64,
    pub eventos: Vec<Event>,
}

/// Query and control facade: the only surface the HTTP front-end talks to.
///
/// Control calls delegate to the engine; queries are stateless projections
/// over the store and never mutate anything.
#[derive(Clone)]
pub struct Facade {
    engine: Arc<Engine>,
    store: Arc<dyn TaskStore>,
}

impl Facade {
    pub fn new(engine: Arc<Engine>, store: Arc<dyn TaskStore>) -> Self {
        Self { engine, store }
    }

    pub async fn health(&self) -> HealthView {
        let probe = self.engine.config().healthcheck_timeout;
        let entorno = timeout(probe, self.engine.food_provider().is_available())
            .await
            .unwrap_or(false);
        let comunicacion = timeout(probe, self.engine.worker_provider().is_available())
            .await
            .unwrap_or(false);
        HealthView {
            status: if entorno && comunicacion {
                "ok"
            } else {
                "degradado"
            },
            version: env!("CARGO_PKG_VERSION"),
            entorno_disponible: entorno,
            comunicacion_disponible: comunicacion,
        }
    }

    /// Catalog passthrough to the food provider.
    pub async fn list_foods(
        &self,
        zona_id: Option<u32>,
        estado: Option<&str>,
    ) -> Result<Vec<FoodItem>> {
        match timeout(
            self.engine.config().provider_timeout,
            self.engine.food_provider().list_foods(zona_id, estado),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::FoodProviderUnavailable {
                reason: "sin respuesta del catálogo de alimentos".to_string(),
            }),
        }
    }

    // ---- control operations ----

    pub async fn create_task(&self, task_id: &str, food_id: &str) -> Result<TaskView> {
        let task = self.engine.create(task_id, food_id).await?;
        Ok(TaskView::from(&task))
    }

    pub async fn reserve_task(
        &self,
        task_id: &str,
        batch: Option<WorkerBatch>,
    ) -> Result<TaskView> {
        let task = self.engine.reserve(task_id, batch).await?;
        Ok(TaskView::from(&task))
    }

    pub async fn start_task(&self, task_id: &str) -> Result<TaskView> {
        let task = self.engine.start(task_id).await?;
        Ok(TaskView::from(&task))
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        collected_override: Option<i64>,
    ) -> Result<TaskView> {
        let task = self.engine.complete_manual(task_id, collected_override).await?;
        Ok(TaskView::from(&task))
    }

    pub async fn cancel_task(&self, task_id: &str, reason: Option<&str>) -> Result<TaskView> {
        let task = self.engine.cancel(task_id, reason).await?;
        Ok(TaskView::from(&task))
    }

    // ---- queries ----

    pub async fn get_task(&self, task_id: &str) -> Result<TaskView> {
        let task = self.store.load_task(task_id).await?;
        Ok(TaskView::from(&task))
    }

    /// Task listing, optionally narrowed by wire state name and food id.
    /// An unknown state name is a caller error, not an empty result.
    pub async fn list_tasks(
        &self,
        estado: Option<&str>,
        alimento_id: Option<&str>,
    ) -> Result<Vec<TaskView>> {
        let estado = match estado {
            Some(name) => Some(TaskState::from_str(name).ok_or_else(|| {
                EngineError::InvalidArgument(format!("estado desconocido: {}", name))
            })?),
            None => None,
        };
        let filter = TaskFilter {
            estado,
            alimento_id: alimento_id.map(str::to_string),
        };
        let tasks = self.store.list_tasks(&filter).await?;
        Ok(tasks.iter().map(TaskView::from).collect())
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusView> {
        let task = self.store.load_task(task_id).await?;
        let now = Utc::now();
        Ok(TaskStatusView {
            tarea_id: task.id.clone(),
            estado: task.estado,
            fecha_creacion: task.fecha_creacion,
            fecha_inicio: task.fecha_inicio,
            fecha_fin: task.fecha_fin,
            hormigas_asignadas: task.hormigas_asignadas,
            alimento_recolectado: task.alimento_recolectado,
            tiempo_restante_segundos: task.remaining_seconds(now),
            progreso_porcentaje: task.progress_percent(now),
        })
    }

    /// Fails with `IllegalState` when the task is not running, which the
    /// HTTP layer maps to 409.
    pub async fn time_remaining(&self, task_id: &str) -> Result<TimeRemainingView> {
        let task = self.store.load_task(task_id).await?;
        let now = Utc::now();
        let (Some(remaining), Some(progress)) =
            (task.remaining_seconds(now), task.progress_percent(now))
        else {
            return Err(EngineError::IllegalState {
                task_id: task_id.to_string(),
                from: task.estado,
                to: TaskState::Running,
            });
        };
        Ok(TimeRemainingView {
            tarea_id: task.id,
            tiempo_restante_segundos: remaining,
            tiempo_restante_minutos: (remaining as f64 / 60.0 * 100.0).round() / 100.0,
            progreso_porcentaje: (progress * 100.0).round() / 100.0,
        })
    }

    pub async fn statistics(&self) -> Result<StatisticsView> {
        let tasks = self.store.list_tasks(&TaskFilter::default()).await?;
        let mut stats = StatisticsView::default();
        for task in &tasks {
            stats.total_tareas += 1;
            match task.estado {
                TaskState::Pending => stats.tareas_pendientes += 1,
                TaskState::Ready => stats.tareas_listas += 1,
                TaskState::Running => stats.tareas_en_proceso += 1,
                TaskState::Completed => stats.tareas_completadas += 1,
                TaskState::Cancelled => stats.tareas_canceladas += 1,
                TaskState::Failed => stats.tareas_fallidas += 1,
            }
            stats.total_alimento_recolectado += task.alimento_recolectado as u64;
            if matches!(task.estado, TaskState::Ready | TaskState::Running) {
                stats.hormigas_reservadas += task.hormigas_asignadas as u64;
            }
        }
        debug!(
            "estadísticas calculadas sobre {} tareas",
            stats.total_tareas
        );
        Ok(stats)
    }

    pub async fn events(&self, limit: Option<usize>) -> Result<EventsView> {
        let total = self.store.event_count().await?;
        let eventos = self.store.list_events(limit).await?;
        Ok(EventsView { total, eventos })
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<Event> {
        self.engine.events().subscribe()
    }
}
