use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Food catalog entry as served by the environment provider.
///
/// The engine never owns this record; it only captures a [`FoodSnapshot`]
/// from it at task creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodItem {
    pub id: String,
    pub nombre: String,
    pub cantidad_hormigas_necesarias: u32,
    pub puntos_stock: u32,
    /// Collection duration in seconds.
    pub tiempo_recoleccion: u64,
    pub disponible: bool,
    pub fecha_creacion: DateTime<Utc>,
}

impl FoodItem {
    pub fn new(
        id: impl Into<String>,
        nombre: impl Into<String>,
        cantidad_hormigas_necesarias: u32,
        puntos_stock: u32,
        tiempo_recoleccion: u64,
    ) -> Self {
        Self {
            id: id.into(),
            nombre: nombre.into(),
            cantidad_hormigas_necesarias,
            puntos_stock,
            tiempo_recoleccion,
            disponible: true,
            fecha_creacion: Utc::now(),
        }
    }

    /// Catalog entries with zeroed requirements are malformed upstream data.
    pub fn is_well_formed(&self) -> bool {
        self.cantidad_hormigas_necesarias > 0
            && self.puntos_stock > 0
            && self.tiempo_recoleccion > 0
    }

    pub fn snapshot(&self) -> FoodSnapshot {
        FoodSnapshot {
            alimento_id: self.id.clone(),
            nombre: self.nombre.clone(),
            cantidad_hormigas_necesarias: self.cantidad_hormigas_necesarias,
            puntos_stock: self.puntos_stock,
            tiempo_recoleccion: self.tiempo_recoleccion,
        }
    }
}

/// Immutable copy of the food attributes captured when a task is created.
/// All later decisions about the task use this snapshot, never the live
/// catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodSnapshot {
    pub alimento_id: String,
    pub nombre: String,
    pub cantidad_hormigas_necesarias: u32,
    pub puntos_stock: u32,
    pub tiempo_recoleccion: u64,
}

/// Lifecycle state of a collection task.
///
/// Transitions form a DAG: `Pending -> Ready -> Running -> Completed`, with
/// `Cancelled` reachable from any non-terminal state and `Failed` reserved
/// for store/provider breakdowns. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "lista")]
    Ready,
    #[serde(rename = "en_proceso")]
    Running,
    #[serde(rename = "completada")]
    Completed,
    #[serde(rename = "cancelada")]
    Cancelled,
    #[serde(rename = "fallida")]
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Ready) => true,
            (Ready, Running) => true,
            (Running, Completed) => true,
            (from, Cancelled) | (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Wire name, matching the Spanish surface of the original service.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pendiente",
            Self::Ready => "lista",
            Self::Running => "en_proceso",
            Self::Completed => "completada",
            Self::Cancelled => "cancelada",
            Self::Failed => "fallida",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pendiente" => Some(Self::Pending),
            "lista" => Some(Self::Ready),
            "en_proceso" => Some(Self::Running),
            "completada" => Some(Self::Completed),
            "cancelada" => Some(Self::Cancelled),
            "fallida" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collection task: the central entity of the engine.
///
/// Created in `Pending`, mutated only by the engine through the store, never
/// deleted. Terminal rows are kept for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub alimento_id: String,
    pub alimento: FoodSnapshot,
    pub estado: TaskState,
    /// Batch identifier issued by the worker provider; set on reserve.
    pub hormigas_lote_id: Option<String>,
    /// Count of workers actually assigned.
    pub hormigas_asignadas: u32,
    pub fecha_creacion: DateTime<Utc>,
    pub fecha_inicio: Option<DateTime<Utc>>,
    pub fecha_fin: Option<DateTime<Utc>>,
    /// Zero until the task completes.
    pub alimento_recolectado: u32,
    /// True when completion came from the timer rather than a manual call.
    pub automatica: bool,
    pub motivo: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, snapshot: FoodSnapshot) -> Self {
        Self {
            id: id.into(),
            alimento_id: snapshot.alimento_id.clone(),
            alimento: snapshot,
            estado: TaskState::Pending,
            hormigas_lote_id: None,
            hormigas_asignadas: 0,
            fecha_creacion: Utc::now(),
            fecha_inicio: None,
            fecha_fin: None,
            alimento_recolectado: 0,
            automatica: false,
            motivo: None,
        }
    }

    /// Seconds left before auto-completion, clamped to zero. `None` for any
    /// state other than `Running`.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.estado != TaskState::Running {
            return None;
        }
        let started = self.fecha_inicio?;
        let elapsed = (now - started).num_seconds();
        let total = self.alimento.tiempo_recoleccion as i64;
        Some((total - elapsed).max(0) as u64)
    }

    /// Progress through the collection window as a percentage in `[0, 100]`.
    pub fn progress_percent(&self, now: DateTime<Utc>) -> Option<f64> {
        if self.estado != TaskState::Running {
            return None;
        }
        let started = self.fecha_inicio?;
        let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
        let total = self.alimento.tiempo_recoleccion as f64;
        Some((elapsed / total * 100.0).clamp(0.0, 100.0))
    }
}

/// Relation between a task and one worker inside its batch. Rows survive
/// release for audit; `fecha_liberacion` is stamped exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub tarea_id: String,
    pub hormiga_id: String,
    pub lote_id: String,
    pub fecha_asignacion: DateTime<Utc>,
    pub fecha_liberacion: Option<DateTime<Utc>>,
}

/// A batch of workers issued by the worker provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBatch {
    pub lote_id: String,
    pub hormigas: Vec<String>,
}

/// Append-only lifecycle record. Ids increase monotonically in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub tipo_evento: EventKind,
    pub descripcion: String,
    pub datos_adicionales: Value,
    pub fecha_evento: DateTime<Utc>,
}

/// Exhaustive taxonomy of lifecycle events. The kind plus the structured
/// payload is the machine contract; descriptions are for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskWorkersReserved,
    TaskStarted,
    TaskProgressTick,
    TaskCompletedAuto,
    TaskCompletedManual,
    TaskCancelled,
    TaskFailed,
    WorkerBatchReleased,
    WorkerReleaseFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskWorkersReserved => "task_workers_reserved",
            Self::TaskStarted => "task_started",
            Self::TaskProgressTick => "task_progress_tick",
            Self::TaskCompletedAuto => "task_completed_auto",
            Self::TaskCompletedManual => "task_completed_manual",
            Self::TaskCancelled => "task_cancelled",
            Self::TaskFailed => "task_failed",
            Self::WorkerBatchReleased => "worker_batch_released",
            Self::WorkerReleaseFailed => "worker_release_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Projection filter for task listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub estado: Option<TaskState>,
    pub alimento_id: Option<String>,
}

impl TaskFilter {
    pub fn by_state(estado: TaskState) -> Self {
        Self {
            estado: Some(estado),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(estado) = self.estado {
            if task.estado != estado {
                return false;
            }
        }
        if let Some(alimento_id) = &self.alimento_id {
            if &task.alimento_id != alimento_id {
                return false;
            }
        }
        true
    }
}
