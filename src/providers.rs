use crate::error::{EngineError, Result};
use crate::model::{FoodItem, WorkerBatch};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Environment subsystem: the authoritative food catalog.
///
/// The engine caches snapshots but never owns the catalog; availability
/// updates flow back through `mark_collected`.
#[async_trait]
pub trait FoodProvider: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Catalog listing, optionally narrowed by zone or state
    /// (`disponible`, `en_proceso`, `recolectado`).
    async fn list_foods(&self, zona_id: Option<u32>, estado: Option<&str>)
        -> Result<Vec<FoodItem>>;

    async fn get_food(&self, food_id: &str) -> Result<Option<FoodItem>>;

    /// Tell the environment the food was collected.
    async fn mark_collected(&self, food_id: &str, collected: u32) -> Result<()>;
}

/// Queen subsystem: issues worker batches and takes them back.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Request a batch of `count` workers. The provider may return fewer
    /// than requested; callers decide whether a short batch is acceptable.
    async fn request_batch(&self, count: u32) -> Result<WorkerBatch>;

    /// Return a batch after the task reached a terminal state, reporting
    /// how much was collected.
    async fn release_batch(&self, batch_id: &str, worker_ids: &[String], collected: u32)
        -> Result<()>;
}

/// In-memory food catalog for tests and local runs.
pub struct InMemoryFoodProvider {
    foods: DashMap<String, FoodItem>,
    online: AtomicBool,
}

impl InMemoryFoodProvider {
    pub fn new() -> Self {
        Self {
            foods: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    pub fn with_foods(foods: impl IntoIterator<Item = FoodItem>) -> Self {
        let provider = Self::new();
        for food in foods {
            provider.foods.insert(food.id.clone(), food);
        }
        provider
    }

    /// Simulate an outage of the environment subsystem.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(EngineError::FoodProviderUnavailable {
                reason: "servicio de entorno no disponible".to_string(),
            })
        }
    }
}

impl Default for InMemoryFoodProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FoodProvider for InMemoryFoodProvider {
    async fn is_available(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    async fn list_foods(
        &self,
        _zona_id: Option<u32>,
        estado: Option<&str>,
    ) -> Result<Vec<FoodItem>> {
        self.ensure_online()?;
        let mut foods: Vec<FoodItem> = self
            .foods
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|food| match estado {
                Some("disponible") => food.disponible,
                Some("recolectado") => !food.disponible,
                _ => true,
            })
            .collect();
        foods.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(foods)
    }

    async fn get_food(&self, food_id: &str) -> Result<Option<FoodItem>> {
        self.ensure_online()?;
        Ok(self.foods.get(food_id).map(|entry| entry.value().clone()))
    }

    async fn mark_collected(&self, food_id: &str, collected: u32) -> Result<()> {
        self.ensure_online()?;
        if let Some(mut entry) = self.foods.get_mut(food_id) {
            entry.disponible = false;
            debug!("alimento {} marcado como recolectado ({})", food_id, collected);
        }
        Ok(())
    }
}

/// In-memory worker pool for tests and local runs.
///
/// Worker ids are minted sequentially (`H1`, `H2`, ...); batch ids come from
/// cuid2 like every other opaque identifier in the system. A bounded pool
/// hands out fewer workers than requested once it runs dry, which is how
/// the shortage path gets exercised.
pub struct InMemoryWorkerProvider {
    capacity: Option<u64>,
    issued: AtomicU64,
    next_worker: AtomicU64,
    batches: DashMap<String, Vec<String>>,
    online: AtomicBool,
}

impl InMemoryWorkerProvider {
    /// Unbounded pool.
    pub fn new() -> Self {
        Self {
            capacity: None,
            issued: AtomicU64::new(0),
            next_worker: AtomicU64::new(0),
            batches: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Pool that can never have more than `capacity` workers out at once.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Workers currently out in unreleased batches.
    pub fn outstanding(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(EngineError::WorkerProviderUnavailable {
                reason: "servicio de comunicación no disponible".to_string(),
            })
        }
    }
}

impl Default for InMemoryWorkerProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerProvider for InMemoryWorkerProvider {
    async fn is_available(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    async fn request_batch(&self, count: u32) -> Result<WorkerBatch> {
        self.ensure_online()?;
        let granted = match self.capacity {
            Some(capacity) => {
                let free = capacity.saturating_sub(self.issued.load(Ordering::Relaxed));
                (count as u64).min(free)
            }
            None => count as u64,
        };
        let hormigas: Vec<String> = (0..granted)
            .map(|_| format!("H{}", self.next_worker.fetch_add(1, Ordering::Relaxed) + 1))
            .collect();
        self.issued.fetch_add(granted, Ordering::Relaxed);

        let batch = WorkerBatch {
            lote_id: cuid2::create_id(),
            hormigas: hormigas.clone(),
        };
        self.batches.insert(batch.lote_id.clone(), hormigas);
        info!(
            "lote {} emitido con {} de {} hormigas solicitadas",
            batch.lote_id,
            batch.hormigas.len(),
            count
        );
        Ok(batch)
    }

    async fn release_batch(
        &self,
        batch_id: &str,
        worker_ids: &[String],
        collected: u32,
    ) -> Result<()> {
        self.ensure_online()?;
        if let Some((_, hormigas)) = self.batches.remove(batch_id) {
            self.issued
                .fetch_sub(hormigas.len() as u64, Ordering::Relaxed);
            debug!(
                "lote {} devuelto ({} hormigas, {} recolectado)",
                batch_id,
                worker_ids.len(),
                collected
            );
        }
        Ok(())
    }
}
