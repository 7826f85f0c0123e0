#![forbid(unsafe_code)]

// Worker management for mediasoup

use crate::media::config::{MediaConfig, RouterConfig, WorkerConfig};
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Owns the single mediasoup worker backing the world router
pub struct WorkerManager {
    worker: RwLock<Option<Worker>>,
    // Keeps the worker thread alive for as long as the manager exists
    _mediasoup_worker_manager: Arc<mediasoup::worker_manager::WorkerManager>,
}

impl WorkerManager {
    /// Creates a new `WorkerManager` and spawns its worker
    ///
    /// # Errors
    /// Returns an error if worker creation fails
    pub async fn new(config: Arc<MediaConfig>) -> MediaResult<Self> {
        let mediasoup_worker_manager = Arc::new(mediasoup::worker_manager::WorkerManager::new());
        let worker = Self::create_worker(&config.worker_config, &mediasoup_worker_manager).await?;
        info!("Created worker {}", worker.id());
        Self::setup_worker_handlers(&worker);

        Ok(Self {
            worker: RwLock::new(Some(worker)),
            _mediasoup_worker_manager: mediasoup_worker_manager,
        })
    }

    async fn create_worker(
        config: &WorkerConfig,
        manager: &mediasoup::worker_manager::WorkerManager,
    ) -> MediaResult<Worker> {
        manager
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::Other(anyhow::anyhow!("Failed to create worker: {e}")))
    }

    fn setup_worker_handlers(worker: &Worker) {
        let worker_id = worker.id();
        worker
            .on_dead(move |_reason| {
                error!("Worker {} died!", worker_id);
            })
            .detach();
    }

    /// Creates the world router on the worker
    ///
    /// # Errors
    /// Returns an error if the worker was shut down or mediasoup rejects the codecs
    pub async fn create_router(&self, config: &RouterConfig) -> MediaResult<Router> {
        let worker = self
            .worker
            .read()
            .await
            .clone()
            .ok_or_else(|| MediaError::Other(anyhow::anyhow!("Worker already shut down")))?;

        let router = worker
            .create_router(config.to_router_options())
            .await
            .map_err(|e| MediaError::Other(anyhow::anyhow!("Failed to create router: {e}")))?;

        debug!("Created router {} on worker {}", router.id(), worker.id());
        Ok(router)
    }

    /// Drops the worker; mediasoup closes it on drop
    pub async fn shutdown(&self) {
        info!("Shutting down worker");
        self.worker.write().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "spawns a mediasoup worker"]
    async fn test_worker_and_router_creation() {
        let config = Arc::new(MediaConfig::default());
        let manager = WorkerManager::new(config.clone()).await.unwrap();
        assert!(manager.create_router(&config.router_config).await.is_ok());

        manager.shutdown().await;
        assert!(manager.create_router(&config.router_config).await.is_err());
    }
}
