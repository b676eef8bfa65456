//! Ownership of the single loaded model for the life of the process.

use std::{path::Path, sync::Arc, time::Instant};

use candle_core::Device;
use image::DynamicImage;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{select_best_device, DeviceMap, Error, ExecutionDevice, ImageModel, Loader, Result};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Starting,
    Ready,
    ShuttingDown,
}

serde_plain::derive_display_from_serialize!(ServiceState);

/// The loaded model bound to its execution device.
pub struct ModelHandle {
    model: Box<dyn ImageModel>,
    device: Device,
}

impl ModelHandle {
    pub fn device(&self) -> ExecutionDevice {
        ExecutionDevice::from(&self.device)
    }
}

/// Owns at most one [`ModelHandle`].
///
/// Calls to [`synthesize`](Self::synthesize) are serialized: the handle sits
/// behind a single-slot async mutex and inference runs on the blocking pool
/// while the slot is held.
pub struct ModelManager {
    state: watch::Sender<ServiceState>,
    slot: Arc<Mutex<Option<ModelHandle>>>,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ServiceState::Starting),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// Selects a device, loads the weights under `weights` with `loader` and
    /// moves to [`ServiceState::Ready`]. On failure the state stays
    /// [`ServiceState::Starting`] and the cause is returned. A [`stop`](Self::stop)
    /// issued while the weights load wins: the model is discarded.
    pub async fn start<L: Loader>(&self, loader: &L, weights: &Path, device_map: DeviceMap) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            warn!("model already loaded, ignoring start");
            return Ok(());
        }
        self.state.send_replace(ServiceState::Starting);

        let started = Instant::now();
        info!(weights = %weights.display(), device = %device_map, "loading model");
        let device = select_best_device(device_map)
            .map_err(|e| Error::initialization(format!("device unusable: {e:#}")))?;
        let model = loader
            .load(weights, &device)
            .await
            .map_err(|e| Error::initialization(format!("{e:#}")))?;

        let handle = ModelHandle {
            model: Box::new(model),
            device,
        };
        info!(
            device = %handle.device(),
            load_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        let promoted = self.state.send_if_modified(|state| {
            if *state == ServiceState::Starting {
                *state = ServiceState::Ready;
                true
            } else {
                false
            }
        });
        if !promoted {
            warn!("shutdown requested while loading, discarding model");
            return Err(Error::initialization("shutdown requested while the model was loading"));
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Runs the model once. Waits for any synthesis already in progress.
    pub async fn synthesize(&self, prompt: &str, steps: usize, seed: Option<u64>) -> Result<DynamicImage> {
        let state = self.state();
        if state != ServiceState::Ready {
            return Err(Error::Unavailable { state });
        }

        let slot = self.slot.clone().lock_owned().await;
        // stop() may have won the race for the slot
        if slot.is_none() {
            return Err(Error::Unavailable { state: self.state() });
        }

        let prompt = prompt.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut slot = slot;
            let handle = slot.as_mut().ok_or(Error::Unavailable {
                state: ServiceState::ShuttingDown,
            })?;
            handle
                .model
                .synthesize(&prompt, steps, seed)
                .map_err(|e| Error::Inference(format!("{e:#}")))
        })
        .await
        .map_err(|e| Error::Inference(format!("inference task failed: {e}")))?
    }

    /// Rejects new work, waits for in-flight synthesis or loading, then
    /// releases the model and its device. With nothing loaded or loading it
    /// is a no-op and the state is left alone.
    pub async fn stop(&self) {
        if let Ok(slot) = self.slot.try_lock() {
            if slot.is_none() {
                debug!(state = %self.state(), "no model loaded, nothing to release");
                return;
            }
        }

        self.state.send_replace(ServiceState::ShuttingDown);
        let handle = self.slot.lock().await.take();
        // a start that held the slot may have overwritten the state
        self.state.send_replace(ServiceState::ShuttingDown);
        let Some(handle) = handle else {
            debug!("model load abandoned, nothing to release");
            return;
        };

        let device = handle.device.clone();
        drop(handle);
        if let Err(e) = device.synchronize() {
            warn!("failed to synchronize device during release: {e}");
        }
        info!(device = %ExecutionDevice::from(&device), "model released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLoader, FakeModel};
    use std::time::Duration;

    fn weights() -> &'static Path {
        Path::new("unused")
    }

    #[tokio::test]
    async fn readiness_follows_the_lifecycle() {
        let manager = ModelManager::new();
        assert_eq!(manager.state(), ServiceState::Starting);
        assert!(!manager.is_ready());

        manager
            .start(&FakeLoader::new(FakeModel::default()), weights(), DeviceMap::ForceCpu)
            .await
            .unwrap();
        assert_eq!(manager.state(), ServiceState::Ready);
        assert!(manager.is_ready());

        manager.stop().await;
        assert_eq!(manager.state(), ServiceState::ShuttingDown);
        assert!(!manager.is_ready());

        // idempotent
        manager.stop().await;
        assert_eq!(manager.state(), ServiceState::ShuttingDown);
    }

    #[tokio::test]
    async fn stop_before_start_leaves_the_state_alone() {
        let manager = ModelManager::new();
        manager.stop().await;
        assert_eq!(manager.state(), ServiceState::Starting);

        manager
            .start(&FakeLoader::new(FakeModel::default()), weights(), DeviceMap::ForceCpu)
            .await
            .unwrap();
        assert!(manager.is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_during_load_discards_the_model() {
        let model = FakeModel::default();
        let manager = Arc::new(ModelManager::new());
        let loading = {
            let manager = manager.clone();
            let loader = FakeLoader::new(model.clone()).with_delay(Duration::from_millis(200));
            tokio::spawn(async move { manager.start(&loader, weights(), DeviceMap::ForceCpu).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop().await;

        assert!(matches!(loading.await.unwrap(), Err(Error::Initialization(_))));
        assert_eq!(manager.state(), ServiceState::ShuttingDown);
        assert!(!manager.is_ready());
        assert!(matches!(
            manager.synthesize("a lighthouse", 2, None).await,
            Err(Error::Unavailable {
                state: ServiceState::ShuttingDown
            })
        ));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn failed_start_reports_the_cause_and_stays_unready() {
        let manager = ModelManager::new();
        let err = manager
            .start(&FakeLoader::failing("weights are corrupt"), weights(), DeviceMap::ForceCpu)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Initialization(ref msg) if msg.contains("weights are corrupt")));
        assert_eq!(manager.state(), ServiceState::Starting);
        assert!(matches!(
            manager.synthesize("a lighthouse", 2, None).await,
            Err(Error::Unavailable {
                state: ServiceState::Starting
            })
        ));
    }

    #[tokio::test]
    async fn second_start_keeps_the_first_model() {
        let manager = ModelManager::new();
        let first = FakeModel::default();
        let second = FakeModel::default();
        let first_loader = FakeLoader::new(first.clone());
        let second_loader = FakeLoader::new(second.clone());
        manager.start(&first_loader, weights(), DeviceMap::ForceCpu).await.unwrap();
        manager.start(&second_loader, weights(), DeviceMap::ForceCpu).await.unwrap();

        assert_eq!(first_loader.loads(), 1);
        assert_eq!(second_loader.loads(), 0);
        manager.synthesize("a lighthouse", 2, None).await.unwrap();
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn synthesis_is_unavailable_outside_ready() {
        let model = FakeModel::default();
        let manager = ModelManager::new();
        assert!(matches!(
            manager.synthesize("a lighthouse", 2, None).await,
            Err(Error::Unavailable { .. })
        ));

        manager
            .start(&FakeLoader::new(model.clone()), weights(), DeviceMap::ForceCpu)
            .await
            .unwrap();
        manager.stop().await;
        assert!(matches!(
            manager.synthesize("a lighthouse", 2, None).await,
            Err(Error::Unavailable {
                state: ServiceState::ShuttingDown
            })
        ));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn seeded_synthesis_is_reproducible() {
        let manager = ModelManager::new();
        manager
            .start(&FakeLoader::new(FakeModel::default()), weights(), DeviceMap::ForceCpu)
            .await
            .unwrap();

        let a = manager.synthesize("a lighthouse", 2, Some(7)).await.unwrap();
        let b = manager.synthesize("a lighthouse", 2, Some(7)).await.unwrap();
        let c = manager.synthesize("a lighthouse", 2, Some(8)).await.unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[tokio::test]
    async fn inference_failures_are_typed() {
        let manager = ModelManager::new();
        manager
            .start(
                &FakeLoader::new(FakeModel::default().failing("out of device memory")),
                weights(),
                DeviceMap::ForceCpu,
            )
            .await
            .unwrap();

        let err = manager.synthesize("a lighthouse", 2, None).await.unwrap_err();
        assert!(matches!(err, Error::Inference(ref msg) if msg.contains("out of device memory")));
        // the model stays loaded
        assert!(manager.is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_synthesis_is_serialized() {
        let model = FakeModel::default().with_delay(Duration::from_millis(200));
        let manager = Arc::new(ModelManager::new());
        manager
            .start(&FakeLoader::new(model.clone()), weights(), DeviceMap::ForceCpu)
            .await
            .unwrap();

        let started = Instant::now();
        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.synthesize(&format!("prompt {i}"), 2, None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(model.calls(), 3);
        assert_eq!(model.max_concurrency(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_waits_for_in_flight_synthesis() {
        let model = FakeModel::default().with_delay(Duration::from_millis(200));
        let manager = Arc::new(ModelManager::new());
        manager
            .start(&FakeLoader::new(model.clone()), weights(), DeviceMap::ForceCpu)
            .await
            .unwrap();

        let in_flight = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.synthesize("a lighthouse", 2, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop().await;

        assert!(in_flight.await.unwrap().is_ok());
        assert_eq!(model.calls(), 1);
        assert!(!manager.is_ready());
    }
}
