use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::core::catalog::ImageStore;
use crate::core::download::{DownloadManager, DownloadSettings};
use crate::core::gate::{Gate, GatePolicy};
use crate::core::mount::{DeviceBinding, MountController, UsbGadgetBinding};
use crate::plugins::registry::PluginRegistry;

/// The assembled virtual media subsystem.
#[derive(Clone)]
pub struct VirtualMedia {
    pub store: ImageStore,
    pub downloads: DownloadManager,
    pub gate: Gate,
    pub mounts: MountController,
}

impl VirtualMedia {
    /// Opens the catalog, clears staging and restores the mount state.
    pub async fn open(
        config: &Config,
        registry: PluginRegistry,
        binding: Arc<dyn DeviceBinding>,
    ) -> anyhow::Result<Self> {
        let store = ImageStore::open(&config.storage.image_dir, &config.storage.image_extensions).await?;
        let policy = GatePolicy::new(store.dir(), &config.gate);
        let downloads = DownloadManager::new(
            registry,
            store.clone(),
            policy.clone(),
            DownloadSettings::from_config(config),
        )
        .await?;
        let gate = Gate::new(downloads.clone(), policy);
        let mounts = MountController::new(store.clone(), binding, config.device.mode);

        let state = mounts.restore().await;
        info!(mounted = ?state.mounted_image_id, mode = ?state.device_mode, "virtual media ready");

        Ok(Self { store, downloads, gate, mounts })
    }

    pub async fn open_with_gadget(config: &Config, registry: PluginRegistry) -> anyhow::Result<Self> {
        let binding = Arc::new(UsbGadgetBinding::new(&config.device.lun_dir));
        Self::open(config, registry, binding).await
    }
}
