//! Exclusive presentation of one catalog image to the attached computer.
//!
//! All binding changes run under one operation lock. The published state is
//! written once at the end of a sequence, and after any failure it is rebuilt
//! from what the device actually reports.

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::core::catalog::ImageStore;
use crate::core::model::{DeviceMode, Image, ImageId, MountState};
use crate::error::{Result, VmediaError};

/// The hardware side of a mount: what backs the virtual storage device.
#[async_trait]
pub trait DeviceBinding: Send + Sync {
    async fn bind(&self, path: &Path) -> anyhow::Result<()>;
    async fn unbind(&self) -> anyhow::Result<()>;
    /// File currently backing the device, if any.
    async fn current(&self) -> anyhow::Result<Option<PathBuf>>;
    async fn cdrom(&self) -> anyhow::Result<bool>;
}

/// Linux USB gadget mass-storage LUN driven through configfs.
pub struct UsbGadgetBinding {
    lun_dir: PathBuf,
}

impl UsbGadgetBinding {
    pub fn new(lun_dir: &Path) -> Self {
        Self { lun_dir: lun_dir.to_path_buf() }
    }

    async fn write_attr(&self, attr: &str, value: &str) -> anyhow::Result<()> {
        let path = self.lun_dir.join(attr);
        tokio::fs::write(&path, value)
            .await
            .with_context(|| format!("write {}", path.display()))
    }

    async fn read_attr(&self, attr: &str) -> anyhow::Result<String> {
        let path = self.lun_dir.join(attr);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        Ok(raw.trim().to_string())
    }
}

#[async_trait]
impl DeviceBinding for UsbGadgetBinding {
    async fn bind(&self, path: &Path) -> anyhow::Result<()> {
        self.write_attr("file", &path.to_string_lossy()).await
    }

    async fn unbind(&self) -> anyhow::Result<()> {
        // forced_eject also works while the host holds a media lock
        if tokio::fs::metadata(self.lun_dir.join("forced_eject")).await.is_ok() {
            self.write_attr("forced_eject", "1").await
        } else {
            self.write_attr("file", "\n").await
        }
    }

    async fn current(&self) -> anyhow::Result<Option<PathBuf>> {
        let value = self.read_attr("file").await?;
        Ok((!value.is_empty()).then(|| PathBuf::from(value)))
    }

    async fn cdrom(&self) -> anyhow::Result<bool> {
        Ok(self.read_attr("cdrom").await? == "1")
    }
}

#[derive(Clone)]
pub struct MountController {
    inner: Arc<MountInner>,
}

struct MountInner {
    store: ImageStore,
    binding: Arc<dyn DeviceBinding>,
    mode_override: Option<DeviceMode>,
    mounted: RwLock<Option<ImageId>>,
    op: Mutex<()>,
}

impl MountController {
    pub fn new(store: ImageStore, binding: Arc<dyn DeviceBinding>, mode_override: Option<DeviceMode>) -> Self {
        Self {
            inner: Arc::new(MountInner {
                store,
                binding,
                mode_override,
                mounted: RwLock::new(None),
                op: Mutex::new(()),
            }),
        }
    }

    /// Rebuilds the mount state from the device binding; call after the catalog is loaded.
    pub async fn restore(&self) -> MountState {
        let _op = self.inner.op.lock().await;
        self.reconcile().await;
        self.get_mounted().await
    }

    pub async fn get_mounted(&self) -> MountState {
        MountState {
            mounted_image_id: self.inner.mounted.read().await.clone(),
            device_mode: self.device_mode().await,
        }
    }

    pub async fn device_mode(&self) -> DeviceMode {
        if let Some(mode) = self.inner.mode_override {
            return mode;
        }
        match self.inner.binding.cdrom().await {
            Ok(true) => DeviceMode::Cdrom,
            Ok(false) => DeviceMode::Generic,
            Err(e) => {
                warn!("cannot read device mode: {:#}", e);
                DeviceMode::Generic
            }
        }
    }

    pub async fn mount(&self, id: &str) -> Result<MountState> {
        let _op = self.inner.op.lock().await;
        let image = self.inner.store.resolve(id).await?;

        let previous = self.inner.mounted.read().await.clone();
        let bound = self.read_binding().await;
        if previous.as_deref() == Some(id) && bound == Some(Some(image.path.clone())) {
            return Ok(self.get_mounted().await);
        }

        // an unreadable binding may still hold a file
        if previous.is_some() || bound != Some(None) {
            if let Err(e) = self.inner.binding.unbind().await {
                self.reconcile().await;
                return Err(VmediaError::MountFailed(format!("unbind: {:#}", e)));
            }
        }
        if let Err(e) = self.inner.binding.bind(&image.path).await {
            self.reconcile().await;
            return Err(VmediaError::MountFailed(format!("bind {}: {:#}", image.path.display(), e)));
        }

        *self.inner.mounted.write().await = Some(image.id.clone());
        info!(image = %image.id, ?previous, "image mounted");
        Ok(self.get_mounted().await)
    }

    /// Nothing mounted is a no-op, not an error.
    pub async fn unmount(&self) -> Result<MountState> {
        let _op = self.inner.op.lock().await;

        let previous = self.inner.mounted.read().await.clone();
        if previous.is_none() && self.read_binding().await == Some(None) {
            return Ok(self.get_mounted().await);
        }

        if let Err(e) = self.inner.binding.unbind().await {
            self.reconcile().await;
            return Err(VmediaError::MountFailed(format!("unbind: {:#}", e)));
        }
        *self.inner.mounted.write().await = None;
        info!(?previous, "image unmounted");
        Ok(self.get_mounted().await)
    }

    /// What the device reports, or `None` when it cannot be read.
    async fn read_binding(&self) -> Option<Option<PathBuf>> {
        match self.inner.binding.current().await {
            Ok(bound) => Some(bound),
            Err(e) => {
                warn!("cannot read device binding: {:#}", e);
                None
            }
        }
    }

    /// Deletes a catalog image unless it is the one currently mounted.
    pub async fn remove_image(&self, id: &str) -> Result<Image> {
        let _op = self.inner.op.lock().await;
        if self.inner.mounted.read().await.as_deref() == Some(id) {
            return Err(VmediaError::ImageMounted(id.to_string()));
        }
        self.inner.store.delete(id).await
    }

    // Caller holds the operation lock.
    async fn reconcile(&self) {
        let actual = match self.inner.binding.current().await {
            Ok(Some(path)) => match self.inner.store.find_by_path(&path).await {
                Some(image) => Some(image.id),
                None => {
                    warn!("device is backed by {} which is not in the catalog", path.display());
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("cannot read device binding: {:#}", e);
                None
            }
        };
        *self.inner.mounted.write().await = actual;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBinding {
        bound: std::sync::Mutex<Option<PathBuf>>,
        ops: std::sync::Mutex<Vec<String>>,
        fail_bind: AtomicBool,
        fail_unbind: AtomicBool,
        fail_current: AtomicBool,
        bind_delay: std::sync::Mutex<Duration>,
        cdrom: AtomicBool,
    }

    impl FakeBinding {
        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn bound(&self) -> Option<PathBuf> {
            self.bound.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceBinding for FakeBinding {
        async fn bind(&self, path: &Path) -> anyhow::Result<()> {
            let delay = *self.bind_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            if self.fail_bind.load(Ordering::SeqCst) {
                anyhow::bail!("gadget busy");
            }
            let mut bound = self.bound.lock().unwrap();
            assert!(bound.is_none(), "bind while another image is bound");
            *bound = Some(path.to_path_buf());
            self.ops.lock().unwrap().push(format!("bind {}", path.file_name().unwrap().to_string_lossy()));
            Ok(())
        }

        async fn unbind(&self) -> anyhow::Result<()> {
            if self.fail_unbind.load(Ordering::SeqCst) {
                anyhow::bail!("host holds media lock");
            }
            *self.bound.lock().unwrap() = None;
            self.ops.lock().unwrap().push("unbind".to_string());
            Ok(())
        }

        async fn current(&self) -> anyhow::Result<Option<PathBuf>> {
            if self.fail_current.load(Ordering::SeqCst) {
                anyhow::bail!("lun attribute unreadable");
            }
            Ok(self.bound())
        }

        async fn cdrom(&self) -> anyhow::Result<bool> {
            Ok(self.cdrom.load(Ordering::SeqCst))
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: ImageStore,
        binding: Arc<FakeBinding>,
        controller: MountController,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("images");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["1.iso", "2.iso"] {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
        let store = ImageStore::open(&dir, &["iso".to_string()]).await.unwrap();
        let binding = Arc::new(FakeBinding::default());
        let controller = MountController::new(store.clone(), binding.clone(), None);
        Fixture { _tmp: tmp, store, binding, controller }
    }

    #[tokio::test]
    async fn mounting_unknown_image_is_not_found_and_keeps_state() {
        let fx = fixture().await;
        fx.controller.mount("1.iso").await.unwrap();

        let err = fx.controller.mount("42").await.unwrap_err();
        assert!(matches!(err, VmediaError::NotFound(_)));
        assert_eq!(fx.controller.get_mounted().await.mounted_image_id.as_deref(), Some("1.iso"));
        assert_eq!(fx.binding.ops(), vec!["bind 1.iso"]);
    }

    #[tokio::test]
    async fn swap_unbinds_before_binding_new_image() {
        let fx = fixture().await;
        fx.controller.mount("1.iso").await.unwrap();
        let state = fx.controller.mount("2.iso").await.unwrap();

        assert_eq!(state.mounted_image_id.as_deref(), Some("2.iso"));
        assert_eq!(fx.binding.ops(), vec!["bind 1.iso", "unbind", "bind 2.iso"]);
        let two = fx.store.resolve("2.iso").await.unwrap();
        assert_eq!(fx.binding.bound(), Some(two.path));
    }

    #[tokio::test]
    async fn remounting_same_image_is_a_no_op() {
        let fx = fixture().await;
        fx.controller.mount("1.iso").await.unwrap();
        fx.controller.mount("1.iso").await.unwrap();
        assert_eq!(fx.binding.ops(), vec!["bind 1.iso"]);
    }

    #[tokio::test]
    async fn bind_failure_after_unbind_reports_nothing_mounted() {
        let fx = fixture().await;
        fx.controller.mount("1.iso").await.unwrap();
        fx.binding.fail_bind.store(true, Ordering::SeqCst);

        let err = fx.controller.mount("2.iso").await.unwrap_err();
        assert!(matches!(err, VmediaError::MountFailed(_)));
        assert_eq!(fx.controller.get_mounted().await.mounted_image_id, None);
        assert_eq!(fx.binding.bound(), None);
    }

    #[tokio::test]
    async fn unbind_failure_keeps_the_image_still_bound() {
        let fx = fixture().await;
        fx.controller.mount("1.iso").await.unwrap();
        fx.binding.fail_unbind.store(true, Ordering::SeqCst);

        let err = fx.controller.mount("2.iso").await.unwrap_err();
        assert!(matches!(err, VmediaError::MountFailed(_)));
        assert_eq!(fx.controller.get_mounted().await.mounted_image_id.as_deref(), Some("1.iso"));
    }

    #[tokio::test]
    async fn readers_see_previous_mount_until_swap_completes() {
        let fx = fixture().await;
        fx.controller.mount("1.iso").await.unwrap();
        *fx.binding.bind_delay.lock().unwrap() = Duration::from_millis(200);

        let controller = fx.controller.clone();
        let swap = tokio::spawn(async move { controller.mount("2.iso").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.controller.get_mounted().await.mounted_image_id.as_deref(), Some("1.iso"));

        swap.await.unwrap().unwrap();
        assert_eq!(fx.controller.get_mounted().await.mounted_image_id.as_deref(), Some("2.iso"));
    }

    #[tokio::test]
    async fn concurrent_mounts_are_serialized() {
        let fx = fixture().await;
        *fx.binding.bind_delay.lock().unwrap() = Duration::from_millis(20);

        let mut tasks = vec![];
        for i in 0..6 {
            let controller = fx.controller.clone();
            let id = if i % 2 == 0 { "1.iso" } else { "2.iso" };
            tasks.push(tokio::spawn(async move { controller.mount(id).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        // FakeBinding asserts no double bind; the published state matches the device
        let mounted = fx.controller.get_mounted().await.mounted_image_id.unwrap();
        let image = fx.store.resolve(&mounted).await.unwrap();
        assert_eq!(fx.binding.bound(), Some(image.path));
    }

    #[tokio::test]
    async fn unmount_with_nothing_mounted_is_a_no_op() {
        let fx = fixture().await;
        let state = fx.controller.unmount().await.unwrap();
        assert_eq!(state.mounted_image_id, None);
        assert!(fx.binding.ops().is_empty());

        fx.controller.mount("2.iso").await.unwrap();
        fx.controller.unmount().await.unwrap();
        assert_eq!(fx.binding.bound(), None);
        assert_eq!(fx.controller.get_mounted().await.mounted_image_id, None);
    }

    #[tokio::test]
    async fn restore_maps_bound_file_to_catalog() {
        let fx = fixture().await;
        let two = fx.store.resolve("2.iso").await.unwrap();
        *fx.binding.bound.lock().unwrap() = Some(two.path.clone());
        assert_eq!(fx.controller.restore().await.mounted_image_id.as_deref(), Some("2.iso"));

        *fx.binding.bound.lock().unwrap() = Some(PathBuf::from("/elsewhere/foreign.iso"));
        assert_eq!(fx.controller.restore().await.mounted_image_id, None);
    }

    #[tokio::test]
    async fn mounted_image_cannot_be_removed() {
        let fx = fixture().await;
        fx.controller.mount("1.iso").await.unwrap();
        assert!(matches!(fx.controller.remove_image("1.iso").await, Err(VmediaError::ImageMounted(_))));
        fx.controller.remove_image("2.iso").await.unwrap();
        assert!(matches!(fx.store.resolve("2.iso").await, Err(VmediaError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_queued_ahead_of_mount_wins() {
        let fx = fixture().await;
        let held = fx.controller.inner.op.lock().await;

        let remover = fx.controller.clone();
        let delete = tokio::spawn(async move { remover.remove_image("2.iso").await });
        tokio::task::yield_now().await;
        let mounter = fx.controller.clone();
        let mount = tokio::spawn(async move { mounter.mount("2.iso").await });
        tokio::task::yield_now().await;
        drop(held);

        assert_eq!(delete.await.unwrap().unwrap().id, "2.iso");
        assert!(matches!(mount.await.unwrap(), Err(VmediaError::NotFound(_))));
        assert_eq!(fx.controller.get_mounted().await.mounted_image_id, None);
        assert_eq!(fx.binding.bound(), None);
        assert!(fx.binding.ops().is_empty());
    }

    #[tokio::test]
    async fn unreadable_binding_is_unbound_before_mount() {
        let fx = fixture().await;
        let one = fx.store.resolve("1.iso").await.unwrap();
        *fx.binding.bound.lock().unwrap() = Some(one.path);
        fx.binding.fail_current.store(true, Ordering::SeqCst);

        let state = fx.controller.mount("2.iso").await.unwrap();
        assert_eq!(state.mounted_image_id.as_deref(), Some("2.iso"));
        assert_eq!(fx.binding.ops(), vec!["unbind", "bind 2.iso"]);
    }

    #[tokio::test]
    async fn unreadable_binding_still_unmounts() {
        let fx = fixture().await;
        let one = fx.store.resolve("1.iso").await.unwrap();
        *fx.binding.bound.lock().unwrap() = Some(one.path);
        fx.binding.fail_current.store(true, Ordering::SeqCst);

        fx.controller.unmount().await.unwrap();
        assert_eq!(fx.binding.ops(), vec!["unbind"]);
        assert_eq!(fx.binding.bound(), None);
    }

    #[tokio::test]
    async fn device_mode_follows_override_then_hardware() {
        let fx = fixture().await;
        assert_eq!(fx.controller.device_mode().await, DeviceMode::Generic);
        fx.binding.cdrom.store(true, Ordering::SeqCst);
        assert_eq!(fx.controller.device_mode().await, DeviceMode::Cdrom);

        let forced = MountController::new(fx.store.clone(), fx.binding.clone(), Some(DeviceMode::Generic));
        assert_eq!(forced.device_mode().await, DeviceMode::Generic);

        fx.controller.mount("1.iso").await.unwrap();
        assert_eq!(fx.controller.device_mode().await, DeviceMode::Cdrom);
    }

    #[tokio::test]
    async fn usb_gadget_binding_reads_and_writes_lun_attributes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file"), "\n").unwrap();
        std::fs::write(tmp.path().join("cdrom"), "1\n").unwrap();
        let lun = UsbGadgetBinding::new(tmp.path());

        assert_eq!(lun.current().await.unwrap(), None);
        assert!(lun.cdrom().await.unwrap());

        lun.bind(Path::new("/data/debian.iso")).await.unwrap();
        assert_eq!(lun.current().await.unwrap(), Some(PathBuf::from("/data/debian.iso")));

        lun.unbind().await.unwrap();
        assert_eq!(lun.current().await.unwrap(), None);
    }

    #[tokio::test]
    async fn usb_gadget_binding_prefers_forced_eject() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file"), "/data/a.iso\n").unwrap();
        std::fs::write(tmp.path().join("forced_eject"), "0").unwrap();
        let lun = UsbGadgetBinding::new(tmp.path());

        lun.unbind().await.unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("forced_eject")).unwrap(), "1");
    }
}
