//! Device enumeration, selection and pinned stream acquisition.

use std::sync::Arc;

use idgate_core::devices::{self, rank_devices};
use idgate_core::{DeviceDescriptor, DevicePin, Facing, StreamRequest};

use crate::camera::{CameraBackend, DeviceError, FrameStream};

/// Owns the device list and the pin for one capture session.
///
/// Every stream request is built here from the pin. Nothing else decides
/// which camera to open.
pub struct CameraDeviceResolver {
    backend: Arc<dyn CameraBackend>,
    preferred: Facing,
    pin: DevicePin,
    devices: Vec<DeviceDescriptor>,
}

impl CameraDeviceResolver {
    pub fn new(backend: Arc<dyn CameraBackend>, preferred: Facing) -> Self {
        Self {
            backend,
            preferred,
            pin: DevicePin::default(),
            devices: Vec::new(),
        }
    }

    /// Open and immediately release a probe stream, then enumerate, filter
    /// and rank the attached cameras.
    pub fn request_permission_and_enumerate(
        &mut self,
    ) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let mut probe = self.backend.open(&self.stream_request())?;
        probe.stop();
        drop(probe);

        let raw = self.backend.enumerate()?;
        let total = raw.len();
        self.devices = rank_devices(raw, self.preferred);
        tracing::info!(
            total,
            usable = self.devices.len(),
            "cameras enumerated"
        );
        Ok(self.devices.clone())
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn pinned(&self) -> Option<&str> {
        self.pin.pinned()
    }

    /// Pin `device_id` for the rest of the session.
    pub fn select(&mut self, device_id: &str) -> Result<(), DeviceError> {
        if !self.devices.is_empty() && !self.devices.iter().any(|d| d.id == device_id) {
            return Err(DeviceError::Unavailable(format!(
                "'{device_id}' is not a usable camera"
            )));
        }
        self.pin.pin(device_id);
        tracing::debug!(device = device_id, "camera pinned");
        Ok(())
    }

    /// Pin the best-ranked camera if nothing is pinned yet.
    pub fn select_default(&mut self) -> Option<&str> {
        if self.pin.pinned().is_none() {
            if let Some(first) = self.devices.first() {
                self.pin.pin(first.id.clone());
            }
        }
        self.pin.pinned()
    }

    /// Pin the first camera facing the other way from the current one.
    pub fn switch_facing(&mut self) -> Result<DeviceDescriptor, DeviceError> {
        let target = devices::switch_facing(self.pin.pinned(), &self.devices)
            .cloned()
            .ok_or_else(|| DeviceError::Unavailable("no camera facing the other way".into()))?;
        self.pin.pin(target.id.clone());
        tracing::info!(device = %target.id, facing = ?target.classification, "camera switched");
        Ok(target)
    }

    pub fn stream_request(&self) -> StreamRequest {
        self.pin.request(self.preferred)
    }

    pub fn open_stream(&self) -> Result<Box<dyn FrameStream>, DeviceError> {
        self.backend.open(&self.stream_request())
    }

    /// End of the capture session: forget the device list and the pin.
    pub fn reset(&mut self) {
        self.pin.clear();
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::ReplayDir;
    use crate::camera::ReplayCameraBackend;
    use idgate_core::{DeviceConstraint, RgbaFrame};

    fn setup(tag: &str) -> (ReplayDir, Arc<ReplayCameraBackend>) {
        let dir = ReplayDir::new(tag);
        let frame = RgbaFrame::filled(4, 4, [0, 0, 0, 255]);
        dir.device("cam-1", Some("Front Webcam"), &[frame.clone()])
            .device("cam-2", Some("Back Camera"), &[frame.clone()])
            .device("cam-3", Some("Windows Hello IR Sensor"), &[frame]);
        let backend = Arc::new(ReplayCameraBackend::new(&dir.root, 1000));
        (dir, backend)
    }

    #[test]
    fn test_enumerate_releases_probe_and_filters() {
        let (_dir, backend) = setup("enum");
        let mut resolver = CameraDeviceResolver::new(backend.clone(), Facing::Front);
        let devices = resolver.request_permission_and_enumerate().unwrap();
        assert_eq!(backend.live_streams(), 0);
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["cam-1", "cam-2"]);
        assert_eq!(devices[0].classification, Facing::Front);
    }

    #[test]
    fn test_pinned_device_wins_every_request() {
        let (_dir, backend) = setup("pin");
        let mut resolver = CameraDeviceResolver::new(backend, Facing::Front);
        resolver.request_permission_and_enumerate().unwrap();
        resolver.select("cam-2").unwrap();
        for _ in 0..3 {
            assert_eq!(
                resolver.stream_request().video,
                DeviceConstraint::Exact("cam-2".to_string())
            );
        }
        let stream = resolver.open_stream().unwrap();
        assert_eq!(stream.device_id(), "cam-2");
    }

    #[test]
    fn test_select_rejects_filtered_device() {
        let (_dir, backend) = setup("reject");
        let mut resolver = CameraDeviceResolver::new(backend, Facing::Front);
        resolver.request_permission_and_enumerate().unwrap();
        assert!(resolver.select("cam-3").is_err());
        assert!(resolver.pinned().is_none());
    }

    #[test]
    fn test_switch_facing_flips_between_front_and_back() {
        let (_dir, backend) = setup("switch");
        let mut resolver = CameraDeviceResolver::new(backend, Facing::Front);
        resolver.request_permission_and_enumerate().unwrap();
        assert_eq!(resolver.select_default(), Some("cam-1"));
        assert_eq!(resolver.switch_facing().unwrap().id, "cam-2");
        assert_eq!(resolver.switch_facing().unwrap().id, "cam-1");
    }

    #[test]
    fn test_reset_drops_pin() {
        let (_dir, backend) = setup("reset");
        let mut resolver = CameraDeviceResolver::new(backend, Facing::Back);
        resolver.request_permission_and_enumerate().unwrap();
        resolver.select("cam-1").unwrap();
        resolver.reset();
        assert_eq!(
            resolver.stream_request().video,
            DeviceConstraint::IdealFacing(Facing::Back)
        );
    }
}
