//! Camera backend seam and the directory-replay backend.
//!
//! Every camera access happens through [`CameraBackend`] on the capture
//! thread. The replay backend serves still images from disk as if they came
//! from live cameras: each subdirectory of the root is one device, its image
//! files are the frames, cycled at a fixed rate.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use idgate_core::devices::rank_devices;
use idgate_core::{DeviceConstraint, RawDevice, RgbaFrame, StreamRequest};
use thiserror::Error;

const FRAME_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const LABEL_FILE: &str = "label";

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera stream ended")]
    StreamEnded,
    #[error("camera I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(e.to_string()),
            std::io::ErrorKind::NotFound => DeviceError::Unavailable(e.to_string()),
            _ => DeviceError::Io(e),
        }
    }
}

/// An open device stream. Dropping it releases the device.
pub trait FrameStream: Send {
    fn device_id(&self) -> &str;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<RgbaFrame, DeviceError>;

    /// Release the device. Further `next_frame` calls fail with
    /// [`DeviceError::StreamEnded`].
    fn stop(&mut self);
}

pub trait CameraBackend: Send + Sync {
    /// Every video input currently attached, unfiltered.
    fn enumerate(&self) -> Result<Vec<RawDevice>, DeviceError>;

    /// Open a stream satisfying `request`.
    fn open(&self, request: &StreamRequest) -> Result<Box<dyn FrameStream>, DeviceError>;
}

/// Replays image directories as camera devices.
pub struct ReplayCameraBackend {
    root: PathBuf,
    frame_interval: Duration,
    live: Arc<AtomicUsize>,
}

impl ReplayCameraBackend {
    pub fn new(root: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            root: root.into(),
            frame_interval: Duration::from_secs(1) / fps.max(1),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of streams opened and not yet stopped.
    #[cfg(test)]
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn device_dirs(&self) -> Result<Vec<(String, PathBuf)>, DeviceError> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            dirs.push((id, entry.path()));
        }
        dirs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(dirs)
    }

    fn load_frames(dir: &Path) -> Result<Vec<RgbaFrame>, DeviceError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            let img = image::open(path)?;
            frames.push(RgbaFrame::from_image(&img));
        }
        Ok(frames)
    }
}

impl CameraBackend for ReplayCameraBackend {
    fn enumerate(&self) -> Result<Vec<RawDevice>, DeviceError> {
        let mut devices = Vec::new();
        for (id, path) in self.device_dirs()? {
            let label = std::fs::read_to_string(path.join(LABEL_FILE))
                .map(|l| l.trim().to_string())
                .unwrap_or_else(|_| id.clone());
            devices.push(RawDevice { id, label });
        }
        Ok(devices)
    }

    fn open(&self, request: &StreamRequest) -> Result<Box<dyn FrameStream>, DeviceError> {
        let device_id = match &request.video {
            DeviceConstraint::Exact(id) => id.clone(),
            DeviceConstraint::IdealFacing(facing) => rank_devices(self.enumerate()?, *facing)
                .into_iter()
                .next()
                .map(|d| d.id)
                .ok_or_else(|| DeviceError::Unavailable("no usable camera attached".into()))?,
        };

        let dir = self.root.join(&device_id);
        let traversal = device_id.starts_with('.') || device_id.contains(['/', '\\']);
        if device_id.is_empty() || traversal || !dir.is_dir() {
            return Err(DeviceError::Unavailable(format!("no device '{device_id}'")));
        }

        let frames = Self::load_frames(&dir)?;
        if frames.is_empty() {
            return Err(DeviceError::Unavailable(format!(
                "device '{device_id}' produced no frames"
            )));
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(device = %device_id, frames = frames.len(), "replay stream opened");
        Ok(Box::new(ReplayStream {
            device_id,
            frames,
            next: 0,
            interval: self.frame_interval,
            last: None,
            live: Some(Arc::clone(&self.live)),
        }))
    }
}

struct ReplayStream {
    device_id: String,
    frames: Vec<RgbaFrame>,
    next: usize,
    interval: Duration,
    last: Option<Instant>,
    /// `None` once stopped.
    live: Option<Arc<AtomicUsize>>,
}

impl FrameStream for ReplayStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn next_frame(&mut self) -> Result<RgbaFrame, DeviceError> {
        if self.live.is_none() {
            return Err(DeviceError::StreamEnded);
        }
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());

        let frame = self.frames[self.next].clone();
        self.next = (self.next + 1) % self.frames.len();
        Ok(frame)
    }

    fn stop(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(device = %self.device_id, "replay stream stopped");
        }
    }
}

impl Drop for ReplayStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use idgate_core::Facing;

    /// A throwaway replay root under the system temp dir.
    pub(crate) struct ReplayDir {
        pub root: PathBuf,
    }

    impl ReplayDir {
        pub(crate) fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!("idgate-{tag}-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        /// Add a device with one PNG frame per entry of `frames`.
        pub(crate) fn device(&self, id: &str, label: Option<&str>, frames: &[RgbaFrame]) -> &Self {
            let dir = self.root.join(id);
            std::fs::create_dir_all(&dir).unwrap();
            if let Some(label) = label {
                std::fs::write(dir.join(LABEL_FILE), label).unwrap();
            }
            for (i, frame) in frames.iter().enumerate() {
                frame
                    .to_image()
                    .unwrap()
                    .save(dir.join(format!("{i:03}.png")))
                    .unwrap();
            }
            self
        }
    }

    /// High-contrast checkerboard that clears the baseline gate.
    pub(crate) fn checker(width: u32, height: u32, cell: u32) -> RgbaFrame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = if (x / cell + y / cell) % 2 == 0 { 60 } else { 180 };
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        RgbaFrame::new(data, width, height).unwrap()
    }

    impl Drop for ReplayDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn exact(id: &str) -> StreamRequest {
        StreamRequest {
            video: DeviceConstraint::Exact(id.to_string()),
            audio: false,
        }
    }

    #[test]
    fn test_enumerate_reads_labels() {
        let dir = ReplayDir::new("enum");
        let frame = RgbaFrame::filled(8, 8, [10, 10, 10, 255]);
        dir.device("cam-1", Some("Front Webcam\n"), &[frame.clone()])
            .device("cam-2", None, &[frame]);

        let backend = ReplayCameraBackend::new(&dir.root, 30);
        let devices = backend.enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].label, "Front Webcam");
        assert_eq!(devices[1].label, "cam-2");
    }

    #[test]
    fn test_exact_open_cycles_frames() {
        let dir = ReplayDir::new("cycle");
        let a = RgbaFrame::filled(4, 4, [0, 0, 0, 255]);
        let b = RgbaFrame::filled(4, 4, [255, 255, 255, 255]);
        dir.device("cam-1", None, &[a.clone(), b.clone()]);

        let backend = ReplayCameraBackend::new(&dir.root, 1000);
        let mut stream = backend.open(&exact("cam-1")).unwrap();
        assert_eq!(stream.device_id(), "cam-1");
        assert_eq!(stream.next_frame().unwrap(), a);
        assert_eq!(stream.next_frame().unwrap(), b);
        assert_eq!(stream.next_frame().unwrap(), a);
    }

    #[test]
    fn test_stop_releases_device() {
        let dir = ReplayDir::new("stop");
        dir.device("cam-1", None, &[RgbaFrame::filled(4, 4, [0, 0, 0, 255])]);

        let backend = ReplayCameraBackend::new(&dir.root, 1000);
        let mut stream = backend.open(&exact("cam-1")).unwrap();
        assert_eq!(backend.live_streams(), 1);
        stream.stop();
        assert_eq!(backend.live_streams(), 0);
        assert!(matches!(stream.next_frame(), Err(DeviceError::StreamEnded)));

        let other = backend.open(&exact("cam-1")).unwrap();
        assert_eq!(backend.live_streams(), 1);
        drop(other);
        assert_eq!(backend.live_streams(), 0);
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let dir = ReplayDir::new("missing");
        let backend = ReplayCameraBackend::new(&dir.root, 30);
        assert!(matches!(
            backend.open(&exact("nope")),
            Err(DeviceError::Unavailable(_))
        ));
        assert!(matches!(
            backend.open(&exact("../etc")),
            Err(DeviceError::Unavailable(_))
        ));
    }

    #[test]
    fn test_facing_request_skips_ir_sensor() {
        let dir = ReplayDir::new("facing");
        let frame = RgbaFrame::filled(4, 4, [0, 0, 0, 255]);
        dir.device("a-ir", Some("Integrated IR Camera"), &[frame.clone()])
            .device("b-rear", Some("Rear Camera"), &[frame]);

        let backend = ReplayCameraBackend::new(&dir.root, 30);
        let stream = backend
            .open(&StreamRequest {
                video: DeviceConstraint::IdealFacing(Facing::Back),
                audio: false,
            })
            .unwrap();
        assert_eq!(stream.device_id(), "b-rear");
    }
}
