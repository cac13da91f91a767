use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use idgate_core::gate::{self, GateConfig};
use idgate_core::{DeviceDescriptor, GuideRect, QualityVerdict, RgbaFrame};
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::camera::{DeviceError, FrameStream};
use crate::resolver::CameraDeviceResolver;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("capture is not running")]
    NotRunning,
    #[error("no frame has passed the quality gate yet")]
    NotReady,
    #[error("guide region is empty for a {width}x{height} frame")]
    EmptyGuide { width: u32, height: u32 },
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture thread exited")]
    ChannelClosed,
}

/// Tuning for the capture loop.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub gate: GateConfig,
    /// Guide width as a fraction of the frame width.
    pub guide_width_fraction: f32,
    /// Consecutive frame errors tolerated before the stream is dropped.
    pub max_frame_errors: u32,
    pub jpeg_quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            gate: GateConfig::baseline(),
            guide_width_fraction: 0.9,
            max_frame_errors: 10,
            jpeg_quality: 96,
        }
    }
}

/// Verdict for the latest frame of the running stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameUpdate {
    /// Stream generation the frame came from.
    pub generation: u64,
    pub device_id: String,
    pub verdict: QualityVerdict,
}

/// The cropped still handed to the upload step.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub device_id: String,
    pub verdict: QualityVerdict,
}

enum CaptureRequest {
    ListDevices {
        reply: oneshot::Sender<Result<Vec<DeviceDescriptor>, CaptureError>>,
    },
    Start {
        device_id: Option<String>,
        guide_aspect: f32,
        reply: oneshot::Sender<Result<String, CaptureError>>,
    },
    SwitchFacing {
        reply: oneshot::Sender<Result<DeviceDescriptor, CaptureError>>,
    },
    Capture {
        reply: oneshot::Sender<Result<CapturedImage, CaptureError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the capture thread.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<CaptureRequest>,
    updates: watch::Receiver<Option<FrameUpdate>>,
    generation: Arc<AtomicU64>,
}

impl CaptureHandle {
    /// Enumerate usable cameras, probing for permission if no stream is open.
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.request(CaptureRequest::ListDevices { reply }, rx).await?
    }

    /// Stop any running stream, open the pinned (or given) camera and start
    /// gating frames. Returns the device id in use.
    pub async fn start(
        &self,
        device_id: Option<String>,
        guide_aspect: f32,
    ) -> Result<String, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            CaptureRequest::Start {
                device_id,
                guide_aspect,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn switch_camera(&self) -> Result<DeviceDescriptor, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.request(CaptureRequest::SwitchFacing { reply }, rx)
            .await?
    }

    /// Encode the last accepted frame and close the stream.
    pub async fn capture(&self) -> Result<CapturedImage, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.request(CaptureRequest::Capture { reply }, rx).await?
    }

    /// Stop the stream and end the capture session.
    pub async fn stop(&self) -> Result<(), CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.request(CaptureRequest::Stop { reply }, rx).await
    }

    /// Per-frame verdicts. `None` while no stream is running.
    pub fn subscribe(&self) -> watch::Receiver<Option<FrameUpdate>> {
        self.updates.clone()
    }

    /// Generation of the stream currently running, bumped on every start
    /// and stop.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn request<T>(
        &self,
        req: CaptureRequest,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, CaptureError> {
        self.tx
            .send(req)
            .await
            .map_err(|_| CaptureError::ChannelClosed)?;
        rx.await.map_err(|_| CaptureError::ChannelClosed)
    }
}

/// Spawn the capture loop on a dedicated OS thread.
///
/// The thread owns the resolver and every stream it opens. While a stream
/// runs, pending requests are drained before each frame so stop and switch
/// take effect between frames. While idle it blocks on the request channel.
pub fn spawn_capture(
    resolver: CameraDeviceResolver,
    settings: CaptureSettings,
) -> Result<CaptureHandle, CaptureError> {
    let (tx, mut rx) = mpsc::channel::<CaptureRequest>(8);
    let (updates_tx, updates) = watch::channel(None);
    let generation = Arc::new(AtomicU64::new(0));

    let mut worker = CaptureWorker {
        resolver,
        settings,
        stream: None,
        guide_aspect: idgate_core::frame::ID1_ASPECT,
        generation: Arc::clone(&generation),
        last: None,
        frame_errors: 0,
        updates: updates_tx,
    };

    std::thread::Builder::new()
        .name("idgate-capture".into())
        .spawn(move || {
            tracing::info!("capture thread started");
            loop {
                let req = if worker.stream.is_some() {
                    match rx.try_recv() {
                        Ok(req) => Some(req),
                        Err(TryRecvError::Empty) => None,
                        Err(TryRecvError::Disconnected) => break,
                    }
                } else {
                    match rx.blocking_recv() {
                        Some(req) => Some(req),
                        None => break,
                    }
                };
                match req {
                    Some(req) => worker.handle(req),
                    None => worker.tick(),
                }
            }
            worker.stop_stream();
            tracing::info!("capture thread exiting");
        })
        .map_err(CaptureError::Spawn)?;

    Ok(CaptureHandle {
        tx,
        updates,
        generation,
    })
}

struct CaptureWorker {
    resolver: CameraDeviceResolver,
    settings: CaptureSettings,
    stream: Option<Box<dyn FrameStream>>,
    guide_aspect: f32,
    generation: Arc<AtomicU64>,
    /// Latest cropped frame and its verdict.
    last: Option<(RgbaFrame, QualityVerdict)>,
    frame_errors: u32,
    updates: watch::Sender<Option<FrameUpdate>>,
}

impl CaptureWorker {
    fn handle(&mut self, req: CaptureRequest) {
        match req {
            CaptureRequest::ListDevices { reply } => {
                let _ = reply.send(self.list_devices());
            }
            CaptureRequest::Start {
                device_id,
                guide_aspect,
                reply,
            } => {
                let _ = reply.send(self.start(device_id, guide_aspect));
            }
            CaptureRequest::SwitchFacing { reply } => {
                let _ = reply.send(self.switch_facing());
            }
            CaptureRequest::Capture { reply } => {
                let _ = reply.send(self.capture());
            }
            CaptureRequest::Stop { reply } => {
                self.stop_stream();
                self.resolver.reset();
                let _ = reply.send(());
            }
        }
    }

    fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        // A probe would need a second stream; the list is fresh for this session.
        if self.stream.is_some() {
            return Ok(self.resolver.devices().to_vec());
        }
        Ok(self.resolver.request_permission_and_enumerate()?)
    }

    fn start(&mut self, device_id: Option<String>, guide_aspect: f32) -> Result<String, CaptureError> {
        self.stop_stream();
        self.guide_aspect = guide_aspect;

        if self.resolver.devices().is_empty() {
            self.resolver.request_permission_and_enumerate()?;
        }
        match device_id {
            Some(id) => self.resolver.select(&id)?,
            None => {
                self.resolver.select_default();
            }
        }
        self.open()
    }

    fn switch_facing(&mut self) -> Result<DeviceDescriptor, CaptureError> {
        if self.resolver.devices().is_empty() {
            self.resolver.request_permission_and_enumerate()?;
        }
        let target = self.resolver.switch_facing()?;
        if self.stream.is_some() {
            self.stop_stream();
            self.open()?;
        }
        Ok(target)
    }

    fn open(&mut self) -> Result<String, CaptureError> {
        let stream = self.resolver.open_stream()?;
        let device_id = stream.device_id().to_string();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stream = Some(stream);
        self.frame_errors = 0;
        tracing::info!(device = %device_id, generation, "capture started");
        Ok(device_id)
    }

    fn stop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(device = stream.device_id(), generation, "capture stopped");
        }
        self.last = None;
        self.updates.send_replace(None);
    }

    /// Pull one frame through the gate.
    fn tick(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let frame = match stream.next_frame() {
            Ok(frame) => {
                self.frame_errors = 0;
                frame
            }
            Err(e) => {
                self.frame_errors += 1;
                tracing::warn!(error = %e, errors = self.frame_errors, "frame read failed");
                if self.frame_errors >= self.settings.max_frame_errors {
                    tracing::error!("too many frame errors, dropping stream");
                    self.stop_stream();
                }
                return;
            }
        };
        let device_id = stream.device_id().to_string();

        let guide = GuideRect::centered(
            frame.width,
            frame.height,
            self.settings.guide_width_fraction,
            self.guide_aspect,
        );
        let cropped = match guide
            .to_crop(frame.width, frame.height)
            .and_then(|rect| frame.crop(rect).ok())
        {
            Some(cropped) => cropped,
            None => {
                tracing::debug!(width = frame.width, height = frame.height, "empty guide crop");
                return;
            }
        };

        let verdict = gate::evaluate(cropped.view(), &self.settings.gate);
        let was_accepted = self.last.as_ref().map(|(_, v)| v.accepted);
        if was_accepted != Some(verdict.accepted) {
            tracing::trace!(accepted = verdict.accepted, score = verdict.framing_score, "verdict changed");
        }
        self.last = Some((cropped, verdict));
        self.updates.send_replace(Some(FrameUpdate {
            generation: self.generation.load(Ordering::SeqCst),
            device_id,
            verdict,
        }));
    }

    fn capture(&mut self) -> Result<CapturedImage, CaptureError> {
        let device_id = match &self.stream {
            Some(stream) => stream.device_id().to_string(),
            None => return Err(CaptureError::NotRunning),
        };
        let (frame, verdict) = match &self.last {
            Some((frame, verdict)) if verdict.accepted => (frame, *verdict),
            _ => return Err(CaptureError::NotReady),
        };

        let jpeg = encode_jpeg(frame, self.settings.jpeg_quality)?;
        let (width, height) = (frame.width, frame.height);
        tracing::info!(device = %device_id, width, height, bytes = jpeg.len(), "document captured");

        self.stop_stream();
        Ok(CapturedImage {
            jpeg,
            width,
            height,
            device_id,
            verdict,
        })
    }
}

fn encode_jpeg(frame: &RgbaFrame, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let rgba = frame.to_image().ok_or(CaptureError::EmptyGuide {
        width: frame.width,
        height: frame.height,
    })?;
    let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::{checker, ReplayDir};
    use crate::camera::ReplayCameraBackend;
    use idgate_core::Facing;
    use std::time::Duration;

    fn setup(tag: &str) -> (ReplayDir, Arc<ReplayCameraBackend>, CaptureHandle) {
        let dir = ReplayDir::new(tag);
        dir.device("cam-1", Some("Front Webcam"), &[checker(320, 240, 4)])
            .device("cam-2", Some("Back Camera"), &[checker(320, 240, 4)])
            .device("cam-3", Some("Blank Camera"), &[RgbaFrame::filled(320, 240, [128, 128, 128, 255])]);
        let backend = Arc::new(ReplayCameraBackend::new(&dir.root, 200));
        let resolver = CameraDeviceResolver::new(backend.clone(), Facing::Front);
        let handle = spawn_capture(resolver, CaptureSettings::default()).unwrap();
        (dir, backend, handle)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<Option<FrameUpdate>>,
        pred: impl Fn(&FrameUpdate) -> bool,
    ) -> FrameUpdate {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(update) = current {
                    if pred(&update) {
                        return update;
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_capture_encodes_accepted_frame_and_closes_stream() {
        let (_dir, backend, handle) = setup("capture");
        let mut updates = handle.subscribe();
        let device = handle.start(None, idgate_core::frame::ID1_ASPECT).await.unwrap();
        assert_eq!(device, "cam-1");

        let update = wait_for(&mut updates, |u| u.verdict.accepted).await;
        assert_eq!(update.device_id, "cam-1");

        let image = handle.capture().await.unwrap();
        assert_eq!(&image.jpeg[..2], &[0xFF, 0xD8]);
        assert!(image.width > image.height);
        assert_eq!(backend.live_streams(), 0);
        assert!(handle.subscribe().borrow().is_none());
    }

    #[tokio::test]
    async fn test_capture_requires_running_stream() {
        let (_dir, _backend, handle) = setup("idle");
        assert!(matches!(handle.capture().await, Err(CaptureError::NotRunning)));
    }

    #[tokio::test]
    async fn test_capture_refused_until_gate_accepts() {
        let (_dir, _backend, handle) = setup("blank");
        let mut updates = handle.subscribe();
        handle.list_devices().await.unwrap();
        handle
            .start(Some("cam-3".into()), idgate_core::frame::ID1_ASPECT)
            .await
            .unwrap();
        let update = wait_for(&mut updates, |u| u.device_id == "cam-3").await;
        assert!(!update.verdict.accepted);
        assert!(matches!(handle.capture().await, Err(CaptureError::NotReady)));
    }

    #[tokio::test]
    async fn test_restart_never_overlaps_streams() {
        let (_dir, backend, handle) = setup("restart");
        let first = handle.start(None, 1.5).await.unwrap();
        let gen_a = handle.generation();
        assert_eq!(backend.live_streams(), 1);

        let second = handle.start(None, 1.5).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.live_streams(), 1);
        assert!(handle.generation() > gen_a);

        handle.stop().await.unwrap();
        assert_eq!(backend.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_switch_camera_restarts_on_other_device() {
        let (_dir, backend, handle) = setup("switch");
        let mut updates = handle.subscribe();
        handle.start(None, 1.5).await.unwrap();
        let target = handle.switch_camera().await.unwrap();
        assert_eq!(target.id, "cam-2");
        assert_eq!(backend.live_streams(), 1);

        let generation = handle.generation();
        let update = wait_for(&mut updates, |u| u.device_id == "cam-2").await;
        assert_eq!(update.generation, generation);
    }

    #[tokio::test]
    async fn test_unknown_device_is_reported() {
        let (_dir, backend, handle) = setup("unknown");
        let err = handle
            .start(Some("cam-9".into()), 1.5)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Device(DeviceError::Unavailable(_))));
        assert_eq!(backend.live_streams(), 0);
    }
}
