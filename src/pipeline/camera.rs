use std::{
    io::Cursor,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Sender, TrySendError};
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};

use crate::{
    diagnostics::{Counter, PipelineStats},
    display::DisplayBoard,
    error::PipelineError,
    stream::OutboundEvent,
    types::Frame,
};

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Where captured frames come from. `Ok(None)` means the source is exhausted.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    fn describe(&self) -> String;
}

/// Opens the frame source on the capture thread. Camera handles are not
/// always `Send`, so only the opener crosses threads.
pub type SourceOpener = Box<dyn FnOnce() -> Result<Box<dyn FrameSource>> + Send>;

#[cfg(feature = "camera-nokhwa")]
pub use self::device::NokhwaSource;

#[cfg(feature = "camera-nokhwa")]
mod device {
    use anyhow::{Result, anyhow};
    use nokhwa::{
        Camera,
        pixel_format::RgbFormat,
        utils::{CameraIndex, RequestedFormat, RequestedFormatType},
    };

    use super::FrameSource;
    use crate::types::Frame;

    /// A local camera. The stream is stopped when the source is dropped, on
    /// every exit path of the capture thread.
    pub struct NokhwaSource {
        camera: Camera,
        label: String,
    }

    impl NokhwaSource {
        pub fn open(index: u32) -> Result<Self> {
            let requested_formats = [
                RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
                RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
            ];

            let mut last_err = None;
            for requested in requested_formats {
                match Camera::new(CameraIndex::Index(index), requested) {
                    Ok(mut camera) => match camera.open_stream() {
                        Ok(()) => {
                            let label = camera.info().human_name();
                            log::info!("opened camera {index}: {label}");
                            return Ok(Self { camera, label });
                        }
                        Err(err) => last_err = Some(err.into()),
                    },
                    Err(err) => last_err = Some(err.into()),
                }
            }

            Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera {index}")))
        }
    }

    impl FrameSource for NokhwaSource {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            let buffer = self.camera.frame()?;
            let decoded = buffer.decode_image::<RgbFormat>()?;
            let (width, height) = decoded.dimensions();
            let rgb = decoded.into_raw();
            if rgb.is_empty() {
                return Err(anyhow!("camera returned an empty frame"));
            }
            Ok(Some(Frame::new(super::rgb_to_rgba(&rgb), width, height)))
        }

        fn describe(&self) -> String {
            self.label.clone()
        }
    }

    impl Drop for NokhwaSource {
        fn drop(&mut self) {
            if let Err(err) = self.camera.stop_stream() {
                log::warn!("failed to stop camera stream: {err}");
            }
        }
    }
}

/// Replays still images in order, one per tick.
pub struct ReplaySource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ReplaySource {
    pub fn open(paths: Vec<PathBuf>) -> Result<Self> {
        if paths.is_empty() {
            return Err(anyhow!("replay needs at least one image"));
        }
        if let Some(missing) = paths.iter().find(|path| !path.is_file()) {
            return Err(anyhow!("replay image {} does not exist", missing.display()));
        }
        Ok(Self { paths, next: 0 })
    }
}

impl FrameSource for ReplaySource {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .into_rgba8();
        let (width, height) = image.dimensions();
        Ok(Some(Frame::new(image.into_raw(), width, height)))
    }

    fn describe(&self) -> String {
        format!("replay of {} image(s)", self.paths.len())
    }
}

pub(crate) fn rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for chunk in rgb.chunks_exact(3) {
        rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
    }
    rgba
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let rgb: Vec<u8> = frame
        .rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    let img = ImageBuffer::<Rgb<u8>, _>::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)
        .context("jpeg encoding failed")?;
    Ok(buf.into_inner())
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub tick: Duration,
    pub jpeg_quality: u8,
    /// Consecutive read failures tolerated before the session stops.
    pub max_read_failures: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            jpeg_quality: 70,
            max_read_failures: 30,
        }
    }
}

/// How the capture loop ended.
#[derive(Debug)]
pub enum CaptureEnd {
    Stopped,
    Exhausted,
    Fault(PipelineError),
}

pub struct CaptureStage<'a> {
    pub settings: &'a CaptureSettings,
    pub frame_out: &'a Sender<OutboundEvent>,
    pub recog_tx: &'a Sender<Frame>,
    pub display: &'a DisplayBoard,
    pub stats: &'a PipelineStats,
}

impl CaptureStage<'_> {
    /// Reads, encodes and fans out one frame per tick until stopped.
    pub fn run(&self, source: &mut dyn FrameSource, stop: &AtomicBool) -> CaptureEnd {
        let mut consecutive_failures = 0u32;

        while !stop.load(Ordering::Relaxed) {
            let tick_start = Instant::now();

            match source.read_frame() {
                Ok(Some(frame)) => {
                    consecutive_failures = 0;
                    self.fan_out(frame);
                }
                Ok(None) => return CaptureEnd::Exhausted,
                Err(err) => {
                    consecutive_failures += 1;
                    let message = format!("frame read failed: {err:#}");
                    log::warn!("{message} ({consecutive_failures} in a row)");
                    self.stats
                        .record_fault(Counter::FrameReadFailures, message.clone());
                    if consecutive_failures > self.settings.max_read_failures {
                        return CaptureEnd::Fault(PipelineError::Camera(message));
                    }
                }
            }

            if let Some(rest) = self.settings.tick.checked_sub(tick_start.elapsed()) {
                thread::sleep(rest);
            }
        }

        CaptureEnd::Stopped
    }

    fn fan_out(&self, frame: Frame) {
        self.stats.incr(Counter::FramesCaptured);
        self.display.show_frame(frame.width, frame.height);

        match encode_jpeg(&frame, self.settings.jpeg_quality) {
            Ok(jpeg) => match self.frame_out.try_send(OutboundEvent::VideoFrame(jpeg)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.stats.incr(Counter::FramesDropped)
                }
            },
            Err(err) => log::warn!("{err:#}"),
        }

        // A busy recognition worker means this frame is skipped for
        // classification; it was still published above.
        if self.recog_tx.try_send(frame).is_err() {
            self.stats.incr(Counter::FramesDropped);
        }
    }
}
