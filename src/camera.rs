//! Frame-grabber workers.
//!
//! Both camera families are driven through [`CameraBackend`]. While idle the
//! driver streams preview frames; during a run every frame is also appended to
//! the recording until the frame budget for the run is used up.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::config::DeviceSettings;
use crate::display::SharedBuffer;
use crate::message::RunOutcome;
use crate::worker::{DeviceDriver, Presenter, Recorded, RunPlan};

pub const FRAMES_PER_SECOND: u64 = 30;

/// Shown in place of the live image once a camera has failed (0x00RRGGBB).
pub const ERROR_PIXEL: u32 = 0x00FF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraFamily {
    FireFly,
    MiniMicroscope,
}

impl CameraFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraFamily::FireFly => "FireFly",
            CameraFamily::MiniMicroscope => "Mini_Microscope",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CameraFamily::FireFly => ".avi",
            CameraFamily::MiniMicroscope => ".mkv",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("Camera device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cameras take no runtime settings")]
    Unconfigurable,
}

/// Seam around one vendor SDK.
pub trait CameraBackend: Send {
    fn open(&mut self) -> Result<(), CameraError>;

    fn get_frame(&mut self) -> Result<GrayImage, CameraError>;

    fn start_recording(&mut self, path: &Path) -> Result<(), CameraError>;

    /// Grab a frame, append it to the open recording and return it.
    fn append_frame(&mut self) -> Result<GrayImage, CameraError>;

    fn stop_recording(&mut self) -> Result<(), CameraError>;

    fn close(&mut self);
}

/// Frames to record for a run of `duration_ms`.
pub fn frame_budget(duration_ms: u32) -> u64 {
    u64::from(duration_ms) * FRAMES_PER_SECOND / 1000
}

pub fn save_path(save_dir: &Path, file_name: &str, family: CameraFamily, id: u32) -> PathBuf {
    save_dir.join(format!(
        "{}_[{}#{}]{}",
        file_name,
        family.as_str(),
        id,
        family.extension()
    ))
}

struct Recording {
    budget: u64,
    frames: u64,
}

pub struct CameraDriver<B: CameraBackend> {
    backend: B,
    family: CameraFamily,
    id: u32,
    recording: Option<Recording>,
}

impl<B: CameraBackend> CameraDriver<B> {
    pub fn new(backend: B, family: CameraFamily, id: u32) -> Self {
        Self {
            backend,
            family,
            id,
            recording: None,
        }
    }
}

impl<B: CameraBackend> DeviceDriver for CameraDriver<B> {
    type Frame = GrayImage;
    type Error = CameraError;

    fn initialize(&mut self) -> Result<(), CameraError> {
        self.backend.open()?;
        log::info!("Camera [{}#{}] connected", self.family.as_str(), self.id);
        Ok(())
    }

    fn check_connection(&mut self) -> bool {
        self.backend.get_frame().is_ok()
    }

    fn reconfigure(&mut self, _settings: &DeviceSettings) -> Result<(), CameraError> {
        Err(CameraError::Unconfigurable)
    }

    fn arm(&mut self, plan: &RunPlan) -> Result<(), CameraError> {
        let path = save_path(&plan.save_dir, &plan.file_name, self.family, self.id);
        self.backend.start_recording(&path)?;
        let budget = frame_budget(plan.duration_ms);
        log::debug!("Recording {} frames to {}", budget, path.display());
        self.recording = Some(Recording { budget, frames: 0 });
        Ok(())
    }

    fn preview(&mut self) -> Result<Option<GrayImage>, CameraError> {
        self.backend.get_frame().map(Some)
    }

    fn record(&mut self) -> Result<Recorded<GrayImage>, CameraError> {
        let Some(rec) = self.recording.as_mut() else {
            return Ok(Recorded::Complete);
        };
        if rec.frames >= rec.budget {
            return Ok(Recorded::Complete);
        }
        crate::profile_scope!("camera frame");
        let frame = self.backend.append_frame()?;
        rec.frames += 1;
        Ok(Recorded::Data(Some(frame)))
    }

    fn finish(&mut self, outcome: RunOutcome) -> Result<(), CameraError> {
        if let Some(rec) = self.recording.take() {
            log::debug!(
                "Camera [{}#{}] {:?} after {}/{} frames",
                self.family.as_str(),
                self.id,
                outcome,
                rec.frames,
                rec.budget
            );
            self.backend.stop_recording()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.backend.close();
    }
}

/// Resizes frames to the display shape and packs grey levels into 0x00RRGGBB.
pub struct FramePresenter {
    buffer: SharedBuffer<u32>,
}

impl FramePresenter {
    /// `buffer` is `height` rows by `width` columns.
    pub fn new(buffer: SharedBuffer<u32>) -> Self {
        Self { buffer }
    }
}

pub fn pack_grey(p: u8) -> u32 {
    let p = u32::from(p);
    (p << 16) | (p << 8) | p
}

impl Presenter<GrayImage> for FramePresenter {
    fn present(&mut self, frame: &GrayImage) {
        let (rows, cols) = self.buffer.shape();
        let resized;
        let frame = if frame.dimensions() == (cols as u32, rows as u32) {
            frame
        } else {
            resized = imageops::resize(frame, cols as u32, rows as u32, FilterType::Triangle);
            &resized
        };
        self.buffer.publish(|data| {
            for (slot, p) in data.iter_mut().zip(frame.as_raw()) {
                *slot = pack_grey(*p);
            }
        });
    }

    fn present_error(&mut self) {
        self.buffer.force_publish(|data| data.fill(ERROR_PIXEL));
    }
}
