//! Synthetic hardware for tests and demos.

use std::f64::consts::TAU;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use image::GrayImage;

use crate::camera::{CameraBackend, CameraError, FRAMES_PER_SECOND};
use crate::daq::{Batch, DaqBackend, DaqError};
use crate::daq_stream::StreamConfig;

/// Test-pattern camera. Recordings are raw 8-bit frames back to back.
#[derive(Debug)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    paced: bool,
    unplugged: bool,
    fail_after: Option<u64>,
    frames: u64,
    open: bool,
    recording: Option<BufWriter<File>>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            paced: true,
            unplugged: false,
            fail_after: None,
            frames: 0,
            open: false,
            recording: None,
        }
    }

    /// Deliver frames as fast as they are asked for.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn unplugged(mut self) -> Self {
        self.unplugged = true;
        self
    }

    /// Fail on the frame after `frames` frames have been grabbed.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    fn grab(&mut self) -> Result<GrayImage, CameraError> {
        if !self.open {
            return Err(CameraError::Device("camera not open".into()));
        }
        if self.fail_after.is_some_and(|limit| self.frames >= limit) {
            return Err(CameraError::Device("synthetic camera fault".into()));
        }
        if self.paced {
            thread::sleep(Duration::from_millis(1000 / FRAMES_PER_SECOND));
        }
        let shift = self.frames as u32;
        self.frames += 1;
        Ok(GrayImage::from_fn(self.width, self.height, |x, y| {
            image::Luma([(x + y + shift) as u8])
        }))
    }
}

impl CameraBackend for SyntheticCamera {
    fn open(&mut self) -> Result<(), CameraError> {
        if self.unplugged {
            return Err(CameraError::Device("no camera at this index".into()));
        }
        self.open = true;
        Ok(())
    }

    fn get_frame(&mut self) -> Result<GrayImage, CameraError> {
        self.grab()
    }

    fn start_recording(&mut self, path: &Path) -> Result<(), CameraError> {
        self.recording = Some(BufWriter::new(File::create(path)?));
        Ok(())
    }

    fn append_frame(&mut self) -> Result<GrayImage, CameraError> {
        let frame = self.grab()?;
        let file = self
            .recording
            .as_mut()
            .ok_or_else(|| CameraError::Device("no recording open".into()))?;
        file.write_all(frame.as_raw())?;
        Ok(frame)
    }

    fn stop_recording(&mut self) -> Result<(), CameraError> {
        if let Some(mut file) = self.recording.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.recording = None;
        self.open = false;
    }
}

/// Streams one sine per channel; channel `i` runs at `i + 1` Hz.
#[derive(Debug)]
pub struct SyntheticDaq {
    paced: bool,
    unplugged: bool,
    missed_every: Option<(u64, u32)>,
    fail_after: Option<u64>,
    stream: Option<StreamConfig>,
    reads: u64,
    scans: u64,
}

impl Default for SyntheticDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDaq {
    pub fn new() -> Self {
        Self {
            paced: true,
            unplugged: false,
            missed_every: None,
            fail_after: None,
            stream: None,
            reads: 0,
            scans: 0,
        }
    }

    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn unplugged(mut self) -> Self {
        self.unplugged = true;
        self
    }

    /// Report `count` missed samples on every `every`-th read.
    pub fn with_missed_every(mut self, every: u64, count: u32) -> Self {
        self.missed_every = Some((every.max(1), count));
        self
    }

    /// Fail on the read after `reads` successful reads.
    pub fn fail_after(mut self, reads: u64) -> Self {
        self.fail_after = Some(reads);
        self
    }
}

impl DaqBackend for SyntheticDaq {
    fn connect(&mut self) -> Result<(), DaqError> {
        if self.unplugged {
            Err(DaqError::Device("no DAQ found".into()))
        } else {
            Ok(())
        }
    }

    fn configure(&mut self, config: &StreamConfig, channels: &[u8]) -> Result<(), DaqError> {
        let packet = config.command_packet(channels);
        log::debug!(
            "Synthetic DAQ streaming {:?} ({} byte config packet)",
            channels,
            packet.len()
        );
        self.stream = Some(*config);
        Ok(())
    }

    fn read_batch(&mut self) -> Result<Batch, DaqError> {
        let config = self
            .stream
            .ok_or_else(|| DaqError::Device("stream not started".into()))?;
        if self.fail_after.is_some_and(|limit| self.reads >= limit) {
            return Err(DaqError::Device("synthetic DAQ fault".into()));
        }
        self.reads += 1;

        let n = config.n_channels;
        let scans = u64::from(config.samples_per_request()) / n as u64;
        if self.paced {
            thread::sleep(Duration::from_secs_f64(
                scans as f64 / f64::from(config.scan_freq),
            ));
        }

        let mut samples = Vec::with_capacity(scans as usize * n);
        for s in 0..scans {
            let t = (self.scans + s) as f64 / f64::from(config.scan_freq);
            for ch in 0..n {
                samples.push(5.0 * (TAU * (ch + 1) as f64 * t).sin());
            }
        }
        self.scans += scans;

        let missed = match self.missed_every {
            Some((every, count)) if self.reads % every == 0 => count,
            _ => 0,
        };
        Ok(Batch { samples, missed })
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        self.stream = None;
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}
