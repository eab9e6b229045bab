//! Streaming analog acquisition.
//!
//! The vendor device sits behind [`DaqBackend`]. [`DaqDriver`] keeps the
//! stream running for live preview, and during a run records a pre-roll, the
//! experiment and a post-roll to CSV on a dedicated writer thread.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use polars::prelude::*;

use crate::config::{DaqSettings, DeviceSettings};
use crate::daq_stream::{
    MissedSamples, RequestPlan, RunLedger, RunSummary, Segment, StreamConfig, StreamConfigError,
    MAX_CHANNELS,
};
use crate::display::SharedBuffer;
use crate::message::RunOutcome;
use crate::worker::{DeviceDriver, Presenter, Recorded, RunPlan};

#[derive(Debug, thiserror::Error)]
pub enum DaqError {
    #[error("DAQ device error: {0}")]
    Device(String),

    #[error("Stream configuration error: {0}")]
    Stream(#[from] StreamConfigError),

    #[error("Invalid DAQ settings: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Recording writer stopped unexpectedly")]
    WriterGone,

    #[error("Cannot apply {0} settings to the DAQ")]
    WrongSettings(&'static str),
}

/// One read from the device: whole scans, channel-interleaved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub samples: Vec<f64>,
    pub missed: u32,
}

/// Seam around the vendor driver.
pub trait DaqBackend: Send {
    fn connect(&mut self) -> Result<(), DaqError>;

    /// Push stream parameters and (re)start streaming.
    fn configure(&mut self, config: &StreamConfig, channels: &[u8]) -> Result<(), DaqError>;

    /// Block for the next request worth of samples.
    fn read_batch(&mut self) -> Result<Batch, DaqError>;

    fn stop(&mut self) -> Result<(), DaqError>;

    fn close(&mut self);
}

/// Samples handed to the display.
#[derive(Debug, Clone, PartialEq)]
pub struct DaqFrame {
    pub n_channels: usize,
    pub samples: Vec<f64>,
}

impl DaqFrame {
    pub fn channel(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        self.samples
            .iter()
            .skip(index)
            .step_by(self.n_channels.max(1))
            .copied()
    }
}

enum WriterMsg {
    Batch(Vec<f64>),
    Summary(RunSummary),
}

/// CSV sink running on its own thread so disk latency never stalls reads.
struct RecordingWriter {
    tx: Sender<WriterMsg>,
    handle: JoinHandle<Result<(), DaqError>>,
}

impl RecordingWriter {
    fn spawn(data_path: PathBuf, summary_path: PathBuf, channels: &[u8]) -> Result<Self, DaqError> {
        let names: Vec<String> = channels.iter().map(|ch| format!("AIN{ch}")).collect();
        let mut file = BufWriter::new(File::create(&data_path)?);
        writeln!(file, "{}", names.join(","))?;

        let (tx, rx) = unbounded::<WriterMsg>();
        let handle = thread::Builder::new()
            .name("daq-writer".into())
            .spawn(move || {
                for msg in rx {
                    match msg {
                        WriterMsg::Batch(samples) => write_batch(&mut file, &names, &samples)?,
                        WriterMsg::Summary(summary) => write_summary(&summary_path, &summary)?,
                    }
                }
                file.flush()?;
                log::debug!("Recording closed: {}", data_path.display());
                Ok(())
            })?;
        Ok(Self { tx, handle })
    }

    fn send(&self, msg: WriterMsg) -> Result<(), DaqError> {
        self.tx.send(msg).map_err(|_| DaqError::WriterGone)
    }

    fn close(self) -> Result<(), DaqError> {
        drop(self.tx);
        self.handle.join().map_err(|_| DaqError::WriterGone)?
    }
}

fn write_batch(file: &mut impl Write, names: &[String], samples: &[f64]) -> Result<(), DaqError> {
    let n = names.len();
    let columns: Vec<Column> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let values: Vec<f64> = samples.iter().skip(i).step_by(n).copied().collect();
            Series::new(name.as_str().into(), values).into()
        })
        .collect();
    let mut df = DataFrame::new(columns)?;
    CsvWriter::new(file).include_header(false).finish(&mut df)?;
    Ok(())
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), DaqError> {
    let secs = |d: Duration| Some(d.as_secs_f64());
    let count = |c: u64| Some(c as f64);
    let d = &summary.durations;
    let s = &summary.samples;
    let m = &summary.missed;

    let metric: Vec<&str> = vec![
        "TIME (s)",
        "SAMPLES TAKEN",
        "SAMPLES MISSED",
        "SAMPLING FREQ (Hz)",
        "SCAN FREQ (Hz)",
    ];
    let before = vec![secs(d.before), count(s.before), count(m.before), None, None];
    let during = vec![
        secs(d.during),
        count(s.during),
        count(m.during),
        Some(summary.exp_sample_freq),
        Some(summary.exp_scan_freq),
    ];
    let after = vec![secs(d.after), count(s.after), count(m.after), None, None];
    let total = vec![
        secs(d.total()),
        count(s.total()),
        count(m.total()),
        Some(summary.overall_sample_freq),
        Some(summary.overall_scan_freq),
    ];

    let mut df = DataFrame::new(vec![
        Series::new("metric".into(), metric).into(),
        Series::new("BEFORE EXP".into(), before).into(),
        Series::new("DURING EXP".into(), during).into(),
        Series::new("AFTER EXP".into(), after).into(),
        Series::new("TOTAL".into(), total).into(),
    ])?;
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    log::info!("Wrote run summary to {}", path.display());
    Ok(())
}

struct Recording {
    requests: RequestPlan,
    next_request: u64,
    segment: Option<Segment>,
    stream_start: Instant,
    segment_start: Instant,
    ledger: RunLedger,
    writer: RecordingWriter,
    began: bool,
}

impl Recording {
    /// Close the wall-clock span of the segment currently being recorded.
    fn close_segment(&mut self, now: Instant) {
        if let Some(segment) = self.segment.take() {
            *self.ledger.durations.get_mut(segment) += now - self.segment_start;
        }
        self.segment_start = now;
    }
}

pub struct DaqDriver<B: DaqBackend> {
    backend: B,
    settings: DaqSettings,
    config: StreamConfig,
    recording: Option<Recording>,
}

impl<B: DaqBackend> DaqDriver<B> {
    pub fn new(backend: B, settings: DaqSettings) -> Result<Self, DaqError> {
        settings
            .validate()
            .map_err(|e| DaqError::Settings(e.to_string()))?;
        let config = StreamConfig::derive(settings.scan_freq, settings.channels.len())?;
        Ok(Self {
            backend,
            settings,
            config,
            recording: None,
        })
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.config
    }

    fn frame(&self, samples: Vec<f64>) -> DaqFrame {
        DaqFrame {
            n_channels: self.config.n_channels,
            samples,
        }
    }
}

impl<B: DaqBackend> DeviceDriver for DaqDriver<B> {
    type Frame = DaqFrame;
    type Error = DaqError;

    fn initialize(&mut self) -> Result<(), DaqError> {
        self.backend.connect()?;
        self.backend.configure(&self.config, &self.settings.channels)?;
        log::info!(
            "DAQ streaming channels {:?} at {} Hz",
            self.settings.channels,
            self.config.scan_freq
        );
        Ok(())
    }

    fn check_connection(&mut self) -> bool {
        match self.backend.read_batch() {
            Ok(_) => true,
            Err(e) => {
                log::warn!("DAQ connection check failed: {}", e);
                false
            }
        }
    }

    fn reconfigure(&mut self, settings: &DeviceSettings) -> Result<(), DaqError> {
        let DeviceSettings::Daq(settings) = settings else {
            return Err(DaqError::WrongSettings("stimulus"));
        };
        settings
            .validate()
            .map_err(|e| DaqError::Settings(e.to_string()))?;
        let config = StreamConfig::derive(settings.scan_freq, settings.channels.len())?;
        self.backend.stop()?;
        self.backend.configure(&config, &settings.channels)?;
        self.settings = settings.clone();
        self.config = config;
        Ok(())
    }

    fn arm(&mut self, plan: &RunPlan) -> Result<(), DaqError> {
        let data_path = plan.save_dir.join(format!("{}.csv", plan.file_name));
        let summary_path = plan.save_dir.join(format!("{}_summary.csv", plan.file_name));
        let writer = RecordingWriter::spawn(data_path, summary_path, &self.settings.channels)?;
        let requests = RequestPlan::new(&self.config, plan.duration_ms);
        log::debug!(
            "DAQ armed: {} + {} + {} requests",
            requests.pre_roll,
            requests.experiment,
            requests.post_roll
        );
        let now = Instant::now();
        self.recording = Some(Recording {
            requests,
            next_request: 0,
            segment: None,
            stream_start: now,
            segment_start: now,
            ledger: RunLedger::default(),
            writer,
            began: false,
        });
        Ok(())
    }

    fn begin(&mut self) -> Result<(), DaqError> {
        if let Some(rec) = self.recording.as_mut() {
            let now = Instant::now();
            rec.stream_start = now;
            rec.segment_start = now;
            rec.began = true;
        }
        Ok(())
    }

    fn preview(&mut self) -> Result<Option<DaqFrame>, DaqError> {
        let batch = self.backend.read_batch()?;
        Ok(Some(self.frame(batch.samples)))
    }

    fn record(&mut self) -> Result<Recorded<DaqFrame>, DaqError> {
        let Some(rec) = self.recording.as_mut() else {
            return Ok(Recorded::Complete);
        };
        let Some(segment) = rec.requests.segment_of(rec.next_request) else {
            rec.close_segment(Instant::now());
            return Ok(Recorded::Complete);
        };
        if rec.segment != Some(segment) {
            rec.close_segment(Instant::now());
            rec.segment = Some(segment);
        }

        crate::profile_scope!("daq read");
        let batch = self.backend.read_batch()?;
        if batch.missed > 0 {
            log::debug!("DAQ missed {} samples", batch.missed);
            rec.ledger.missed.push(MissedSamples {
                at: rec.stream_start.elapsed(),
                count: batch.missed,
            });
        }
        *rec.ledger.requests.get_mut(segment) += 1;
        rec.next_request += 1;
        rec.writer.send(WriterMsg::Batch(batch.samples.clone()))?;

        let frame = DaqFrame {
            n_channels: self.config.n_channels,
            samples: batch.samples,
        };
        Ok(Recorded::Data(Some(frame)))
    }

    fn finish(&mut self, outcome: RunOutcome) -> Result<(), DaqError> {
        let Some(mut rec) = self.recording.take() else {
            return Ok(());
        };
        rec.close_segment(Instant::now());
        if rec.began {
            let summary = rec.ledger.summarize(&self.config);
            log::info!(
                "DAQ run {:?}: {} samples, {} missed",
                outcome,
                summary.samples.total(),
                summary.missed.total()
            );
            rec.writer.send(WriterMsg::Summary(summary))?;
        }
        rec.writer.close()
    }

    fn close(&mut self) {
        if let Err(e) = self.backend.stop() {
            log::warn!("DAQ did not stop cleanly: {}", e);
        }
        self.backend.close();
    }
}

/// Copies the newest batch into a per-channel trace buffer.
pub struct TracePresenter {
    buffer: SharedBuffer<f32>,
}

impl TracePresenter {
    /// `buffer` rows are channels, columns are samples.
    pub fn new(buffer: SharedBuffer<f32>) -> Self {
        Self { buffer }
    }

    pub fn buffer_shape(trace_len: usize) -> (usize, usize) {
        (MAX_CHANNELS, trace_len)
    }
}

impl Presenter<DaqFrame> for TracePresenter {
    fn present(&mut self, frame: &DaqFrame) {
        let (rows, cols) = self.buffer.shape();
        self.buffer.publish(|data| {
            data.fill(f32::NAN);
            for ch in 0..frame.n_channels.min(rows) {
                let row = &mut data[ch * cols..(ch + 1) * cols];
                for (slot, v) in row.iter_mut().zip(frame.channel(ch)) {
                    *slot = v as f32;
                }
            }
        });
    }
}
