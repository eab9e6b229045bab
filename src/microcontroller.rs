//! Stimulus microcontroller worker.
//!
//! Arming uploads the whole schedule with the stop-and-wait packet protocol.
//! Once the start barrier releases, a single start byte sets it running; the
//! host then only waits out the duration and collects the timing report.
//! The board is reset by reconnecting after every run.

use std::thread;
use std::time::{Duration, Instant};

use crate::config::DeviceSettings;
use crate::display::SharedBuffer;
use crate::message::RunOutcome;
use crate::micro_connector::{self, ConnectorError, MicroConnector};
use crate::serial_link::{LinkError, RunReport, SerialLink, Transport};
use crate::stimulus::{self, StimulusConfig, StimulusError, WireFrame};
use crate::worker::{DeviceDriver, Presenter, Recorded, RunPlan};

const PACKET_TIMEOUT: Duration = Duration::from_secs(1);
const REPORT_TIMEOUT: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum MicroError {
    #[error("Connection error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Serial link error: {0}")]
    Link(#[from] LinkError),

    #[error("Stimulus error: {0}")]
    Stimulus(#[from] StimulusError),

    #[error("Microcontroller is not connected")]
    NotConnected,

    #[error("Cannot apply DAQ settings to the microcontroller")]
    WrongSettings,
}

/// Produces a freshly reset link to the board.
pub trait LinkOpener: Send {
    type Transport: Transport;

    fn open(&mut self) -> Result<SerialLink<Self::Transport>, ConnectorError>;
}

impl<F, T> LinkOpener for F
where
    F: FnMut() -> Result<SerialLink<T>, ConnectorError> + Send,
    T: Transport,
{
    type Transport = T;

    fn open(&mut self) -> Result<SerialLink<T>, ConnectorError> {
        self()
    }
}

/// Opens the board on a real serial port, remembering which port answered.
#[derive(Debug, Clone)]
pub struct PortOpener {
    pub last_port: Option<String>,
    pub baud_rate: u32,
    found: Option<String>,
}

impl PortOpener {
    pub fn new(last_port: Option<String>, baud_rate: u32) -> Self {
        Self {
            last_port,
            baud_rate,
            found: None,
        }
    }

    /// The port that last answered, worth persisting as `last_port`.
    pub fn found_port(&self) -> Option<&str> {
        self.found.as_deref()
    }
}

impl LinkOpener for PortOpener {
    type Transport = Box<dyn serialport::SerialPort>;

    fn open(&mut self) -> Result<SerialLink, ConnectorError> {
        if let Some(port) = &self.found {
            match micro_connector::reopen(port, self.baud_rate) {
                Ok(link) => return Ok(link),
                Err(e) => log::warn!("Reopening {} failed ({}), searching again", port, e),
            }
        }
        let (link, port) = MicroConnector::connect(self.last_port.as_deref(), self.baud_rate)?;
        self.found = Some(port);
        Ok(link)
    }
}

/// How far the schedule has played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StimulusProgress {
    pub elapsed_ms: u32,
    pub total_ms: u32,
}

struct Schedule {
    total: Duration,
    started: Option<Instant>,
}

pub struct MicroDriver<O: LinkOpener> {
    opener: O,
    link: Option<SerialLink<O::Transport>>,
    stimulus: StimulusConfig,
    schedule: Option<Schedule>,
    last_report: Option<RunReport>,
}

impl<O: LinkOpener> MicroDriver<O> {
    pub fn new(opener: O, stimulus: StimulusConfig) -> Self {
        Self {
            opener,
            link: None,
            stimulus,
            schedule: None,
            last_report: None,
        }
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report
    }

    fn link(&mut self) -> Result<&mut SerialLink<O::Transport>, MicroError> {
        self.link.as_mut().ok_or(MicroError::NotConnected)
    }

    fn reset(&mut self) -> Result<(), MicroError> {
        self.link = None;
        self.link = Some(self.opener.open()?);
        Ok(())
    }
}

impl<O: LinkOpener> DeviceDriver for MicroDriver<O> {
    type Frame = StimulusProgress;
    type Error = MicroError;

    fn initialize(&mut self) -> Result<(), MicroError> {
        self.link = Some(self.opener.open()?);
        Ok(())
    }

    /// Reconnects, so a board that stopped answering is caught before a run.
    fn check_connection(&mut self) -> bool {
        match self.reset() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Microcontroller did not answer: {}", e);
                false
            }
        }
    }

    fn reconfigure(&mut self, settings: &DeviceSettings) -> Result<(), MicroError> {
        let DeviceSettings::Stimulus(stimulus) = settings else {
            return Err(MicroError::WrongSettings);
        };
        stimulus.validate()?;
        log::info!("Stimulus replaced: {} segments", stimulus.segments.len());
        self.stimulus = stimulus.clone();
        Ok(())
    }

    fn arm(&mut self, plan: &RunPlan) -> Result<(), MicroError> {
        let frames =
            stimulus::compile_program(&self.stimulus, plan.duration_ms, stimulus::local_system_time())?;
        let total_ms = frames
            .iter()
            .find_map(|f| match f {
                WireFrame::Global(g) => Some(g.total_ms),
                _ => None,
            })
            .unwrap_or(plan.duration_ms);

        let link = self.link()?;
        let uploaded = frames
            .iter()
            .try_for_each(|frame| link.send_frame(frame, PACKET_TIMEOUT));
        if let Err(e) = uploaded {
            log::warn!("Stimulus upload failed ({}), resetting microcontroller", e);
            if let Err(reset) = self.reset() {
                log::warn!("Microcontroller reset failed: {}", reset);
            }
            return Err(e.into());
        }
        log::debug!("Uploaded {} stimulus frames for {} ms", frames.len(), total_ms);
        self.schedule = Some(Schedule {
            total: Duration::from_millis(u64::from(total_ms)),
            started: None,
        });
        Ok(())
    }

    fn begin(&mut self) -> Result<(), MicroError> {
        self.link()?.send_start()?;
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.started = Some(Instant::now());
        }
        Ok(())
    }

    fn record(&mut self) -> Result<Recorded<StimulusProgress>, MicroError> {
        let Some(Schedule {
            total,
            started: Some(started),
        }) = self.schedule.as_ref()
        else {
            return Ok(Recorded::Complete);
        };
        let (total, elapsed) = (*total, started.elapsed());

        if elapsed >= total {
            match self.link()?.read_report(REPORT_TIMEOUT) {
                Ok(report) => {
                    log::info!(
                        "Stimulus played {} ms (board clock {} -> {})",
                        report.total_ms,
                        report.start_ms,
                        report.end_ms
                    );
                    self.last_report = Some(report);
                }
                Err(e) => log::warn!("No run report from microcontroller: {}", e),
            }
            return Ok(Recorded::Complete);
        }

        thread::sleep(TICK.min(total - elapsed));
        Ok(Recorded::Data(Some(StimulusProgress {
            elapsed_ms: elapsed.as_millis() as u32,
            total_ms: total.as_millis() as u32,
        })))
    }

    fn finish(&mut self, outcome: RunOutcome) -> Result<(), MicroError> {
        if self.schedule.take().is_some() {
            log::debug!("Resetting microcontroller after {:?} run", outcome);
            self.reset()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.link = None;
    }
}

/// Publishes `[elapsed_ms, total_ms]` for a progress bar.
pub struct ProgressPresenter {
    buffer: SharedBuffer<u32>,
}

impl ProgressPresenter {
    pub fn new(buffer: SharedBuffer<u32>) -> Self {
        Self { buffer }
    }
}

impl Presenter<StimulusProgress> for ProgressPresenter {
    fn present(&mut self, progress: &StimulusProgress) {
        self.buffer.publish(|data| {
            if let [elapsed, total, ..] = data {
                *elapsed = progress.elapsed_ms;
                *total = progress.total_ms;
            }
        });
    }
}
