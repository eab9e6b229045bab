//! Wires a coordinator, one worker per configured device and the display
//! buffers together, and runs the coordinator on its own thread.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::camera::{CameraBackend, CameraDriver, FramePresenter};
use crate::config::{ConfigError, Settings};
use crate::coordinator::Coordinator;
use crate::daq::{DaqBackend, DaqDriver, DaqError, TracePresenter};
use crate::display::SharedBuffer;
use crate::message::{DeviceId, DeviceKind, RunOutcome, UiEvent, UserCommand};
use crate::microcontroller::{LinkOpener, MicroDriver, ProgressPresenter};
use crate::worker::{self, WorkerHandle};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("DAQ error: {0}")]
    Daq(#[from] DaqError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{configured} cameras configured but {provided} camera backends provided")]
    CameraCount { configured: usize, provided: usize },
}

/// The hardware handed to a session. Cameras pair up with
/// `Settings::cameras` in order; the DAQ and microcontroller are only used
/// when their settings section is present.
pub struct Hardware<C, D, O> {
    pub cameras: Vec<C>,
    pub daq: Option<D>,
    pub microcontroller: Option<O>,
}

/// Display buffers the UI reads from.
#[derive(Debug, Clone, Default)]
pub struct Displays {
    pub cameras: Vec<(DeviceId, SharedBuffer<u32>)>,
    pub daq: Option<SharedBuffer<f32>>,
    pub stimulus: Option<SharedBuffer<u32>>,
}

pub struct Session {
    commands: Sender<UserCommand>,
    events: Receiver<UiEvent>,
    displays: Displays,
    workers: Vec<WorkerHandle>,
    coordinator: Option<JoinHandle<()>>,
}

impl Session {
    pub fn start<C, D, O>(settings: &Settings, hardware: Hardware<C, D, O>) -> Result<Self, SessionError>
    where
        C: CameraBackend + 'static,
        D: DaqBackend + 'static,
        O: LinkOpener + 'static,
    {
        settings.validate()?;
        if settings.cameras.len() != hardware.cameras.len() {
            return Err(SessionError::CameraCount {
                configured: settings.cameras.len(),
                provided: hardware.cameras.len(),
            });
        }
        std::fs::create_dir_all(&settings.save_dir)?;

        let (ui_tx, events) = unbounded();
        let mut coordinator = Coordinator::new(ui_tx, settings.ack_timeout());
        let mut workers = Vec::new();
        let mut displays = Displays::default();
        let shape = settings.display;

        for (camera, backend) in settings.cameras.iter().zip(hardware.cameras) {
            let ctx = coordinator.register(DeviceKind::Camera);
            let id = ctx.id;
            let buffer = SharedBuffer::new(shape.frame_height, shape.frame_width);
            let driver = CameraDriver::new(backend, camera.family, camera.id);
            workers.push(worker::spawn(ctx, driver, FramePresenter::new(buffer.clone()))?);
            displays.cameras.push((id, buffer));
        }

        if let (Some(daq), Some(backend)) = (&settings.daq, hardware.daq) {
            let driver = DaqDriver::new(backend, daq.clone())?;
            let ctx = coordinator.register(DeviceKind::Daq);
            let (rows, cols) = TracePresenter::buffer_shape(shape.trace_len);
            let buffer = SharedBuffer::new(rows, cols);
            workers.push(worker::spawn(ctx, driver, TracePresenter::new(buffer.clone()))?);
            displays.daq = Some(buffer);
        }

        if let (Some(micro), Some(opener)) = (&settings.microcontroller, hardware.microcontroller) {
            let ctx = coordinator.register(DeviceKind::Microcontroller);
            let buffer = SharedBuffer::new(1, 2);
            let driver = MicroDriver::new(opener, micro.stimulus.clone());
            workers.push(worker::spawn(ctx, driver, ProgressPresenter::new(buffer.clone()))?);
            displays.stimulus = Some(buffer);
            coordinator.set_min_duration(micro.stimulus.latest_off_ms());
        }

        // Listeners answer these before hardware initialization completes
        coordinator.set_save_dir(settings.save_dir.clone());
        coordinator.set_duration(settings.total_duration_ms);

        let (commands, command_rx) = unbounded();
        let coordinator = thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || coordinator.run(&command_rx))?;
        log::info!("Session started with {} devices", workers.len());

        Ok(Self {
            commands,
            events,
            displays,
            workers,
            coordinator: Some(coordinator),
        })
    }

    pub fn send(&self, command: UserCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Coordinator has already stopped");
        }
    }

    pub fn run_experiment(&self, name: &str) {
        self.send(UserCommand::RunExperiment(name.to_string()));
    }

    pub fn hardstop(&self) {
        self.send(UserCommand::Hardstop);
    }

    pub fn events(&self) -> &Receiver<UiEvent> {
        &self.events
    }

    pub fn displays(&self) -> &Displays {
        &self.displays
    }

    pub fn next_event(&self, timeout: Duration) -> Option<UiEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Wait for the active run to finish, returning every event seen on the
    /// way. `None` if `timeout` passes first.
    pub fn wait_for_finish(&self, timeout: Duration) -> Option<(RunOutcome, Vec<UiEvent>)> {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(UiEvent::Finished(outcome)) => return Some((outcome, seen)),
                Ok(event) => seen.push(event),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Close every device and join all threads.
    pub fn shutdown(mut self) {
        self.send(UserCommand::Exit);
        if let Some(coordinator) = self.coordinator.take() {
            if coordinator.join().is_err() {
                log::error!("Coordinator thread panicked");
            }
        }
        for worker in self.workers.drain(..) {
            worker.join();
        }
        log::info!("Session closed");
    }
}
