//! Owns every device record and drives runs.
//!
//! All state changes happen on the coordinator's own thread, either in
//! response to a [`UserCommand`] or to a [`Notification`] posted by a worker.
//! Synchronous commands go out over each device's [`ControlLink`]; a missing
//! acknowledgement counts as a connectivity failure.

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use crate::barrier::StartBarrier;
use crate::config::DeviceSettings;
use crate::control_channel::{self, ChannelError, ControlLink};
use crate::message::{
    Command, DeviceEvent, DeviceId, DeviceKind, Notification, Reply, RunId, RunOutcome, UiEvent,
    UserCommand,
};
use crate::worker::WorkerContext;

const EVENT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct DeviceRecord {
    pub id: DeviceId,
    link: ControlLink,
    /// Chosen by the user; cleared for good once the device reports an error.
    pub enabled: bool,
    pub failed: bool,
    /// Acknowledged `START` for the active run, not yet released.
    pub armed: bool,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveRun {
    id: RunId,
    save_file_name: String,
    released: bool,
}

pub struct Coordinator {
    devices: Vec<DeviceRecord>,
    barrier: StartBarrier,
    events_tx: Sender<Notification>,
    events: Receiver<Notification>,
    ui: Sender<UiEvent>,
    ack_timeout: Duration,
    duration_ms: u32,
    min_duration_ms: u32,
    save_dir: PathBuf,
    next_run: u64,
    active: Option<ActiveRun>,
}

impl Coordinator {
    pub fn new(ui: Sender<UiEvent>, ack_timeout: Duration) -> Self {
        let (events_tx, events) = unbounded();
        Self {
            devices: Vec::new(),
            barrier: StartBarrier::new(),
            events_tx,
            events,
            ui,
            ack_timeout,
            duration_ms: 20_000,
            min_duration_ms: 0,
            save_dir: PathBuf::from("."),
            next_run: 1,
            active: None,
        }
    }

    /// Create the record for a new device and hand back what its worker needs.
    pub fn register(&mut self, kind: DeviceKind) -> WorkerContext {
        let index = self.devices.iter().filter(|d| d.id.kind == kind).count();
        let id = DeviceId::new(kind, index);
        let (link, control) = control_channel::pair();
        self.devices.push(DeviceRecord {
            id,
            link,
            enabled: true,
            failed: false,
            armed: false,
            running: false,
        });
        log::debug!("Registered {}", id);
        WorkerContext {
            id,
            control,
            events: self.events_tx.clone(),
            barrier: self.barrier.clone(),
        }
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    pub fn is_run_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn set_enabled(&mut self, id: DeviceId, enabled: bool) {
        if self.active.is_some() {
            log::warn!("Cannot change {} while a run is active", id);
            return;
        }
        match self.device_mut(id) {
            Some(d) if d.failed && enabled => log::warn!("{} failed earlier and stays disabled", id),
            Some(d) => d.enabled = enabled,
            None => log::warn!("Unknown device {}", id),
        }
    }

    fn emit(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            log::debug!("UI receiver dropped");
        }
    }

    fn request(&mut self, index: usize, command: Command) -> Result<Reply, ChannelError> {
        let timeout = self.ack_timeout;
        let device = &mut self.devices[index];
        let result = device.link.request(command, timeout);
        if let Err(e) = &result {
            log::warn!("{}: {}", device.id, e);
        }
        result
    }

    fn enabled_indices(&self) -> Vec<usize> {
        (0..self.devices.len())
            .filter(|&i| self.devices[i].enabled)
            .collect()
    }

    /// AND of `CHECK_CONN` over every enabled device.
    pub fn check_connections(&mut self) -> bool {
        let mut all_ok = true;
        for i in self.enabled_indices() {
            let ok = matches!(self.request(i, Command::CheckConn), Ok(Reply::Connected(true)));
            if !ok {
                log::warn!("{} is not connected", self.devices[i].id);
                all_ok = false;
            }
        }
        all_ok
    }

    /// Lower bound for the run duration, typically the end of the last
    /// stimulus segment.
    pub fn set_min_duration(&mut self, min_duration_ms: u32) {
        self.min_duration_ms = min_duration_ms;
        if self.duration_ms < min_duration_ms {
            self.set_duration(min_duration_ms);
        }
    }

    pub fn set_duration(&mut self, duration_ms: u32) {
        if self.active.is_some() {
            log::warn!("Run in progress; duration unchanged");
            return;
        }
        self.duration_ms = duration_ms.max(self.min_duration_ms);
        self.broadcast(&Command::SetTime(self.duration_ms));
    }

    pub fn set_save_dir(&mut self, dir: PathBuf) {
        if self.active.is_some() {
            log::warn!("Run in progress; save directory unchanged");
            return;
        }
        self.save_dir = dir.clone();
        self.broadcast(&Command::SetDir(dir));
    }

    /// Send to every device that has not failed, enabled or not.
    fn broadcast(&mut self, command: &Command) {
        for i in 0..self.devices.len() {
            if !self.devices[i].failed {
                let _ = self.request(i, command.clone());
            }
        }
    }

    pub fn reconfigure(&mut self, id: DeviceId, settings: DeviceSettings) {
        if self.active.is_some() {
            log::warn!("Cannot reconfigure {} during a run", id);
            return;
        }
        let Some(index) = self.devices.iter().position(|d| d.id == id && !d.failed) else {
            log::warn!("Cannot reconfigure {}", id);
            return;
        };
        let min_duration = match &settings {
            DeviceSettings::Stimulus(stimulus) => Some(stimulus.latest_off_ms()),
            DeviceSettings::Daq(_) => None,
        };
        match self.request(index, Command::Reconfigure(settings)) {
            Ok(Reply::Ack) => {
                if let Some(ms) = min_duration {
                    self.set_min_duration(ms);
                }
            }
            Ok(reply) => log::warn!("{} rejected new settings ({:?})", id, reply),
            Err(_) => {}
        }
    }

    /// Timestamped run name, `HH-MM-SS_[name]`.
    pub fn run_file_name(name: &str) -> String {
        format!("{}_[{}]", chrono::Local::now().format("%H-%M-%S"), name)
    }

    #[tracing::instrument(skip(self))]
    pub fn run_experiment(&mut self, name: &str) {
        if self.active.is_some() {
            log::warn!("A run is already active; ignoring request for '{}'", name);
            return;
        }
        if self.enabled_indices().is_empty() {
            log::info!("No devices enabled; nothing to run");
            return;
        }
        if !self.check_connections() {
            self.emit(UiEvent::FailedInit(
                "Not all enabled devices are connected".into(),
            ));
            return;
        }
        let file_name = Self::run_file_name(name);
        if self.arm_run(&file_name).is_some() {
            self.release_run();
        }
    }

    /// Send `START` to every enabled device. On any refusal or missing
    /// acknowledgement the devices armed so far are stopped and `FAILED_INIT`
    /// is reported.
    #[tracing::instrument(skip(self))]
    pub fn arm_run(&mut self, file_name: &str) -> Option<RunId> {
        if self.active.is_some() {
            log::warn!("A run is already active");
            return None;
        }
        let run = RunId(self.next_run);
        self.next_run += 1;
        self.active = Some(ActiveRun {
            id: run,
            save_file_name: file_name.to_string(),
            released: false,
        });

        for i in self.enabled_indices() {
            let start = Command::Start {
                run,
                file_name: file_name.to_string(),
            };
            match self.request(i, start) {
                Ok(Reply::Ack) => self.devices[i].armed = true,
                outcome => {
                    let id = self.devices[i].id;
                    log::error!("{} did not arm for {}: {:?}", id, run, outcome);
                    self.abort_armed();
                    self.emit(UiEvent::FailedInit(format!("{id} failed to arm")));
                    return None;
                }
            }
        }
        Some(run)
    }

    fn abort_armed(&mut self) {
        for i in 0..self.devices.len() {
            if self.devices[i].armed {
                let _ = self.request(i, Command::Stop);
                self.devices[i].armed = false;
            }
        }
        self.barrier.clear();
        self.active = None;
    }

    /// The single barrier release of the run.
    #[tracing::instrument(skip(self))]
    pub fn release_run(&mut self) {
        let Some(active) = self.active.as_mut().filter(|a| !a.released) else {
            log::warn!("No armed run to release");
            return;
        };
        active.released = true;
        let (run, save_file_name) = (active.id, active.save_file_name.clone());

        self.barrier.release();
        for d in self.devices.iter_mut().filter(|d| d.armed) {
            d.armed = false;
            d.running = true;
        }
        log::info!("{} released: {}", run, save_file_name);
        self.emit(UiEvent::Started {
            run,
            save_file_name,
        });
        // Every device may have failed while arming
        self.check_completion();
    }

    /// Stop the active run right away, without waiting for devices to wind
    /// down. Does nothing when no run is active.
    #[tracing::instrument(skip(self))]
    pub fn hardstop(&mut self) {
        let Some(active) = self.active.take() else {
            log::debug!("Hardstop with no active run");
            return;
        };
        for i in 0..self.devices.len() {
            let d = &self.devices[i];
            if d.armed || d.running {
                let _ = self.request(i, Command::Stop);
                let d = &mut self.devices[i];
                d.armed = false;
                d.running = false;
            }
        }
        self.barrier.clear();
        log::info!("{} terminated", active.id);
        self.emit(UiEvent::Finished(RunOutcome::Terminated));
    }

    fn check_completion(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if !active.released || self.devices.iter().any(|d| d.enabled && d.running) {
            return;
        }
        log::info!("{} complete", active.id);
        self.active = None;
        self.barrier.clear();
        self.emit(UiEvent::Finished(RunOutcome::Completed));
    }

    pub fn handle_notification(&mut self, note: Notification) {
        let Notification { device, event } = note;
        match event {
            DeviceEvent::Received => self.emit(UiEvent::Configured(device)),
            DeviceEvent::Started { run } => log::debug!("{} started {}", device, run),
            DeviceEvent::Finished { run, outcome } => {
                if self.active.as_ref().map(|a| a.id) != Some(run) {
                    log::debug!("Ignoring {:?} of stale {} from {}", outcome, run, device);
                    return;
                }
                if let Some(d) = self.device_mut(device) {
                    d.running = false;
                }
                self.check_completion();
            }
            DeviceEvent::Error { index } => {
                log::error!("{} reported an error (index {})", device, index);
                if let Some(d) = self.device_mut(device) {
                    d.enabled = false;
                    d.failed = true;
                    d.armed = false;
                    d.running = false;
                }
                self.emit(UiEvent::DeviceError(device));
                self.check_completion();
            }
        }
    }

    /// Process every notification already queued, waiting up to `timeout`
    /// for the first one.
    pub fn pump_events(&mut self, timeout: Duration) {
        if let Ok(note) = self.events.recv_timeout(timeout) {
            self.handle_notification(note);
            while let Ok(note) = self.events.try_recv() {
                self.handle_notification(note);
            }
        }
    }

    /// `EXIT` to every device, then tell the UI it may tear down.
    #[tracing::instrument(skip(self))]
    pub fn close_devices(&mut self) {
        for i in 0..self.devices.len() {
            let _ = self.request(i, Command::Exit);
        }
        // Wake any worker still parked on the barrier
        self.barrier.clear();
        self.active = None;
        self.emit(UiEvent::Exit);
    }

    /// Returns `false` once the coordinator should shut down.
    pub fn handle_command(&mut self, command: UserCommand) -> bool {
        match command {
            UserCommand::RunExperiment(name) => self.run_experiment(&name),
            UserCommand::Hardstop => self.hardstop(),
            UserCommand::SetTime(ms) => self.set_duration(ms),
            UserCommand::SetDir(dir) => self.set_save_dir(dir),
            UserCommand::SetEnabled { device, enabled } => self.set_enabled(device, enabled),
            UserCommand::Reconfigure { device, settings } => self.reconfigure(device, settings),
            UserCommand::Exit => {
                self.close_devices();
                return false;
            }
        }
        true
    }

    /// Serve user commands and worker notifications until `EXIT` or until the
    /// command sender is dropped.
    pub fn run(mut self, commands: &Receiver<UserCommand>) {
        let events = self.events.clone();
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    Err(_) => {
                        self.close_devices();
                        break;
                    }
                },
                recv(events) -> note => {
                    if let Ok(note) = note {
                        self.handle_notification(note);
                    }
                },
                default(EVENT_POLL) => {}
            }
        }
        log::debug!("Coordinator stopped");
    }
}
