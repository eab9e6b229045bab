use std::fmt;
use std::path::PathBuf;

use crate::config::DeviceSettings;

/// The hardware families the coordinator knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Camera,
    Daq,
    Microcontroller,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Daq => "daq",
            DeviceKind::Microcontroller => "microcontroller",
        }
    }
}

/// A device as seen by the coordinator: its family plus its position among
/// devices of the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub index: usize,
}

impl DeviceId {
    pub fn new(kind: DeviceKind, index: usize) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.as_str(), self.index)
    }
}

/// Identifies one experiment run. Monotonic within a coordinator's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Synchronous commands sent from the coordinator to a single device.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CheckConn,
    Start { run: RunId, file_name: String },
    Stop,
    SetTime(u32),
    SetDir(PathBuf),
    Reconfigure(DeviceSettings),
    Exit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CheckConn => "CHECK_CONN",
            Command::Start { .. } => "START",
            Command::Stop => "STOP",
            Command::SetTime(_) => "SET_TIME",
            Command::SetDir(_) => "SET_DIR",
            Command::Reconfigure(_) => "RECONFIGURE",
            Command::Exit => "EXIT",
        }
    }
}

/// The acknowledgement a device sends back on its control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The command was processed. For `Start` this means "armed".
    Ack,
    /// Answer to `CheckConn`.
    Connected(bool),
    /// The device cannot act on the command in its current state.
    Refused,
}

/// How an acquisition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The configured duration elapsed.
    Completed,
    /// A user hard-stop cut the run short.
    Terminated,
}

/// Asynchronous notifications a device posts on the shared event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Received,
    Started { run: RunId },
    Finished { run: RunId, outcome: RunOutcome },
    Error { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub device: DeviceId,
    pub event: DeviceEvent,
}

impl Notification {
    pub fn new(device: DeviceId, event: DeviceEvent) -> Self {
        Self { device, event }
    }

    pub fn error(device: DeviceId) -> Self {
        Self::new(
            device,
            DeviceEvent::Error {
                index: device.index,
            },
        )
    }
}

/// Intents coming from the user interface.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    RunExperiment(String),
    Hardstop,
    SetTime(u32),
    SetDir(PathBuf),
    SetEnabled { device: DeviceId, enabled: bool },
    Reconfigure { device: DeviceId, settings: DeviceSettings },
    Exit,
}

/// What the coordinator reports back to the user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Started { run: RunId, save_file_name: String },
    Finished(RunOutcome),
    FailedInit(String),
    DeviceError(DeviceId),
    Configured(DeviceId),
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::new(DeviceKind::Camera, 2).to_string(), "camera#2");
        assert_eq!(DeviceId::new(DeviceKind::Daq, 0).to_string(), "daq#0");
    }

    #[test]
    fn test_error_notification_carries_index() {
        let device = DeviceId::new(DeviceKind::Camera, 3);
        let note = Notification::error(device);
        assert_eq!(note.event, DeviceEvent::Error { index: 3 });
    }
}
