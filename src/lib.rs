//! # Mouse House
//!
//! Synchronised acquisition for behavioural experiments: any number of
//! cameras, a streaming DAQ and a stimulus microcontroller start together,
//! record for a fixed duration and stop together.
//!
//! Every device runs as a worker thread group talking to one [`Coordinator`]
//! over a sequenced request/acknowledge channel. Arming happens per device;
//! the actual start is a single release of a shared [`StartBarrier`].
//!
//! ## Features
//!
//! - **Coordinated runs**: `CHECK_CONN` gate, per-device arming, one release, one `FINISHED`
//! - **Hard stop**: terminates a run at any point, including before release
//! - **Fault isolation**: a failing device is reported once and dropped from later runs
//! - **Stimulus upload**: tone, digital output and PWM schedules over a stop-and-wait serial protocol
//! - **DAQ streaming**: pre-roll and post-roll around the experiment, CSV output and a run summary via `polars`
//! - **Live display**: lossy single-slot buffers that never block acquisition
//!
//! ## Example
//!
//! ```rust,no_run
//! use mouse_house::sim::{SyntheticCamera, SyntheticDaq};
//! use mouse_house::{Hardware, PortOpener, Session, Settings};
//! use std::time::Duration;
//!
//! let settings = Settings::load("mouse_house.toml")?;
//! let micro = settings.microcontroller.as_ref().map(|m| PortOpener::new(m.last_port.clone(), m.baud_rate));
//! let hardware = Hardware {
//!     cameras: settings.cameras.iter().map(|_| SyntheticCamera::new(640, 480)).collect(),
//!     daq: Some(SyntheticDaq::new()),
//!     microcontroller: micro,
//! };
//! let session = Session::start(&settings, hardware)?;
//! session.run_experiment("mouse_12");
//! if let Some((outcome, _)) = session.wait_for_finish(Duration::from_secs(60)) {
//!     println!("Run ended: {:?}", outcome);
//! }
//! session.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Opens a tracy zone for the rest of the enclosing block.
#[cfg(feature = "cpu-profiling")]
macro_rules! profile_scope {
    ($name:literal) => {
        let _profile_span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!($name), 0));
    };
}

#[cfg(not(feature = "cpu-profiling"))]
macro_rules! profile_scope {
    ($name:literal) => {};
}

pub(crate) use profile_scope;

pub mod barrier;
pub mod camera;
pub mod config;
pub mod control_channel;
pub mod coordinator;
pub mod daq;
pub mod daq_stream;
pub mod display;
pub mod message;
pub mod micro_connector;
pub mod microcontroller;
pub mod serial_link;
pub mod session;
pub mod sim;
pub mod stimulus;
pub mod worker;

pub use barrier::StartBarrier;
pub use camera::{CameraBackend, CameraDriver, CameraError, CameraFamily};
pub use config::{ConfigError, DeviceSettings, Settings};
pub use coordinator::Coordinator;
pub use daq::{DaqBackend, DaqDriver, DaqError};
pub use display::SharedBuffer;
pub use message::{DeviceId, DeviceKind, RunId, RunOutcome, UiEvent, UserCommand};
pub use micro_connector::{ConnectorError, MicroConnector, SerialDevice};
pub use microcontroller::{MicroDriver, MicroError, PortOpener};
pub use session::{Displays, Hardware, Session, SessionError};
pub use stimulus::{StimulusConfig, StimulusSegment};
pub use worker::{DeviceDriver, Presenter};
