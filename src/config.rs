use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::camera::CameraFamily;
use crate::stimulus::{StimulusConfig, StimulusError};

/// Acknowledgements are awaited for this long, bounded to the 2-3 s window.
const MIN_ACK_TIMEOUT_MS: u64 = 2000;
const MAX_ACK_TIMEOUT_MS: u64 = 3000;

/// The U6 exposes 14 analog inputs.
const MAX_DAQ_CHANNELS: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("DAQ needs between 1 and {max} distinct channels, got {got:?}")]
    DaqChannels { got: Vec<u8>, max: usize },

    #[error("DAQ scan frequency must be positive")]
    ScanFrequency,

    #[error("Display dimensions must be non-zero")]
    DisplayShape,

    #[error("Stimulus configuration invalid: {0}")]
    Stimulus(#[from] StimulusError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub family: CameraFamily,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaqSettings {
    pub channels: Vec<u8>,
    pub scan_freq: u32,
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            channels: vec![8, 12, 13],
            scan_freq: 6250,
        }
    }
}

impl DaqSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut unique = self.channels.clone();
        unique.sort_unstable();
        unique.dedup();
        if self.channels.is_empty()
            || self.channels.len() > MAX_DAQ_CHANNELS
            || unique.len() != self.channels.len()
        {
            return Err(ConfigError::DaqChannels {
                got: self.channels.clone(),
                max: MAX_DAQ_CHANNELS,
            });
        }
        if self.scan_freq == 0 {
            return Err(ConfigError::ScanFrequency);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroSettings {
    pub last_port: Option<String>,
    pub baud_rate: u32,
    pub stimulus: StimulusConfig,
}

impl Default for MicroSettings {
    fn default() -> Self {
        Self {
            last_port: None,
            baud_rate: 115_200,
            stimulus: StimulusConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub frame_width: usize,
    pub frame_height: usize,
    pub trace_len: usize,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            frame_width: 320,
            frame_height: 240,
            trace_len: 1200,
        }
    }
}

/// Per-device settings that can be pushed to a running worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceSettings {
    Daq(DaqSettings),
    Stimulus(StimulusConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub save_dir: PathBuf,
    pub total_duration_ms: u32,
    pub ack_timeout_ms: u64,
    pub cameras: Vec<CameraSettings>,
    pub daq: Option<DaqSettings>,
    pub microcontroller: Option<MicroSettings>,
    pub display: DisplaySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("mouse_house_saves"),
            total_duration_ms: 20_000,
            ack_timeout_ms: MAX_ACK_TIMEOUT_MS,
            cameras: Vec::new(),
            daq: Some(DaqSettings::default()),
            microcontroller: Some(MicroSettings::default()),
            display: DisplaySettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded settings from {}", path.as_ref().display());
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(daq) = &self.daq {
            daq.validate()?;
        }
        if let Some(micro) = &self.microcontroller {
            micro.stimulus.validate()?;
        }
        if self.display.frame_width == 0
            || self.display.frame_height == 0
            || self.display.trace_len == 0
        {
            return Err(ConfigError::DisplayShape);
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(
            self.ack_timeout_ms
                .clamp(MIN_ACK_TIMEOUT_MS, MAX_ACK_TIMEOUT_MS),
        )
    }

    /// The run duration, enlarged to cover every configured stimulus segment.
    pub fn effective_duration_ms(&self) -> u32 {
        self.microcontroller
            .as_ref()
            .map_or(self.total_duration_ms, |m| {
                self.total_duration_ms.max(m.stimulus.latest_off_ms())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::{SegmentKind, StimulusSegment};

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.daq.as_ref().unwrap().scan_freq, 6250);
        assert_eq!(settings.ack_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            save_dir = "/tmp/runs"
            total_duration_ms = 180000
            ack_timeout_ms = 500

            [[cameras]]
            family = "FireFly"
            id = 0

            [daq]
            channels = [0, 1, 2, 10, 11]
            scan_freq = 6250

            [microcontroller]
            last_port = "/dev/ttyACM0"

            [[microcontroller.stimulus.segments]]
            on_ms = 120000
            off_ms = 150000
            pin = 10
            kind = { Tone = { freq_hz = 2800 } }
        "#;
        let settings = Settings::from_toml_str(text).unwrap();
        assert_eq!(settings.ack_timeout(), Duration::from_secs(2));
        assert_eq!(settings.cameras.len(), 1);
        assert_eq!(settings.cameras[0].family, CameraFamily::FireFly);
        assert_eq!(settings.daq.unwrap().channels, vec![0, 1, 2, 10, 11]);
        let micro = settings.microcontroller.unwrap();
        assert_eq!(micro.last_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(micro.baud_rate, 115_200);
        assert_eq!(micro.stimulus.segments.len(), 1);
    }

    #[test]
    fn test_ack_timeout_clamped() {
        let settings = Settings {
            ack_timeout_ms: 500,
            ..Settings::default()
        };
        assert_eq!(settings.ack_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_duplicate_channels() {
        let daq = DaqSettings {
            channels: vec![1, 1],
            scan_freq: 100,
        };
        assert!(matches!(daq.validate(), Err(ConfigError::DaqChannels { .. })));
    }

    #[test]
    fn test_duration_covers_segments() {
        let mut settings = Settings::default();
        settings.total_duration_ms = 1000;
        if let Some(micro) = settings.microcontroller.as_mut() {
            micro.stimulus.segments.push(StimulusSegment {
                on_ms: 500,
                off_ms: 4000,
                pin: 3,
                kind: SegmentKind::Output,
            });
        }
        assert_eq!(settings.effective_duration_ms(), 4000);
    }
}
