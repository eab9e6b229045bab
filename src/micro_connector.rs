use std::time::Duration;

use serialport::{SerialPort, SerialPortType};

use crate::serial_link::{LinkError, SerialLink, Transport};

/// The microcontroller resets when the port opens and greets once it booted.
pub const READY_TIMEOUT: Duration = Duration::from_millis(3500);

#[derive(Debug, Clone)]
pub struct SerialDevice {
    pub name: String,
    pub port: String,
}

impl SerialDevice {
    pub fn new(name: String, port: String) -> Self {
        Self { name, port }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Serial link error: {0}")]
    Link(#[from] LinkError),

    #[error("Could not enumerate serial ports: {0}")]
    Enumerate(#[from] serialport::Error),

    #[error("No microcontroller answered on any of {tried:?}")]
    DeviceNotFound { tried: Vec<String> },
}

/// Finds the port the stimulus microcontroller is attached to.
pub struct MicroConnector;

impl MicroConnector {
    /// Connect, trying `last_port` before sweeping every enumerated port.
    /// Returns the link together with the port that answered.
    pub fn connect(
        last_port: Option<&str>,
        baud_rate: u32,
    ) -> Result<(SerialLink, String), ConnectorError> {
        let available = Self::get_available_devices()?
            .into_iter()
            .map(|d| d.port)
            .collect();
        let candidates = Self::candidate_ports(last_port, available);
        Self::connect_with(&candidates, READY_TIMEOUT, |port| {
            SerialLink::open(port, baud_rate)
        })
    }

    /// Every enumerated serial port, labelled with its USB product if known.
    pub fn get_available_devices() -> Result<Vec<SerialDevice>, ConnectorError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let name = match &p.port_type {
                    SerialPortType::UsbPort(usb) => usb
                        .product
                        .clone()
                        .unwrap_or_else(|| format!("{:04x}:{:04x}", usb.vid, usb.pid)),
                    SerialPortType::BluetoothPort => "bluetooth".to_string(),
                    SerialPortType::PciPort => "pci".to_string(),
                    SerialPortType::Unknown => "unknown".to_string(),
                };
                SerialDevice::new(name, p.port_name)
            })
            .collect())
    }

    /// The last known good port first, then everything else once.
    pub fn candidate_ports(last_port: Option<&str>, available: Vec<String>) -> Vec<String> {
        let mut candidates: Vec<String> = last_port.map(str::to_string).into_iter().collect();
        for port in available {
            if !candidates.contains(&port) {
                candidates.push(port);
            }
        }
        candidates
    }

    /// Open each candidate in turn and keep the first that greets in time.
    pub fn connect_with<T, F>(
        candidates: &[String],
        ready_timeout: Duration,
        mut open: F,
    ) -> Result<(SerialLink<T>, String), ConnectorError>
    where
        T: Transport,
        F: FnMut(&str) -> Result<SerialLink<T>, LinkError>,
    {
        for port in candidates {
            log::debug!("Trying microcontroller on {}", port);
            let mut link = match open(port) {
                Ok(link) => link,
                Err(e) => {
                    log::debug!("Could not open {}: {}", port, e);
                    continue;
                }
            };
            match link.wait_ready(ready_timeout) {
                Ok(()) => {
                    log::info!("Microcontroller ready on {}", port);
                    return Ok((link, port.clone()));
                }
                Err(e) => log::debug!("{} did not answer: {}", port, e),
            }
        }
        Err(ConnectorError::DeviceNotFound {
            tried: candidates.to_vec(),
        })
    }
}

/// Reopen a specific port; used to reset the device between runs.
pub fn reopen(port: &str, baud_rate: u32) -> Result<SerialLink<Box<dyn SerialPort>>, ConnectorError> {
    let mut link = SerialLink::open(port, baud_rate)?;
    link.wait_ready(READY_TIMEOUT)?;
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_link::tests::MemoryPort;

    #[test]
    fn test_last_port_is_tried_first() {
        let candidates = MicroConnector::candidate_ports(
            Some("/dev/ttyACM1"),
            vec!["/dev/ttyACM0".into(), "/dev/ttyACM1".into(), "/dev/ttyUSB0".into()],
        );
        assert_eq!(
            candidates,
            vec!["/dev/ttyACM1", "/dev/ttyACM0", "/dev/ttyUSB0"]
        );
    }

    #[test]
    fn test_sweep_stops_at_first_ready_port() {
        let candidates: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let mut opened = Vec::new();
        let (_, port) = MicroConnector::connect_with(&candidates, Duration::from_millis(20), |p| {
            opened.push(p.to_string());
            let script: &[u8] = match p {
                "a" => b"",
                "b" => b"<ready>",
                _ => b"<ready>",
            };
            SerialLink::new(MemoryPort::scripted(script))
        })
        .unwrap();
        assert_eq!(port, "b");
        assert_eq!(opened, vec!["a", "b"]);
    }

    #[test]
    fn test_no_device_found() {
        let candidates: Vec<String> = vec!["a".into()];
        let err = MicroConnector::connect_with(&candidates, Duration::from_millis(10), |_| {
            SerialLink::new(MemoryPort::scripted(b"<busy>"))
        })
        .unwrap_err();
        assert!(matches!(err, ConnectorError::DeviceNotFound { tried } if tried == ["a"]));
    }

    #[test]
    fn test_get_available_devices() {
        // Depends on the host; only checks that enumeration yields sane entries
        if let Ok(devices) = MicroConnector::get_available_devices() {
            for device in devices {
                assert!(!device.port.is_empty());
            }
        }
    }
}
