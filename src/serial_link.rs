use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::stimulus::WireFrame;

pub const START_MARKER: u8 = b'<';
pub const END_MARKER: u8 = b'>';
pub const READY_MESSAGE: &str = "ready";
pub const NEXT_PACKET_MESSAGE: &str = "M";
pub const START_BYTE: u8 = 0x01;

/// Pause after a read that returned nothing.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: Expected '<{expected}>' but got '{actual}'")]
    Timeout { expected: String, actual: String },

    #[error("Unexpected message '<{actual}>' while waiting for '<{expected}>'")]
    Unexpected { expected: String, actual: String },

    #[error("Malformed run report '{0}'")]
    Report(String),
}

/// Byte transport underneath a [`SerialLink`]. Reads are expected to time
/// out quickly so callers can enforce their own deadlines.
pub trait Transport: Read + Write + Send {
    fn discard_input(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}

impl Transport for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> Result<(), LinkError> {
        self.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }
}

/// Timing the microcontroller reports once its schedule has played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub total_ms: u32,
    pub start_ms: u32,
    pub end_ms: u32,
}

impl RunReport {
    fn parse(text: &str) -> Result<Self, LinkError> {
        let fields: Vec<u32> = text
            .split(',')
            .map(|f| f.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| LinkError::Report(text.to_string()))?;
        match fields.as_slice() {
            &[total_ms, start_ms, end_ms] => Ok(Self {
                total_ms,
                start_ms,
                end_ms,
            }),
            _ => Err(LinkError::Report(text.to_string())),
        }
    }
}

/// Marker-framed link to the stimulus microcontroller.
///
/// Messages from the device are ASCII enclosed in `<` and `>`. Host-to-device
/// frames are raw struct-packed bytes, each sent only after the device asked
/// for the next packet.
#[derive(Debug)]
pub struct SerialLink<T: Transport = Box<dyn SerialPort>> {
    transport: T,
}

impl SerialLink<Box<dyn SerialPort>> {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;
        Self::new(serial)
    }
}

impl<T: Transport> SerialLink<T> {
    pub fn new(transport: T) -> Result<Self, LinkError> {
        let mut link = Self { transport };
        link.transport.discard_input()?;
        Ok(link)
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Wait for the greeting the device sends after reset.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), LinkError> {
        log::debug!("Waiting up to {:?} for <{}>", timeout, READY_MESSAGE);
        self.expect_message(READY_MESSAGE, timeout)
    }

    /// Stop-and-wait: block for the device's request, then write one frame.
    pub fn send_frame(&mut self, frame: &WireFrame, timeout: Duration) -> Result<(), LinkError> {
        self.expect_message(NEXT_PACKET_MESSAGE, timeout)?;
        let bytes = frame.encode();
        log::debug!("Sending {} frame ({} bytes)", frame.kind(), bytes.len());
        self.transport.write_all(&bytes)?;
        self.transport.flush()?;
        Ok(())
    }

    pub fn send_start(&mut self) -> Result<(), LinkError> {
        self.transport.write_all(&[START_BYTE])?;
        self.transport.flush()?;
        Ok(())
    }

    pub fn read_report(&mut self, timeout: Duration) -> Result<RunReport, LinkError> {
        let text = self.read_message("run report", timeout)?;
        RunReport::parse(&text)
    }

    fn expect_message(&mut self, expected: &str, timeout: Duration) -> Result<(), LinkError> {
        let actual = self.read_message(expected, timeout)?;
        if actual == expected {
            Ok(())
        } else {
            Err(LinkError::Unexpected {
                expected: expected.to_string(),
                actual,
            })
        }
    }

    /// Read one `<...>` message. Bytes before the start marker are skipped.
    pub fn read_message(&mut self, expected: &str, timeout: Duration) -> Result<String, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut body = Vec::new();
        let mut in_message = false;

        loop {
            let mut byte = [0u8; 1];
            match self.transport.read(&mut byte) {
                Ok(1) => match byte[0] {
                    START_MARKER => {
                        in_message = true;
                        body.clear();
                    }
                    END_MARKER if in_message => {
                        return Ok(String::from_utf8_lossy(&body).into_owned());
                    }
                    b if in_message => body.push(b),
                    _ => {}
                },
                Ok(_) => thread::sleep(IDLE_BACKOFF),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    thread::sleep(IDLE_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(LinkError::Timeout {
                    expected: expected.to_string(),
                    actual: String::from_utf8_lossy(&body).into_owned(),
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory stand-in for a serial port: scripted input, captured output.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemoryPort {
        pub incoming: Arc<Mutex<VecDeque<u8>>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub reads: Arc<AtomicUsize>,
    }

    impl MemoryPort {
        pub fn scripted(input: &[u8]) -> Self {
            let port = Self::default();
            port.incoming.lock().extend(input);
            port
        }
    }

    impl Read for MemoryPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let mut incoming = self.incoming.lock();
            if incoming.is_empty() {
                return Err(ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = incoming.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for MemoryPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MemoryPort {}

    #[test]
    fn test_wait_ready_skips_noise() {
        let port = MemoryPort::scripted(b"\x00garbage<ready>");
        let mut link = SerialLink::new(port).unwrap();
        link.wait_ready(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_wait_ready_timeout() {
        let port = MemoryPort::scripted(b"<rea");
        let mut link = SerialLink::new(port).unwrap();
        let err = link.wait_ready(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LinkError::Timeout { actual, .. } if actual == "rea"));
    }

    #[test]
    fn test_silent_port_is_polled_gently() {
        let port = MemoryPort::default();
        let reads = port.reads.clone();
        let mut link = SerialLink::new(port).unwrap();
        assert!(link.wait_ready(Duration::from_millis(50)).is_err());
        let polls = reads.load(Ordering::Relaxed);
        assert!(polls > 0 && polls <= 60, "{polls} reads in 50 ms");
    }

    #[test]
    fn test_send_frame_waits_for_request() {
        let port = MemoryPort::scripted(b"<M>");
        let written = port.written.clone();
        let mut link = SerialLink::new(port).unwrap();

        link.send_frame(&WireFrame::SystemTime(0x0403_0201), Duration::from_millis(100))
            .unwrap();
        assert_eq!(*written.lock(), vec![1, 2, 3, 4]);

        // Without another request the next frame is never written
        assert!(link
            .send_frame(&WireFrame::SystemTime(5), Duration::from_millis(20))
            .is_err());
        assert_eq!(written.lock().len(), 4);
    }

    #[test]
    fn test_unexpected_message() {
        let port = MemoryPort::scripted(b"<oops>");
        let mut link = SerialLink::new(port).unwrap();
        let err = link.wait_ready(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, LinkError::Unexpected { .. }));
    }

    #[test]
    fn test_read_report() {
        let port = MemoryPort::scripted(b"<180000,12,180013>");
        let mut link = SerialLink::new(port).unwrap();
        let report = link.read_report(Duration::from_millis(100)).unwrap();
        assert_eq!(
            report,
            RunReport {
                total_ms: 180_000,
                start_ms: 12,
                end_ms: 180_013
            }
        );

        assert!(matches!(
            RunReport::parse("1,2"),
            Err(LinkError::Report(_))
        ));
    }
}
