//! Stream parameters for the DAQ and the bookkeeping of a recorded run.
//!
//! The device returns data in packets of up to 25 samples and is read in
//! requests of several packets. Every request must hold whole scans, so
//! `samples_per_packet * packets_per_request` has to be a multiple of the
//! channel count.

use std::time::Duration;

pub const MAX_SAMPLES_PER_PACKET: u32 = 25;
pub const MAX_PACKETS_PER_REQUEST: u32 = 48;
/// Seven channels do not fit evenly in 48 packets of 25.
pub const MAX_PACKETS_PER_REQUEST_7CH: u32 = 42;
pub const MAX_CHANNELS: usize = 14;

const FAST_CLOCK_HZ: u32 = 4_000_000;
const SLOW_CLOCK_HZ: u32 = 15_625;

/// Pre- and post-roll recorded around the experiment.
pub const ROLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamConfigError {
    #[error("Stream needs between 1 and {max} channels, got {got}", max = MAX_CHANNELS)]
    Channels { got: usize },

    #[error("Scan frequency must be positive")]
    ZeroFrequency,

    #[error("{freq} Hz is too slow to fit one scan of {n_channels} channels in a packet")]
    TooSlow { freq: u32, n_channels: usize },
}

/// Derived stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub scan_freq: u32,
    pub n_channels: usize,
    pub samples_per_packet: u32,
    pub packets_per_request: u32,
    pub scan_interval: u16,
    pub divide_clock_by_256: bool,
}

impl StreamConfig {
    pub fn derive(scan_freq: u32, n_channels: usize) -> Result<Self, StreamConfigError> {
        if n_channels == 0 || n_channels > MAX_CHANNELS {
            return Err(StreamConfigError::Channels { got: n_channels });
        }
        if scan_freq == 0 {
            return Err(StreamConfigError::ZeroFrequency);
        }
        let n = n_channels as u32;

        let (samples_per_packet, packets_per_request) = if scan_freq < MAX_SAMPLES_PER_PACKET {
            // Slow streams: one short packet per request holding whole scans
            let spp = (scan_freq / n) * n;
            if spp == 0 {
                return Err(StreamConfigError::TooSlow {
                    freq: scan_freq,
                    n_channels,
                });
            }
            (spp, 1)
        } else {
            (
                MAX_SAMPLES_PER_PACKET,
                Self::find_packets_per_request(scan_freq, n),
            )
        };

        let (divide_clock_by_256, interval) = if scan_freq < 1000 {
            (true, SLOW_CLOCK_HZ / scan_freq)
        } else {
            (false, FAST_CLOCK_HZ / scan_freq)
        };
        let scan_interval = interval.clamp(1, u32::from(u16::MAX)) as u16;

        log::debug!(
            "Stream {} Hz x {} ch: {} samples/packet, {} packets/request, interval {}{}",
            scan_freq,
            n_channels,
            samples_per_packet,
            packets_per_request,
            scan_interval,
            if divide_clock_by_256 { " (clock/256)" } else { "" }
        );

        Ok(Self {
            scan_freq,
            n_channels,
            samples_per_packet,
            packets_per_request,
            scan_interval,
            divide_clock_by_256,
        })
    }

    /// Largest packet count within the device limit and roughly one second
    /// of data that keeps requests aligned to whole scans.
    fn find_packets_per_request(scan_freq: u32, n: u32) -> u32 {
        let high = if n == 7 {
            MAX_PACKETS_PER_REQUEST_7CH
        } else {
            MAX_PACKETS_PER_REQUEST
        };
        let aligned = |p: &u32| (p * MAX_SAMPLES_PER_PACKET) % n == 0;
        let cap = (scan_freq / MAX_SAMPLES_PER_PACKET).clamp(1, high);
        (1..=cap)
            .rev()
            .find(aligned)
            .or_else(|| (cap..=high).find(aligned))
            // n <= 14 always divides some p <= 42
            .unwrap_or(cap)
    }

    pub fn samples_per_request(&self) -> u32 {
        self.samples_per_packet * self.packets_per_request
    }

    /// Requests needed to cover `span` of streaming, rounded up.
    pub fn requests_for(&self, span: Duration) -> u64 {
        let samples = f64::from(self.scan_freq) * self.n_channels as f64 * span.as_secs_f64();
        (samples / f64::from(self.samples_per_request())).ceil() as u64
    }

    /// The scan rate the device will actually run at after integer division.
    pub fn actual_scan_freq(&self) -> f64 {
        let clock = if self.divide_clock_by_256 {
            SLOW_CLOCK_HZ
        } else {
            FAST_CLOCK_HZ
        };
        f64::from(clock) / f64::from(self.scan_interval)
    }

    /// The `StreamConfig` command for a U6, including checksums.
    pub fn command_packet(&self, channels: &[u8]) -> Vec<u8> {
        let n = channels.len();
        let mut command = vec![0u8; 14 + n * 2];
        command[1] = 0xF8;
        command[2] = (n + 4) as u8;
        command[3] = 0x11;
        command[6] = n as u8;
        // Resolution index and settling factor stay at 0
        command[8] = self.samples_per_packet as u8;
        if self.divide_clock_by_256 {
            command[11] |= 1 << 1;
        }
        command[12..14].copy_from_slice(&self.scan_interval.to_le_bytes());
        for (i, ch) in channels.iter().enumerate() {
            command[14 + i * 2] = *ch;
        }

        let sum16: u32 = command[6..].iter().map(|&b| u32::from(b)).sum();
        command[4] = (sum16 & 0xFF) as u8;
        command[5] = ((sum16 >> 8) & 0xFF) as u8;

        let mut sum8: u32 = command[1..6].iter().map(|&b| u32::from(b)).sum();
        sum8 = (sum8 & 0xFF) + (sum8 >> 8);
        sum8 = (sum8 & 0xFF) + (sum8 >> 8);
        command[0] = sum8 as u8;
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Before,
    During,
    After,
}

/// Request counts for the three recording segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPlan {
    pub pre_roll: u64,
    pub experiment: u64,
    pub post_roll: u64,
}

impl RequestPlan {
    pub fn new(config: &StreamConfig, duration_ms: u32) -> Self {
        let roll = config.requests_for(ROLL);
        Self {
            pre_roll: roll,
            experiment: config.requests_for(Duration::from_millis(u64::from(duration_ms))),
            post_roll: roll,
        }
    }

    pub fn total(&self) -> u64 {
        self.pre_roll + self.experiment + self.post_roll
    }

    /// Segment the `index`-th request (0-based) belongs to, `None` past the end.
    pub fn segment_of(&self, index: u64) -> Option<Segment> {
        if index < self.pre_roll {
            Some(Segment::Before)
        } else if index < self.pre_roll + self.experiment {
            Some(Segment::During)
        } else if index < self.total() {
            Some(Segment::After)
        } else {
            None
        }
    }
}

/// Missed samples reported by one read, stamped relative to stream start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissedSamples {
    pub at: Duration,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerSegment<T> {
    pub before: T,
    pub during: T,
    pub after: T,
}

impl<T: Copy + std::ops::Add<Output = T>> PerSegment<T> {
    pub fn total(&self) -> T {
        self.before + self.during + self.after
    }
}

impl<T> PerSegment<T> {
    pub fn get_mut(&mut self, segment: Segment) -> &mut T {
        match segment {
            Segment::Before => &mut self.before,
            Segment::During => &mut self.during,
            Segment::After => &mut self.after,
        }
    }
}

/// Everything measured during one recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLedger {
    /// Wall time spent in each segment.
    pub durations: PerSegment<Duration>,
    pub requests: PerSegment<u64>,
    pub missed: Vec<MissedSamples>,
}

impl RunLedger {
    /// Attribute every missed-sample report to the segment it fell in by
    /// comparing its timestamp to the segment boundaries. Reports after the
    /// post-roll are dropped.
    pub fn reconcile_missed(&self) -> PerSegment<u64> {
        let before_end = self.durations.before;
        let during_end = before_end + self.durations.during;
        let after_end = during_end + self.durations.after;

        let mut buckets = PerSegment::<u64>::default();
        for m in &self.missed {
            let segment = if m.at <= before_end {
                Segment::Before
            } else if m.at <= during_end {
                Segment::During
            } else if m.at <= after_end {
                Segment::After
            } else {
                continue;
            };
            *buckets.get_mut(segment) += u64::from(m.count);
        }
        buckets
    }

    pub fn summarize(&self, config: &StreamConfig) -> RunSummary {
        let per_request = u64::from(config.samples_per_request());
        let samples = PerSegment {
            before: self.requests.before * per_request,
            during: self.requests.during * per_request,
            after: self.requests.after * per_request,
        };
        let rate = |count: u64, span: Duration| {
            if span.is_zero() {
                0.0
            } else {
                count as f64 / span.as_secs_f64()
            }
        };
        let n = config.n_channels as f64;
        let exp_sample_freq = rate(samples.during, self.durations.during);
        let overall_sample_freq = rate(samples.total(), self.durations.total());
        RunSummary {
            durations: self.durations,
            samples,
            missed: self.reconcile_missed(),
            exp_sample_freq,
            overall_sample_freq,
            exp_scan_freq: exp_sample_freq / n,
            overall_scan_freq: overall_sample_freq / n,
        }
    }
}

/// Post-run report written next to the recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub durations: PerSegment<Duration>,
    pub samples: PerSegment<u64>,
    pub missed: PerSegment<u64>,
    pub exp_sample_freq: f64,
    pub overall_sample_freq: f64,
    pub exp_scan_freq: f64,
    pub overall_scan_freq: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_6250_hz_three_channels() {
        let config = StreamConfig::derive(6250, 3).unwrap();
        assert_eq!(config.samples_per_packet, 25);
        assert!(config.packets_per_request <= 48);
        assert_eq!(config.packets_per_request * 25 % 3, 0);
        assert_eq!(config.packets_per_request, 48);
        assert!(!config.divide_clock_by_256);
        assert_eq!(config.scan_interval, 640);
    }

    #[test]
    fn test_requests_hold_whole_scans() {
        for n in 1..=MAX_CHANNELS {
            for freq in [25, 30, 100, 999, 1000, 6250, 50_000] {
                let config = StreamConfig::derive(freq, n).unwrap();
                let high = if n == 7 { 42 } else { 48 };
                assert!(config.packets_per_request >= 1);
                assert!(config.packets_per_request <= high);
                assert_eq!(
                    config.samples_per_request() % n as u32,
                    0,
                    "{freq} Hz x {n} ch"
                );
            }
        }
    }

    #[test]
    fn test_seven_channels_cap() {
        let config = StreamConfig::derive(50_000, 7).unwrap();
        assert_eq!(config.packets_per_request, 42);
    }

    #[test]
    fn test_slow_stream() {
        let config = StreamConfig::derive(10, 3).unwrap();
        assert_eq!(config.samples_per_packet, 9);
        assert_eq!(config.packets_per_request, 1);
        assert!(config.divide_clock_by_256);
        assert_eq!(config.scan_interval, 1562);

        assert_eq!(
            StreamConfig::derive(2, 3),
            Err(StreamConfigError::TooSlow {
                freq: 2,
                n_channels: 3
            })
        );
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(
            StreamConfig::derive(100, 0),
            Err(StreamConfigError::Channels { got: 0 })
        );
        assert_eq!(
            StreamConfig::derive(0, 2),
            Err(StreamConfigError::ZeroFrequency)
        );
    }

    #[test]
    fn test_request_plan() {
        let config = StreamConfig::derive(6250, 3).unwrap();
        // 1200 samples per request; 0.5 s is 9375 samples
        let plan = RequestPlan::new(&config, 2000);
        assert_eq!(plan.pre_roll, 8);
        assert_eq!(plan.experiment, 32);
        assert_eq!(plan.post_roll, 8);
        assert_eq!(plan.segment_of(0), Some(Segment::Before));
        assert_eq!(plan.segment_of(8), Some(Segment::During));
        assert_eq!(plan.segment_of(40), Some(Segment::After));
        assert_eq!(plan.segment_of(48), None);
    }

    #[test]
    fn test_command_packet_layout() {
        let config = StreamConfig::derive(6250, 3).unwrap();
        let packet = config.command_packet(&[8, 12, 13]);
        assert_eq!(packet.len(), 20);
        assert_eq!(&packet[1..4], &[0xF8, 7, 0x11]);
        assert_eq!(packet[6], 3);
        assert_eq!(packet[8], 25);
        assert_eq!(u16::from_le_bytes([packet[12], packet[13]]), 640);
        assert_eq!(packet[14], 8);
        assert_eq!(packet[18], 13);
        let sum16: u32 = packet[6..].iter().map(|&b| u32::from(b)).sum();
        assert_eq!(u16::from_le_bytes([packet[4], packet[5]]) as u32, sum16);
    }

    #[test]
    fn test_missed_samples_are_bucketed_by_time() {
        let ledger = RunLedger {
            durations: PerSegment {
                before: Duration::from_millis(500),
                during: Duration::from_millis(2000),
                after: Duration::from_millis(500),
            },
            requests: PerSegment {
                before: 8,
                during: 32,
                after: 8,
            },
            missed: vec![
                MissedSamples {
                    at: Duration::from_millis(100),
                    count: 3,
                },
                MissedSamples {
                    at: Duration::from_millis(500),
                    count: 1,
                },
                MissedSamples {
                    at: Duration::from_millis(1500),
                    count: 10,
                },
                MissedSamples {
                    at: Duration::from_millis(2900),
                    count: 4,
                },
                MissedSamples {
                    at: Duration::from_millis(9000),
                    count: 100,
                },
            ],
        };
        let missed = ledger.reconcile_missed();
        assert_eq!(missed.before, 4);
        assert_eq!(missed.during, 10);
        assert_eq!(missed.after, 4);
        assert_eq!(missed.total(), 18);

        let config = StreamConfig::derive(6250, 3).unwrap();
        let summary = ledger.summarize(&config);
        assert_eq!(summary.samples.during, 32 * 1200);
        assert!((summary.exp_sample_freq - 19_200.0).abs() < 1e-6);
        assert!((summary.exp_scan_freq - 6_400.0).abs() < 1e-6);
    }
}
