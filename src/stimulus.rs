//! Stimulus segments and their struct-packed wire representation.
//!
//! A stimulus program is sent to the microcontroller as a fixed sequence of
//! little-endian frames: system clock, global packet, tone segments, output
//! toggle events, PWM segments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const TONE_PIN: u8 = 10;
pub const OUTPUT_PINS: [u8; 6] = [2, 3, 4, 5, 6, 7];
pub const PWM_PINS: [u8; 5] = [8, 9, 11, 12, 13];

pub const SYSTEM_TIME_LEN: usize = 4;
pub const GLOBAL_LEN: usize = 12;
pub const TONE_LEN: usize = 10;
pub const OUTPUT_LEN: usize = 5;
pub const PWM_LEN: usize = 25;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StimulusError {
    #[error("Pin {pin} cannot drive a {kind} segment")]
    InvalidPin { pin: u8, kind: &'static str },

    #[error("Segment on pin {pin} must switch on before it switches off ({on_ms} >= {off_ms})")]
    EmptyInterval { pin: u8, on_ms: u32, off_ms: u32 },

    #[error("Segments on pin {pin} overlap at {at_ms} ms")]
    Overlap { pin: u8, at_ms: u32 },

    #[error("Invalid {field} for segment on pin {pin}: {value}")]
    Parameter {
        pin: u8,
        field: &'static str,
        value: f64,
    },

    #[error("Too many {kind} frames for one program: {count}")]
    TooManyFrames { kind: &'static str, count: usize },

    #[error("{kind} frame must be {expected} bytes, got {got}")]
    FrameLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Output events on pin {pin} do not pair into on/off intervals")]
    UnpairedToggle { pin: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SegmentKind {
    Tone {
        freq_hz: u16,
    },
    Output,
    Pwm {
        freq_hz: f64,
        phase_shift_deg: f64,
        duty_cycle_pct: f64,
    },
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Tone { .. } => "tone",
            SegmentKind::Output => "output",
            SegmentKind::Pwm { .. } => "pwm",
        }
    }
}

/// One scheduled on/off interval on a single pin. Times are absolute
/// milliseconds from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StimulusSegment {
    pub on_ms: u32,
    pub off_ms: u32,
    pub pin: u8,
    pub kind: SegmentKind,
}

impl StimulusSegment {
    pub fn tone(on_ms: u32, off_ms: u32, freq_hz: u16) -> Self {
        Self {
            on_ms,
            off_ms,
            pin: TONE_PIN,
            kind: SegmentKind::Tone { freq_hz },
        }
    }

    pub fn output(on_ms: u32, off_ms: u32, pin: u8) -> Self {
        Self {
            on_ms,
            off_ms,
            pin,
            kind: SegmentKind::Output,
        }
    }

    pub fn pwm(
        on_ms: u32,
        off_ms: u32,
        pin: u8,
        freq_hz: f64,
        phase_shift_deg: f64,
        duty_cycle_pct: f64,
    ) -> Self {
        Self {
            on_ms,
            off_ms,
            pin,
            kind: SegmentKind::Pwm {
                freq_hz,
                phase_shift_deg,
                duty_cycle_pct,
            },
        }
    }

    fn validate(&self) -> Result<(), StimulusError> {
        let pin_ok = match self.kind {
            SegmentKind::Tone { .. } => self.pin == TONE_PIN,
            SegmentKind::Output => OUTPUT_PINS.contains(&self.pin),
            SegmentKind::Pwm { .. } => PWM_PINS.contains(&self.pin),
        };
        if !pin_ok {
            return Err(StimulusError::InvalidPin {
                pin: self.pin,
                kind: self.kind.as_str(),
            });
        }
        if self.on_ms >= self.off_ms {
            return Err(StimulusError::EmptyInterval {
                pin: self.pin,
                on_ms: self.on_ms,
                off_ms: self.off_ms,
            });
        }
        match self.kind {
            SegmentKind::Tone { freq_hz } if freq_hz == 0 => Err(self.bad("frequency", 0.0)),
            SegmentKind::Pwm {
                freq_hz,
                phase_shift_deg,
                duty_cycle_pct,
            } => {
                if !(freq_hz > 0.0 && freq_hz.is_finite()) {
                    return Err(self.bad("frequency", freq_hz));
                }
                if !(0.0..=100.0).contains(&duty_cycle_pct) {
                    return Err(self.bad("duty cycle", duty_cycle_pct));
                }
                if !(0.0..360.0).contains(&phase_shift_deg) {
                    return Err(self.bad("phase shift", phase_shift_deg));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn bad(&self, field: &'static str, value: f64) -> StimulusError {
        StimulusError::Parameter {
            pin: self.pin,
            field,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    pub segments: Vec<StimulusSegment>,
}

impl StimulusConfig {
    pub fn new(segments: Vec<StimulusSegment>) -> Self {
        Self { segments }
    }

    pub fn latest_off_ms(&self) -> u32 {
        self.segments.iter().map(|s| s.off_ms).max().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), StimulusError> {
        for segment in &self.segments {
            segment.validate()?;
        }

        let mut by_pin: BTreeMap<u8, Vec<(u32, u32)>> = BTreeMap::new();
        for s in &self.segments {
            by_pin.entry(s.pin).or_default().push((s.on_ms, s.off_ms));
        }
        for (pin, mut intervals) in by_pin {
            intervals.sort_unstable();
            for pair in intervals.windows(2) {
                if pair[1].0 < pair[0].1 {
                    return Err(StimulusError::Overlap {
                        pin,
                        at_ms: pair[1].0,
                    });
                }
            }
        }
        Ok(())
    }

    fn of_kind<'a>(
        &'a self,
        pred: impl Fn(&SegmentKind) -> bool + 'a,
    ) -> impl Iterator<Item = &'a StimulusSegment> + 'a {
        self.segments.iter().filter(move |s| pred(&s.kind))
    }
}

/// Bit for `pin` within its port: port D carries pins 0-7, port B pins 8-13.
pub fn pin_mask(pin: u8) -> u8 {
    if pin < 8 {
        1 << pin
    } else {
        1 << (pin - 8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalPacket {
    pub enabled_d: u8,
    pub enabled_b: u8,
    pub total_ms: u32,
    pub n_tone: u16,
    pub n_output: u16,
    pub n_pwm: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToneFrame {
    pub on_ms: u32,
    pub off_ms: u32,
    pub freq_hz: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFrame {
    pub time_ms: u32,
    pub pin_mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmFrame {
    pub on_ms: u32,
    pub off_ms: u32,
    pub cycle_on_us: u32,
    pub cycle_off_us: u32,
    pub pin_mask: u8,
    pub phase_shift_us: u32,
}

impl PwmFrame {
    /// Convert frequency, duty cycle and phase into microsecond counts.
    pub fn from_segment(
        on_ms: u32,
        off_ms: u32,
        pin: u8,
        freq_hz: f64,
        phase_shift_deg: f64,
        duty_cycle_pct: f64,
    ) -> Self {
        let period_us = 1_000_000.0 / freq_hz;
        let duty = duty_cycle_pct / 100.0;
        Self {
            on_ms,
            off_ms,
            cycle_on_us: (period_us * duty).round() as u32,
            cycle_off_us: (period_us * (1.0 - duty)).round() as u32,
            pin_mask: pin_mask(pin),
            phase_shift_us: (period_us * phase_shift_deg / 360.0).round() as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFrame {
    SystemTime(u32),
    Global(GlobalPacket),
    Tone(ToneFrame),
    Output(OutputFrame),
    Pwm(PwmFrame),
}

impl WireFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::SystemTime(_) => "system time",
            WireFrame::Global(_) => "global",
            WireFrame::Tone(_) => "tone",
            WireFrame::Output(_) => "output",
            WireFrame::Pwm(_) => "pwm",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PWM_LEN);
        match self {
            WireFrame::SystemTime(secs) => out.extend_from_slice(&secs.to_le_bytes()),
            WireFrame::Global(g) => {
                out.push(g.enabled_d);
                out.push(g.enabled_b);
                out.extend_from_slice(&g.total_ms.to_le_bytes());
                out.extend_from_slice(&g.n_tone.to_le_bytes());
                out.extend_from_slice(&g.n_output.to_le_bytes());
                out.extend_from_slice(&g.n_pwm.to_le_bytes());
            }
            WireFrame::Tone(t) => {
                out.extend_from_slice(&t.on_ms.to_le_bytes());
                out.extend_from_slice(&t.off_ms.to_le_bytes());
                out.extend_from_slice(&t.freq_hz.to_le_bytes());
            }
            WireFrame::Output(o) => {
                out.extend_from_slice(&o.time_ms.to_le_bytes());
                out.push(o.pin_mask);
            }
            WireFrame::Pwm(p) => {
                // First word is reserved
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&p.on_ms.to_le_bytes());
                out.extend_from_slice(&p.off_ms.to_le_bytes());
                out.extend_from_slice(&p.cycle_on_us.to_le_bytes());
                out.extend_from_slice(&p.cycle_off_us.to_le_bytes());
                out.push(p.pin_mask);
                out.extend_from_slice(&p.phase_shift_us.to_le_bytes());
            }
        }
        out
    }

    pub fn decode_tone(bytes: &[u8]) -> Result<ToneFrame, StimulusError> {
        let mut r = FrameReader::new("tone", bytes, TONE_LEN)?;
        Ok(ToneFrame {
            on_ms: r.u32(),
            off_ms: r.u32(),
            freq_hz: r.u16(),
        })
    }

    pub fn decode_output(bytes: &[u8]) -> Result<OutputFrame, StimulusError> {
        let mut r = FrameReader::new("output", bytes, OUTPUT_LEN)?;
        Ok(OutputFrame {
            time_ms: r.u32(),
            pin_mask: r.u8(),
        })
    }

    pub fn decode_pwm(bytes: &[u8]) -> Result<PwmFrame, StimulusError> {
        let mut r = FrameReader::new("pwm", bytes, PWM_LEN)?;
        let _reserved = r.u32();
        Ok(PwmFrame {
            on_ms: r.u32(),
            off_ms: r.u32(),
            cycle_on_us: r.u32(),
            cycle_off_us: r.u32(),
            pin_mask: r.u8(),
            phase_shift_us: r.u32(),
        })
    }

    pub fn decode_global(bytes: &[u8]) -> Result<GlobalPacket, StimulusError> {
        let mut r = FrameReader::new("global", bytes, GLOBAL_LEN)?;
        Ok(GlobalPacket {
            enabled_d: r.u8(),
            enabled_b: r.u8(),
            total_ms: r.u32(),
            n_tone: r.u16(),
            n_output: r.u16(),
            n_pwm: r.u16(),
        })
    }
}

/// Cursor over a frame whose length was checked up front.
struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(kind: &'static str, bytes: &'a [u8], expected: usize) -> Result<Self, StimulusError> {
        if bytes.len() != expected {
            return Err(StimulusError::FrameLength {
                kind,
                expected,
                got: bytes.len(),
            });
        }
        Ok(Self { bytes, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
}

fn frame_count(kind: &'static str, count: usize) -> Result<u16, StimulusError> {
    u16::try_from(count).map_err(|_| StimulusError::TooManyFrames { kind, count })
}

/// Build the complete frame sequence for one run.
pub fn compile_program(
    config: &StimulusConfig,
    total_ms: u32,
    system_time: u32,
) -> Result<Vec<WireFrame>, StimulusError> {
    config.validate()?;

    let mut tones: Vec<ToneFrame> = config
        .of_kind(|k| matches!(k, SegmentKind::Tone { .. }))
        .filter_map(|s| match s.kind {
            SegmentKind::Tone { freq_hz } => Some(ToneFrame {
                on_ms: s.on_ms,
                off_ms: s.off_ms,
                freq_hz,
            }),
            _ => None,
        })
        .collect();
    tones.sort_by_key(|t| t.on_ms);

    // Each output segment toggles its pin at on_ms and again at off_ms.
    // XOR so that back-to-back segments on one pin collapse into one.
    let mut toggles: BTreeMap<u32, u8> = BTreeMap::new();
    for s in config.of_kind(|k| matches!(k, SegmentKind::Output)) {
        *toggles.entry(s.on_ms).or_default() ^= pin_mask(s.pin);
        *toggles.entry(s.off_ms).or_default() ^= pin_mask(s.pin);
    }
    let outputs: Vec<OutputFrame> = toggles
        .into_iter()
        .filter(|&(_, mask)| mask != 0)
        .map(|(time_ms, pin_mask)| OutputFrame { time_ms, pin_mask })
        .collect();

    let mut pwms: Vec<PwmFrame> = config
        .of_kind(|k| matches!(k, SegmentKind::Pwm { .. }))
        .filter_map(|s| match s.kind {
            SegmentKind::Pwm {
                freq_hz,
                phase_shift_deg,
                duty_cycle_pct,
            } => Some(PwmFrame::from_segment(
                s.on_ms,
                s.off_ms,
                s.pin,
                freq_hz,
                phase_shift_deg,
                duty_cycle_pct,
            )),
            _ => None,
        })
        .collect();
    pwms.sort_by_key(|p| p.on_ms);

    let mut enabled_d = 0u8;
    let mut enabled_b = 0u8;
    for s in &config.segments {
        if s.pin < 8 {
            enabled_d |= pin_mask(s.pin);
        } else {
            enabled_b |= pin_mask(s.pin);
        }
    }

    let global = GlobalPacket {
        enabled_d,
        enabled_b,
        total_ms: total_ms.max(config.latest_off_ms()),
        n_tone: frame_count("tone", tones.len())?,
        n_output: frame_count("output", outputs.len())?,
        n_pwm: frame_count("pwm", pwms.len())?,
    };

    let mut frames = Vec::with_capacity(2 + tones.len() + outputs.len() + pwms.len());
    frames.push(WireFrame::SystemTime(system_time));
    frames.push(WireFrame::Global(global));
    frames.extend(tones.into_iter().map(WireFrame::Tone));
    frames.extend(outputs.into_iter().map(WireFrame::Output));
    frames.extend(pwms.into_iter().map(WireFrame::Pwm));
    Ok(frames)
}

/// Recover output intervals per pin from toggle events.
pub fn output_intervals(events: &[OutputFrame]) -> Result<Vec<(u8, u32, u32)>, StimulusError> {
    let mut intervals = Vec::new();
    for pin in OUTPUT_PINS {
        let times: Vec<u32> = events
            .iter()
            .filter(|e| e.pin_mask & pin_mask(pin) != 0)
            .map(|e| e.time_ms)
            .collect();
        if times.len() % 2 != 0 {
            return Err(StimulusError::UnpairedToggle { pin });
        }
        intervals.extend(times.chunks_exact(2).map(|p| (pin, p[0], p[1])));
    }
    intervals.sort_by_key(|&(pin, on, _)| (on, pin));
    Ok(intervals)
}

/// Seconds since the epoch on the local wall clock.
pub fn local_system_time() -> u32 {
    let now = chrono::Local::now();
    let local = now.timestamp() + i64::from(now.offset().local_minus_utc());
    u32::try_from(local).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> StimulusConfig {
        StimulusConfig::new(vec![
            StimulusSegment::tone(120_000, 150_000, 2800),
            StimulusSegment::output(148_000, 150_000, 2),
            StimulusSegment::output(10_000, 20_000, 5),
            StimulusSegment::output(10_000, 12_000, 2),
            StimulusSegment::pwm(1_000, 9_000, 9, 40.0, 90.0, 25.0),
        ])
    }

    #[test]
    fn test_frame_lengths() {
        let frames = compile_program(&example(), 180_000, 42).unwrap();
        for f in &frames {
            let expected = match f {
                WireFrame::SystemTime(_) => SYSTEM_TIME_LEN,
                WireFrame::Global(_) => GLOBAL_LEN,
                WireFrame::Tone(_) => TONE_LEN,
                WireFrame::Output(_) => OUTPUT_LEN,
                WireFrame::Pwm(_) => PWM_LEN,
            };
            assert_eq!(f.encode().len(), expected, "{}", f.kind());
        }
    }

    #[test]
    fn test_program_order_and_global_packet() {
        let frames = compile_program(&example(), 180_000, 42).unwrap();
        assert_eq!(frames[0], WireFrame::SystemTime(42));
        let WireFrame::Global(global) = frames[1] else {
            unreachable!("second frame is always the global packet");
        };
        assert_eq!(global.enabled_d, (1 << 2) | (1 << 5));
        assert_eq!(global.enabled_b, (1 << 2) | (1 << 1));
        assert_eq!(global.total_ms, 180_000);
        assert_eq!(global.n_tone, 1);
        // Events at 10 000 (pins 2 and 5 combined), 12 000, 20 000, 148 000, 150 000
        assert_eq!(global.n_output, 5);
        assert_eq!(global.n_pwm, 1);

        let kinds: Vec<_> = frames.iter().map(WireFrame::kind).collect();
        assert_eq!(
            kinds,
            [
                "system time", "global", "tone", "output", "output", "output", "output", "output",
                "pwm"
            ]
        );
    }

    #[test]
    fn test_total_duration_covers_latest_segment() {
        let frames = compile_program(&example(), 1_000, 0).unwrap();
        let global = WireFrame::decode_global(&frames[1].encode()).unwrap();
        assert_eq!(global.total_ms, 150_000);
    }

    #[test]
    fn test_timing_roundtrip() {
        let config = example();
        let frames = compile_program(&config, 180_000, 0).unwrap();

        let mut tones = Vec::new();
        let mut outputs = Vec::new();
        let mut pwms = Vec::new();
        for f in &frames {
            let bytes = f.encode();
            match f {
                WireFrame::Tone(_) => tones.push(WireFrame::decode_tone(&bytes).unwrap()),
                WireFrame::Output(_) => outputs.push(WireFrame::decode_output(&bytes).unwrap()),
                WireFrame::Pwm(_) => pwms.push(WireFrame::decode_pwm(&bytes).unwrap()),
                _ => {}
            }
        }

        assert_eq!((tones[0].on_ms, tones[0].off_ms), (120_000, 150_000));
        assert_eq!((pwms[0].on_ms, pwms[0].off_ms), (1_000, 9_000));

        let recovered = output_intervals(&outputs).unwrap();
        let mut expected: Vec<(u8, u32, u32)> = config
            .segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Output)
            .map(|s| (s.pin, s.on_ms, s.off_ms))
            .collect();
        expected.sort_by_key(|&(pin, on, _)| (on, pin));
        assert_eq!(recovered, expected);
    }

    #[test]
    fn test_pwm_conversion() {
        // 40 Hz -> 25 000 us period
        let frame = PwmFrame::from_segment(0, 10, 9, 40.0, 90.0, 25.0);
        assert_eq!(frame.cycle_on_us, 6_250);
        assert_eq!(frame.cycle_off_us, 18_750);
        assert_eq!(frame.phase_shift_us, 6_250);
        assert_eq!(frame.pin_mask, 1 << 1);
    }

    #[test]
    fn test_adjacent_outputs_merge() {
        let config = StimulusConfig::new(vec![
            StimulusSegment::output(0, 100, 3),
            StimulusSegment::output(100, 200, 3),
        ]);
        let frames = compile_program(&config, 200, 0).unwrap();
        let outputs: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                WireFrame::Output(o) => Some(*o),
                _ => None,
            })
            .collect();
        assert_eq!(output_intervals(&outputs).unwrap(), vec![(3, 0, 200)]);
    }

    #[test]
    fn test_rejects_bad_segments() {
        let wrong_pin = StimulusConfig::new(vec![StimulusSegment::output(0, 10, 9)]);
        assert!(matches!(
            wrong_pin.validate(),
            Err(StimulusError::InvalidPin { pin: 9, .. })
        ));

        let overlap = StimulusConfig::new(vec![
            StimulusSegment::output(0, 10, 4),
            StimulusSegment::output(5, 15, 4),
        ]);
        assert_eq!(
            overlap.validate(),
            Err(StimulusError::Overlap { pin: 4, at_ms: 5 })
        );

        let empty = StimulusConfig::new(vec![StimulusSegment::tone(10, 10, 100)]);
        assert!(matches!(
            empty.validate(),
            Err(StimulusError::EmptyInterval { .. })
        ));

        let duty = StimulusConfig::new(vec![StimulusSegment::pwm(0, 10, 8, 10.0, 0.0, 120.0)]);
        assert!(matches!(
            duty.validate(),
            Err(StimulusError::Parameter {
                field: "duty cycle",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert_eq!(
            WireFrame::decode_tone(&[0; 4]),
            Err(StimulusError::FrameLength {
                kind: "tone",
                expected: TONE_LEN,
                got: 4
            })
        );
    }
}
