// SPDX-License-Identifier: GPL-3.0-or-later

//! Analog and digital channel models (§3, §4.3): per-input state, the linear
//! scale/unscale map, and the small per-output records mutated by the generators.

use crate::error::{Error, Result};

/// Gain values the CH1/CH2 programmable-gain amplifiers accept.
pub const GAIN_VALUES: [u8; 8] = [1, 2, 4, 5, 8, 10, 16, 32];

pub const ANALOG_CHANNELS: [&str; 8] = ["CH1", "CH2", "CH3", "MIC", "CAP", "RES", "VOL", "AN4"];

/// Which PGA (if any) a channel is wired through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pga {
    Ch1,
    Ch2,
}

impl Pga {
    fn id(self) -> u8 {
        match self {
            Pga::Ch1 => 1,
            Pga::Ch2 => 2,
        }
    }
}

fn pga_for(name: &str) -> Option<Pga> {
    match name {
        "CH1" => Some(Pga::Ch1),
        "CH2" => Some(Pga::Ch2),
        _ => None,
    }
}

fn mux_index(name: &str) -> Option<u8> {
    match name {
        "CH1" => Some(3),
        "CH2" => Some(0),
        "CH3" => Some(1),
        "MIC" => Some(2),
        "AN4" => Some(4),
        "RES" => Some(7),
        "CAP" => Some(5),
        "VOL" => Some(8),
        _ => None,
    }
}

/// Input range `(lo, hi)`. CH1/CH2 are intentionally inverted (lo > hi); see §4.3.
fn input_range(name: &str) -> Option<(f64, f64)> {
    match name {
        "CH1" | "CH2" => Some((16.5, -16.5)),
        "CH3" | "MIC" => Some((-3.3, 3.3)),
        "CAP" | "RES" | "VOL" | "AN4" => Some((0.0, 3.3)),
        _ => None,
    }
}

/// Per-analog-input state and the scale/unscale pair derived from it (§4.3).
#[derive(Clone, Debug)]
pub struct AnalogInput {
    pub name: String,
    pub mux: u8,
    pga: Option<Pga>,
    gain: u8,
    resolution: u8,
    range: (f64, f64),
    pub samples_in_buffer: u16,
    pub buffer_idx: u16,
}

impl AnalogInput {
    pub fn new(name: &str) -> Result<Self> {
        let mux = mux_index(name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown analog channel {}", name)))?;
        let range = input_range(name).expect("mux_index and input_range share the same domain");
        Ok(AnalogInput {
            name: name.to_string(),
            mux,
            pga: pga_for(name),
            gain: 1,
            resolution: 10,
            range,
            samples_in_buffer: 0,
            buffer_idx: 0,
        })
    }

    pub fn pga_id(&self) -> Option<u8> {
        self.pga.map(Pga::id)
    }

    pub fn gain(&self) -> u8 {
        self.gain
    }

    /// Only CH1/CH2 have a PGA; any other channel must keep gain 1.
    pub fn set_gain(&mut self, gain: u8) -> Result<()> {
        if self.pga.is_none() {
            return Err(Error::NotSupported(format!(
                "{} has no programmable-gain amplifier",
                self.name
            )));
        }
        if !GAIN_VALUES.contains(&gain) {
            return Err(Error::ArgumentError(format!("invalid gain {}", gain)));
        }
        self.gain = gain;
        Ok(())
    }

    pub fn resolution(&self) -> u8 {
        self.resolution
    }

    pub fn set_resolution(&mut self, resolution: u8) -> Result<()> {
        if resolution != 10 && resolution != 12 {
            return Err(Error::ArgumentError(format!(
                "resolution must be 10 or 12, got {}",
                resolution
            )));
        }
        self.resolution = resolution;
        Ok(())
    }

    pub fn range(&self) -> (f64, f64) {
        (self.range.0 / self.gain as f64, self.range.1 / self.gain as f64)
    }

    /// Full-scale magnitude at unity gain, i.e. before dividing by the current gain.
    pub fn full_scale(&self) -> f64 {
        self.range.0.abs().max(self.range.1.abs())
    }

    fn max_code(&self) -> u32 {
        (1u32 << self.resolution) - 1
    }

    /// `scale(raw) = A + raw * (B - A) / m` with `A = lo/g`, `B = hi/g`.
    pub fn scale(&self, raw: u32) -> f64 {
        let (a, b) = self.range();
        let m = self.max_code() as f64;
        a + raw as f64 * (b - a) / m
    }

    /// `unscale(volts) = clip(round((volts - A) * m / (B - A)), 0, m)`.
    pub fn unscale(&self, volts: f64) -> u32 {
        let (a, b) = self.range();
        let m = self.max_code() as f64;
        let raw = ((volts - a) * m / (b - a)).round();
        raw.max(0.0).min(m) as u32
    }
}

/// Waveform shape loaded onto an [`AnalogOutput`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaveType {
    Sine,
    Tria,
    Custom,
}

/// Full-scale voltage range of every analog output.
pub const OUTPUT_RANGE: (f64, f64) = (-3.3, 3.3);

const TABLE_SIZE: usize = 512;
const LOWRES_STRIDE: usize = 16;

/// Per-output state: a 512-point waveform table and its low-resolution subsample.
#[derive(Clone, Debug)]
pub struct AnalogOutput {
    pub name: String,
    pub frequency: f64,
    pub wavetype: WaveType,
    table: Vec<f64>,
}

impl AnalogOutput {
    pub fn new(name: &str) -> Self {
        let table = sine_table();
        AnalogOutput {
            name: name.to_string(),
            frequency: 0.0,
            wavetype: WaveType::Sine,
            table,
        }
    }

    /// Loads a new table, clipping every value into [`OUTPUT_RANGE`].
    pub fn load_table(&mut self, wavetype: WaveType, points: &[f64]) -> Result<()> {
        if points.len() != TABLE_SIZE {
            return Err(Error::ArgumentError(format!(
                "waveform table must have {} points, got {}",
                TABLE_SIZE,
                points.len()
            )));
        }
        self.wavetype = wavetype;
        self.table = points
            .iter()
            .map(|&v| v.max(OUTPUT_RANGE.0).min(OUTPUT_RANGE.1))
            .collect();
        Ok(())
    }

    /// 512-entry table normalised to `[0, 511]`.
    pub fn hires_table(&self) -> Vec<u16> {
        self.table.iter().map(|&v| normalize(v, 511)).collect()
    }

    /// Every 16th point of the table, normalised to `[0, 63]`.
    pub fn lowres_table(&self) -> Vec<u8> {
        self.table
            .iter()
            .step_by(LOWRES_STRIDE)
            .map(|&v| normalize(v, 63) as u8)
            .collect()
    }
}

fn normalize(v: f64, max: u32) -> u16 {
    let (lo, hi) = OUTPUT_RANGE;
    let n = ((v - lo) / (hi - lo) * max as f64).round();
    n.max(0.0).min(max as f64) as u16
}

pub fn sine_table() -> Vec<f64> {
    (0..TABLE_SIZE)
        .map(|i| {
            let x = 2.0 * std::f64::consts::PI * i as f64 / TABLE_SIZE as f64;
            OUTPUT_RANGE.1 * x.sin()
        })
        .collect()
}

/// `tria(x) = 3.3 * (|x mod 4 - 2| - 1)` sampled over `x ∈ [-1, 3)`, matching the
/// built-in triangle wave offered by the waveform generator (§4.7).
pub fn tria_table() -> Vec<f64> {
    (0..TABLE_SIZE)
        .map(|i| {
            let x = -1.0 + 4.0 * i as f64 / TABLE_SIZE as f64;
            let m = x.rem_euclid(4.0);
            OUTPUT_RANGE.1 * ((m - 2.0).abs() - 1.0)
        })
        .collect()
}

pub const DIGITAL_INPUTS: [&str; 7] = ["LA1", "LA2", "LA3", "LA4", "RES", "EXT", "FRQ"];
pub const DIGITAL_OUTPUTS: [&str; 4] = ["SQ1", "SQ2", "SQ3", "SQ4"];

/// Edge-capture mode for a digital input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogicMode {
    Disabled,
    Any,
    Falling,
    Rising,
    FourRising,
    SixteenRising,
}

impl LogicMode {
    pub fn code(self) -> u8 {
        match self {
            LogicMode::Disabled => 0,
            LogicMode::Any => 1,
            LogicMode::Falling => 2,
            LogicMode::Rising => 3,
            LogicMode::FourRising => 4,
            LogicMode::SixteenRising => 5,
        }
    }
}

/// Sample width the firmware uses for a given capture's timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimestampWidth {
    U16,
    U32,
}

#[derive(Clone, Debug)]
pub struct DigitalInput {
    pub name: String,
    pub channel: u8,
    pub datatype: TimestampWidth,
    pub mode: LogicMode,
    pub events_in_buffer: u32,
    pub buffer_idx: u16,
}

impl DigitalInput {
    pub fn new(name: &str) -> Result<Self> {
        let channel = DIGITAL_INPUTS
            .iter()
            .position(|&n| n == name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown digital input {}", name)))?
            as u8;
        Ok(DigitalInput {
            name: name.to_string(),
            channel,
            datatype: TimestampWidth::U32,
            mode: LogicMode::Disabled,
            events_in_buffer: 0,
            buffer_idx: 0,
        })
    }
}

/// Logical state of a digital output; PWM is reported while a generator owns the pin.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigitalState {
    Low,
    High,
    Pwm,
}

#[derive(Clone, Debug)]
pub struct DigitalOutput {
    pub name: String,
    pub state: DigitalState,
    pub duty_cycle: f64,
    pub phase: f64,
    pub remapped: bool,
}

impl DigitalOutput {
    pub fn new(name: &str) -> Self {
        DigitalOutput {
            name: name.to_string(),
            state: DigitalState::Low,
            duty_cycle: 0.0,
            phase: 0.0,
            remapped: false,
        }
    }

    /// Bit OR-ed into `DOUT + SET_STATE`'s argument byte for this channel.
    pub fn state_mask(&self) -> u8 {
        match self.name.as_str() {
            "SQ1" => 0x10,
            "SQ2" => 0x20,
            "SQ3" => 0x40,
            "SQ4" => 0x80,
            _ => unreachable!("DigitalOutput is only constructed for SQ1..SQ4"),
        }
    }

    /// Bit OR-ed into `WAVEGEN + MAP_REFERENCE`'s argument byte for this channel.
    pub fn reference_clock_map(&self) -> u8 {
        match self.name.as_str() {
            "SQ1" => 1,
            "SQ2" => 2,
            "SQ3" => 4,
            "SQ4" => 8,
            _ => unreachable!("DigitalOutput is only constructed for SQ1..SQ4"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scale_unscale_roundtrip_within_one_lsb() {
        let ch = AnalogInput::new("CH3").unwrap();
        for raw in [0u32, 100, 500, 1023] {
            let v = ch.scale(raw);
            let back = ch.unscale(v);
            assert!((back as i64 - raw as i64).abs() <= 1);
        }
    }

    #[test]
    fn inverted_range_channel_scales_correctly() {
        let ch = AnalogInput::new("CH1").unwrap();
        let (lo, hi) = ch.range();
        assert!(lo > hi);
        let v_min_code = ch.scale(0);
        let v_max_code = ch.scale(1023);
        assert!((v_min_code - lo).abs() < 1e-9);
        assert!((v_max_code - hi).abs() < 1e-9);
    }

    #[test]
    fn only_ch1_ch2_accept_gain() {
        let mut ch1 = AnalogInput::new("CH1").unwrap();
        assert!(ch1.set_gain(16).is_ok());
        let mut mic = AnalogInput::new("MIC").unwrap();
        assert!(mic.set_gain(2).is_err());
    }

    #[test]
    fn hires_table_normalizes_to_0_511() {
        let out = AnalogOutput::new("SI1");
        let hires = out.hires_table();
        assert_eq!(hires.len(), 512);
        assert!(hires.iter().all(|&v| v <= 511));
    }

    #[test]
    fn lowres_table_is_every_sixteenth_point() {
        let out = AnalogOutput::new("SI1");
        assert_eq!(out.lowres_table().len(), 32);
    }

    #[test]
    fn digital_output_masks_match_spec_table() {
        assert_eq!(DigitalOutput::new("SQ1").state_mask(), 0x10);
        assert_eq!(DigitalOutput::new("SQ4").state_mask(), 0x80);
        assert_eq!(DigitalOutput::new("SQ3").reference_clock_map(), 4);
    }
}
