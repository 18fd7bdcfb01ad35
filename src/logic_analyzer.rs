// SPDX-License-Identifier: GPL-3.0-or-later

//! Logic analyzer (§4.6): 1/2/4-channel digital event capture, timestamp
//! reconstruction, and the derived frequency/duty-cycle/interval measurements.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use benchlink_protocol::timing;
use log::debug;

use crate::channel::{DigitalInput, LogicMode, TimestampWidth, DIGITAL_INPUTS};
use crate::error::{Error, Result};
use crate::oscilloscope::JobState;
use crate::transport::Port;
use crate::SharedTransport;

/// 1-channel trigger-mode remap: the firmware's alternate-edge capture numbers its
/// modes differently from [`LogicMode::code`].
const ONE_CHANNEL_MODES: [(LogicMode, u8); 6] = [
    (LogicMode::Disabled, 0),
    (LogicMode::Any, 1),
    (LogicMode::Falling, 2),
    (LogicMode::Rising, 3),
    (LogicMode::FourRising, 4),
    (LogicMode::SixteenRising, 5),
];

/// 2-channel mode remap. Preserved verbatim, including the asymmetric falling/rising
/// values relative to the 1-channel table; see `SPEC_FULL.md` §9.
const TWO_CHANNEL_MODES: [(LogicMode, u8); 3] = [
    (LogicMode::Disabled, 0),
    (LogicMode::Falling, 3),
    (LogicMode::Rising, 1),
];

/// 4-channel mode remap. Also preserved verbatim.
const FOUR_CHANNEL_MODES: [(LogicMode, u8); 3] = [
    (LogicMode::Disabled, 0),
    (LogicMode::Falling, 1),
    (LogicMode::Rising, 3),
];

fn mode_code(table: &[(LogicMode, u8)], mode: LogicMode) -> Result<u8> {
    table
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, c)| *c)
        .ok_or_else(|| Error::ArgumentError(format!("{:?} is not supported at this channel count", mode)))
}

/// Minimum timegap for the 4-channel capture, fixed by hardware (I4's 0.875 us bound,
/// adopted unconditionally per `SPEC_FULL.md` §9).
const FOUR_CHANNEL_MIN_TIMEGAP_US: f64 = 0.875;

#[derive(Clone, Copy, Debug)]
struct CaptureJob {
    state: JobState,
    channels: u8,
    samples: u32,
    prescaler: u32,
}

impl Default for CaptureJob {
    fn default() -> Self {
        CaptureJob {
            state: JobState::Idle,
            channels: 0,
            samples: 0,
            prescaler: 1,
        }
    }
}

pub struct LogicAnalyzer<P: Port> {
    transport: SharedTransport<P>,
    inputs: Vec<DigitalInput>,
    job: CaptureJob,
    /// Running count of leading/trailing zero timestamps trimmed from the previous
    /// 32-bit capture; reset at the start of every new capture (§9 Adopted).
    trimmed: u32,
}

impl<P: Port> LogicAnalyzer<P> {
    pub fn new(transport: SharedTransport<P>) -> Result<Self> {
        let inputs = DIGITAL_INPUTS
            .iter()
            .map(|&name| DigitalInput::new(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(LogicAnalyzer {
            transport,
            inputs,
            job: CaptureJob::default(),
            trimmed: 0,
        })
    }

    pub fn input(&self, name: &str) -> Result<&DigitalInput> {
        self.inputs
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown digital input {}", name)))
    }

    fn input_mut(&mut self, name: &str) -> Result<&mut DigitalInput> {
        self.inputs
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown digital input {}", name)))
    }

    pub fn set_mode(&mut self, name: &str, mode: LogicMode) -> Result<()> {
        self.input_mut(name)?.mode = mode;
        Ok(())
    }

    /// Captures on a single channel (`LA1`, alternating-edge mode).
    pub fn capture_one(&mut self, channel: &str, samples: u32, timeout: Duration) -> Result<Vec<f64>> {
        let mode = self.input(channel)?.mode;
        let code = mode_code(&ONE_CHANNEL_MODES, mode)?;
        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(benchlink_protocol::Primary::Timing.into())?;
            t.send_u8(timing::START_ALTERNATE_ONE_CHAN_LA)?;
            t.send_u8(code)?;
            t.send_u32(samples)?;
            t.get_ack()?;
        }
        self.job = CaptureJob {
            state: JobState::Armed,
            channels: 1,
            samples,
            prescaler: 1,
        };
        self.trimmed = 0;
        self.fetch_timestamps(TimestampWidth::U32, timeout)
    }

    /// Captures on two channels (`LA1`/`LA2`).
    pub fn capture_two(&mut self, samples: u32, timeout: Duration) -> Result<Vec<Vec<f64>>> {
        let mode1 = mode_code(&TWO_CHANNEL_MODES, self.input("LA1")?.mode)?;
        let mode2 = mode_code(&TWO_CHANNEL_MODES, self.input("LA2")?.mode)?;
        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(benchlink_protocol::Primary::Timing.into())?;
            t.send_u8(timing::START_TWO_CHAN_LA)?;
            t.send_u8(mode1 | (mode2 << 4))?;
            t.send_u32(samples)?;
            t.get_ack()?;
        }
        self.job = CaptureJob {
            state: JobState::Armed,
            channels: 2,
            samples,
            prescaler: 1,
        };
        self.trimmed = 0;
        let merged = self.fetch_timestamps(TimestampWidth::U32, timeout)?;
        Ok(vec![merged.clone(), merged])
    }

    /// Captures on four channels (`LA1`..`LA4`). The only mode that picks a prescaler,
    /// via the shared wavelength algorithm (§4.9).
    pub fn capture_four(&mut self, timegap_us: f64, samples: u32, timeout: Duration) -> Result<Vec<Vec<f64>>> {
        if timegap_us < FOUR_CHANNEL_MIN_TIMEGAP_US {
            return Err(Error::TimegapTooSmall(timegap_us));
        }
        let frequency = 1e6 / timegap_us;
        let (ticks, prescaler) = benchlink_protocol::wavelength(frequency, 1)
            .ok_or(Error::FrequencyOutOfRange(frequency))?;

        let modes: Vec<u8> = ["LA1", "LA2", "LA3", "LA4"]
            .iter()
            .map(|&name| mode_code(&FOUR_CHANNEL_MODES, self.input(name).unwrap().mode))
            .collect::<Result<Vec<_>>>()?;

        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(benchlink_protocol::Primary::Timing.into())?;
            t.send_u8(timing::START_FOUR_CHAN_LA)?;
            t.send_u8(modes[0] | (modes[1] << 4))?;
            t.send_u8(modes[2] | (modes[3] << 4))?;
            t.send_u16(ticks)?;
            t.send_u32(samples)?;
            t.get_ack()?;
        }
        self.job = CaptureJob {
            state: JobState::Armed,
            channels: 4,
            samples,
            prescaler,
        };
        self.trimmed = 0;
        let timestamps = self.fetch_timestamps(TimestampWidth::U16, timeout)?;
        Ok(vec![timestamps; 4])
    }

    fn wait_for_data(&mut self, timeout: Duration) -> Result<()> {
        let ready = self.transport.borrow_mut().wait_for_data(timeout);
        if !ready {
            return Err(Error::CaptureTimeout(timeout));
        }
        Ok(())
    }

    /// Drains the event buffer and reconstructs absolute timestamps, in microseconds.
    fn fetch_timestamps(&mut self, width: TimestampWidth, timeout: Duration) -> Result<Vec<f64>> {
        self.wait_for_data(timeout)?;
        let mut t = self.transport.borrow_mut();
        t.send_u8(benchlink_protocol::Primary::Timing.into())?;

        let raw: Vec<u32> = match width {
            TimestampWidth::U32 => {
                t.send_u8(timing::FETCH_LONG_DMA_DATA)?;
                let mut values = Vec::new();
                loop {
                    let v = t.get_u32()?;
                    if v == 0xFFFF_FFFF {
                        break;
                    }
                    values.push(v);
                }
                t.get_ack()?;
                values
            }
            TimestampWidth::U16 => {
                t.send_u8(timing::FETCH_INT_DMA_DATA)?;
                let mut values = Vec::new();
                loop {
                    let v = t.get_u16()?;
                    if v == 0xFFFF {
                        break;
                    }
                    values.push(v as u32);
                }
                t.get_ack()?;
                values
            }
        };
        drop(t);

        let reconstructed = match width {
            TimestampWidth::U32 => self.reconstruct_u32(raw),
            TimestampWidth::U16 => self.reconstruct_u16(raw),
        };
        self.job.state = JobState::Idle;
        debug!("logic analyzer fetched {} events", reconstructed.len());
        Ok(reconstructed)
    }

    /// 32-bit path: trims leading/trailing zero timestamps, counting them in
    /// `self.trimmed` (§9 Adopted: reset once per capture, set once per fetch).
    fn reconstruct_u32(&mut self, raw: Vec<u32>) -> Vec<f64> {
        let clock = benchlink_protocol::CLOCK_RATE as f64;
        let start = raw.iter().position(|&v| v != 0).unwrap_or(raw.len());
        let end = raw.iter().rposition(|&v| v != 0).map(|i| i + 1).unwrap_or(0);
        let trimmed_region = if start < end { &raw[start..end] } else { &[][..] };
        self.trimmed = (start + (raw.len() - end)) as u32;
        trimmed_region
            .iter()
            .scan(0u64, |acc, &tick| {
                *acc += tick as u64;
                Some(*acc as f64 / clock * 1e6)
            })
            .collect()
    }

    /// 16-bit path: keeps at most one leading zero, applies rollover correction and the
    /// prescaler-dependent tick multiplier, with a per-channel offset when the capture
    /// ran at the smallest prescaler (§9 Adopted).
    fn reconstruct_u16(&self, raw: Vec<u32>) -> Vec<f64> {
        let clock = benchlink_protocol::CLOCK_RATE as f64;
        let prescaler_idx = benchlink_protocol::prescaler_index(self.job.prescaler).unwrap_or(0);
        let multiplier = match prescaler_idx {
            0 => 1.0 / 64.0,
            1 => 1.0 / 8.0,
            2 => 1.0,
            _ => 4.0,
        };

        let start = raw.iter().position(|&v| v != 0).unwrap_or(0);
        let trimmed: Vec<u32> = if start > 0 { raw[start - 1..].to_vec() } else { raw };

        let mut absolute = Vec::with_capacity(trimmed.len());
        let mut running: u64 = 0;
        let mut previous: i64 = -1;
        for &tick in &trimmed {
            let mut delta = tick as i64 - previous.max(0);
            if previous >= 0 && delta < 0 {
                delta += 0xFFFF;
            }
            running += delta.max(0) as u64;
            previous = tick as i64;
            absolute.push(running as f64 * multiplier);
        }
        if prescaler_idx == 0 {
            for v in absolute.iter_mut() {
                *v += 2.0 * self.job.channels as f64;
            }
        }
        absolute.iter().map(|&t| t / clock * 1e6).collect()
    }

    pub fn measure_frequency(&self, events: &[f64]) -> Result<f64> {
        if events.len() < 2 {
            return Err(Error::ArgumentError("need at least two edges to measure frequency".into()));
        }
        let period_us = (events[events.len() - 1] - events[0]) / (events.len() - 1) as f64;
        Ok(1e6 / period_us)
    }

    pub fn measure_interval(&self, events: &[f64]) -> Result<f64> {
        let (first, second) = get_first_event(events)?;
        Ok(second - first)
    }

    pub fn measure_duty_cycle(&self, events: &[f64]) -> Result<f64> {
        if events.len() < 3 {
            return Err(Error::ArgumentError("need at least three edges to measure duty cycle".into()));
        }
        let high = events[1] - events[0];
        let period = events[2] - events[0];
        Ok(high / period)
    }

    pub fn count_pulses(&self, events: &[f64]) -> u32 {
        (events.len() / 2) as u32
    }
}

/// Returns the first two events, or an error -- replaces the source's reliance on an
/// out-of-bounds index to signal "not enough data yet".
fn get_first_event(events: &[f64]) -> Result<(f64, f64)> {
    if events.len() < 2 {
        return Err(Error::ArgumentError("no event pair available yet".into()));
    }
    Ok((events[0], events[1]))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::test::Loopback;
    use crate::transport::{Transport, TransportConfig};

    fn harness() -> LogicAnalyzer<Loopback> {
        let transport = Rc::new(RefCell::new(Transport::from_stream(
            Loopback::new(),
            TransportConfig::default(),
        )));
        LogicAnalyzer::new(transport).unwrap()
    }

    #[test]
    fn one_channel_mode_table_matches_logic_mode_codes() {
        assert_eq!(mode_code(&ONE_CHANNEL_MODES, LogicMode::SixteenRising).unwrap(), 5);
    }

    #[test]
    fn two_channel_mode_table_is_asymmetric() {
        assert_eq!(mode_code(&TWO_CHANNEL_MODES, LogicMode::Falling).unwrap(), 3);
        assert_eq!(mode_code(&TWO_CHANNEL_MODES, LogicMode::Rising).unwrap(), 1);
        assert!(mode_code(&TWO_CHANNEL_MODES, LogicMode::Any).is_err());
    }

    #[test]
    fn four_channel_min_timegap_is_enforced() {
        let mut la = harness();
        assert!(matches!(
            la.capture_four(0.1, 10, Duration::from_millis(10)),
            Err(Error::TimegapTooSmall(_))
        ));
    }

    #[test]
    fn reconstruct_u32_trims_leading_and_trailing_zeros() {
        let mut la = harness();
        let reconstructed = la.reconstruct_u32(vec![0, 0, 100, 200, 0]);
        assert_eq!(reconstructed.len(), 2);
        assert_eq!(la.trimmed, 3);
    }

    #[test]
    fn measure_frequency_from_evenly_spaced_events() {
        let la = harness();
        let events = vec![0.0, 1000.0, 2000.0, 3000.0];
        let frequency = la.measure_frequency(&events).unwrap();
        assert!((frequency - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn get_first_event_errors_on_empty_buffer() {
        assert!(get_first_event(&[]).is_err());
        assert!(get_first_event(&[1.0, 2.0]).is_ok());
    }
}
