// SPDX-License-Identifier: GPL-3.0-or-later

//! Oscilloscope (§4.4): resolution/trigger/multiplexer configuration, multi-channel
//! capture, and the `CaptureJob` state machine shared with the logic analyzer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use benchlink_protocol::{adc, Primary};
use log::debug;

use crate::channel::{AnalogInput, ANALOG_CHANNELS, GAIN_VALUES};
use crate::error::{Error, Result};
use crate::transport::{Port, Transport};
use crate::{buffer, SharedTransport};

/// State of the capture job shared by the oscilloscope and logic analyzer (§4.11).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Idle,
    Configured,
    Armed,
    Draining,
}

#[derive(Clone, Debug)]
struct Trigger {
    channel: String,
    prescaler: u8,
    enabled: bool,
}

#[derive(Clone, Debug)]
struct CaptureJob {
    state: JobState,
    channel_count: u8,
    samples: u16,
    timegap_us: f64,
    resolution: u8,
    trigger: Option<Trigger>,
}

impl Default for CaptureJob {
    fn default() -> Self {
        CaptureJob {
            state: JobState::Idle,
            channel_count: 0,
            samples: 0,
            timegap_us: 0.0,
            resolution: 10,
            trigger: None,
        }
    }
}

/// Minimum timegap, in microseconds, for a given channel count/trigger/resolution
/// combination (I4). This implementation always applies the current-generation 4-channel
/// bound (0.875 us); see `SPEC_FULL.md` §9 for the historic-vs-current rationale.
fn min_timegap_us(channels: u8, triggered: bool, resolution: u8) -> f64 {
    match (channels, triggered, resolution) {
        (1, false, 10) => 0.5,
        (1, true, 10) => 0.875,
        (1, false, 12) => 1.0,
        _ => 0.875,
    }
}

fn resolve_resolution(channels: u8, triggered: bool, timegap_us: f64) -> u8 {
    if channels == 1 && !triggered && timegap_us >= 1.0 {
        12
    } else {
        10
    }
}

/// Result of a completed or in-progress capture: one shared x-axis and one y-axis per
/// channel, in volts.
#[derive(Clone, Debug)]
pub struct CaptureData {
    pub x_us: Vec<f64>,
    pub y_volts: Vec<Vec<f64>>,
}

pub struct Oscilloscope<P: Port> {
    transport: SharedTransport<P>,
    channels: HashMap<&'static str, AnalogInput>,
    channel_one_map: &'static str,
    job: CaptureJob,
}

impl<P: Port> Oscilloscope<P> {
    pub fn new(transport: SharedTransport<P>) -> Result<Self> {
        let mut channels = HashMap::new();
        for &name in ANALOG_CHANNELS.iter() {
            channels.insert(name, AnalogInput::new(name)?);
        }
        Ok(Oscilloscope {
            transport,
            channels,
            channel_one_map: "CH1",
            job: CaptureJob::default(),
        })
    }

    pub fn channel(&self, name: &str) -> Result<&AnalogInput> {
        self.channels
            .get(name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown analog channel {}", name)))
    }

    pub(crate) fn channel_mut(&mut self, name: &str) -> Result<&mut AnalogInput> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown analog channel {}", name)))
    }

    pub(crate) fn transport(&self) -> &SharedTransport<P> {
        &self.transport
    }

    /// Which input is sampled as "channel 1" in a multi-channel capture.
    pub fn set_channel_one_map(&mut self, name: &'static str) -> Result<()> {
        if !ANALOG_CHANNELS.contains(&name) {
            return Err(Error::ArgumentError(format!("unknown analog channel {}", name)));
        }
        self.channel_one_map = name;
        Ok(())
    }

    fn channel_order(&self, count: u8) -> Vec<&'static str> {
        [self.channel_one_map, "CH2", "CH3", "MIC"]
            .into_iter()
            .take(count as usize)
            .collect()
    }

    pub fn set_gain(&mut self, channel: &str, gain: u8) -> Result<()> {
        self.channel_mut(channel)?.set_gain(gain)
    }

    /// Picks the largest gain whose full scale still contains `±range`.
    pub fn select_range(&mut self, channel: &str, range: f64) -> Result<()> {
        let full_scale = self.channel(channel)?.full_scale();
        if self.channel(channel)?.pga_id().is_none() {
            return Ok(());
        }
        let mut chosen = 1;
        for &g in GAIN_VALUES.iter() {
            if full_scale / g as f64 >= range {
                chosen = g;
            }
        }
        self.set_gain(channel, chosen)
    }

    /// Installs (or clears) a level trigger on `channel` (§4.4's trigger encoding).
    pub fn configure_trigger(
        &mut self,
        channel: &str,
        voltage: f64,
        prescaler: u8,
        enable: bool,
    ) -> Result<()> {
        let order = self.channel_order(4);
        let idx = order
            .iter()
            .position(|&c| c == channel)
            .ok_or_else(|| Error::TriggerNotSupportedOnChannel(channel.to_string()))?;
        let level = self.channel(channel)?.unscale(voltage) as u16;

        if enable {
            let mut t = self.transport.borrow_mut();
            t.send_u8(Primary::Adc.into())?;
            t.send_u8(adc::CONFIGURE_TRIGGER)?;
            t.send_u8((prescaler << 4) | (1 << idx))?;
            t.send_u16(level)?;
            t.get_ack()?;
        }

        self.job.trigger = Some(Trigger {
            channel: channel.to_string(),
            prescaler,
            enabled: enable,
        });
        Ok(())
    }

    fn invalidate_buffer(&mut self) {
        for ch in self.channels.values_mut() {
            ch.samples_in_buffer = 0;
            ch.buffer_idx = 0;
        }
    }

    fn validate_capture(&self, channels: u8, samples: u16, timegap_us: f64, triggered: bool) -> Result<u8> {
        if ![1u8, 2, 4].contains(&channels) {
            return Err(Error::ArgumentError(format!(
                "channel count must be 1, 2 or 4, got {}",
                channels
            )));
        }
        let max_samples = benchlink_protocol::MAX_SAMPLES / channels as u16;
        if samples > max_samples {
            return Err(Error::ArgumentError(format!(
                "samples {} exceeds {} for {} channels",
                samples, max_samples, channels
            )));
        }
        let resolution = resolve_resolution(channels, triggered, timegap_us);
        let min = min_timegap_us(channels, triggered, resolution);
        if timegap_us < min {
            return Err(Error::TimegapTooSmall(timegap_us));
        }
        Ok(resolution)
    }

    /// Runs a capture to completion and returns the scaled result.
    pub fn capture(
        &mut self,
        channels: u8,
        samples: u16,
        timegap_us: f64,
        trigger: bool,
        block: bool,
    ) -> Result<CaptureData> {
        self.capture_nonblocking(channels, samples, timegap_us, trigger)?;
        if block {
            self.wait_for_completion(Duration::from_secs(5))?;
        }
        self.fetch_data()
    }

    /// Starts a capture and returns immediately; the caller must poll [`Self::progress`]
    /// and later call [`Self::fetch_data`].
    pub fn capture_nonblocking(
        &mut self,
        channels: u8,
        samples: u16,
        timegap_us: f64,
        trigger: bool,
    ) -> Result<()> {
        let resolution = self.validate_capture(channels, samples, timegap_us, trigger)?;
        self.invalidate_buffer();

        let order = self.channel_order(channels);
        for (i, &name) in order.iter().enumerate() {
            let ch = self.channel_mut(name)?;
            ch.set_resolution(resolution)?;
            ch.buffer_idx = i as u16 * samples;
        }

        let mux = self.channel(order[0])?.mux;
        let ticks = (timegap_us * 8.0).round() as u16;

        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(Primary::Adc.into())?;
            if resolution == 12 {
                t.send_u8(adc::CAPTURE_DMASPEED)?;
                t.send_u8(mux | adc::DMASPEED_BIT)?;
            } else {
                let opcode = match channels {
                    1 => adc::CAPTURE_ONE,
                    2 => adc::CAPTURE_TWO,
                    _ => adc::CAPTURE_FOUR,
                };
                let arg = if trigger { opcode | adc::TRIGGER_BIT } else { opcode };
                t.send_u8(arg)?;
            }
            t.send_u16(samples)?;
            t.send_u16(ticks)?;
            t.get_ack()?;
        }

        self.job = CaptureJob {
            state: JobState::Armed,
            channel_count: channels,
            samples,
            timegap_us,
            resolution,
            trigger: self.job.trigger.clone(),
        };
        debug!("capture armed: {} ch, {} samples, {} us", channels, samples, timegap_us);
        Ok(())
    }

    /// `(done, samples currently in buffer)`.
    pub fn progress(&mut self) -> Result<(bool, u16)> {
        let mut t = self.transport.borrow_mut();
        t.send_u8(Primary::Adc.into())?;
        t.send_u8(adc::GET_CAPTURE_STATUS)?;
        let done = t.get_u8()? != 0;
        let count = t.get_u16()?;
        t.get_ack()?;
        Ok((done, count))
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let sleep_us = (self.job.samples as f64 * self.job.timegap_us) as u64;
        thread::sleep(Duration::from_micros(sleep_us));
        loop {
            let (done, _) = self.progress()?;
            if done {
                self.job.state = JobState::Draining;
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::CaptureTimeout(timeout));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drains the buffer regions belonging to the current job and scales to volts.
    pub fn fetch_data(&mut self) -> Result<CaptureData> {
        let order = self.channel_order(self.job.channel_count.max(1));
        let samples = self.job.samples;
        let mut y = Vec::with_capacity(order.len());
        for &name in &order {
            let idx = self.channel(name)?.buffer_idx;
            let raw = {
                let mut t = self.transport.borrow_mut();
                buffer::fetch_buffer(&mut t, idx, samples)?
            };
            let ch = self.channel(name)?;
            y.push(raw.into_iter().map(|r| ch.scale(r as u32)).collect());
        }
        let x_us: Vec<f64> = (0..samples as usize)
            .map(|i| i as f64 * self.job.timegap_us)
            .collect();
        self.job.state = JobState::Idle;
        Ok(CaptureData { x_us, y_volts: y })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::test::Loopback;
    use crate::transport::TransportConfig;

    fn harness() -> Oscilloscope<Loopback> {
        let transport = Rc::new(RefCell::new(Transport::from_stream(
            Loopback::new(),
            TransportConfig::default(),
        )));
        Oscilloscope::new(transport).unwrap()
    }

    #[test]
    fn rejects_invalid_channel_count() {
        let mut scope = harness();
        assert!(matches!(
            scope.capture_nonblocking(3, 100, 1.0, false),
            Err(Error::ArgumentError(_))
        ));
    }

    #[test]
    fn rejects_too_many_samples_for_channel_count() {
        let mut scope = harness();
        assert!(scope.capture_nonblocking(4, 3000, 1.0, false).is_err());
    }

    #[test]
    fn rejects_timegap_below_minimum() {
        let mut scope = harness();
        assert!(matches!(
            scope.capture_nonblocking(1, 10, 0.1, false),
            Err(Error::TimegapTooSmall(_))
        ));
    }

    #[test]
    fn twelve_bit_resolution_only_for_single_untriggered_channel() {
        assert_eq!(resolve_resolution(1, false, 1.0), 12);
        assert_eq!(resolve_resolution(1, true, 1.0), 10);
        assert_eq!(resolve_resolution(2, false, 1.0), 10);
        assert_eq!(resolve_resolution(1, false, 0.5), 10);
    }

    #[test]
    fn buffer_regions_are_disjoint_across_channels() {
        let mut scope = harness();
        scope.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        scope.capture_nonblocking(4, 100, 1.0, false).unwrap();
        let mut seen = Vec::new();
        for name in ["CH1", "CH2", "CH3", "MIC"] {
            let idx = scope.channel(name).unwrap().buffer_idx;
            assert!(!seen.contains(&idx), "buffer_idx {} reused", idx);
            seen.push(idx);
        }
        assert_eq!(seen, vec![0, 100, 200, 300]);
    }

    #[test]
    fn select_range_skips_channels_without_a_pga() {
        let mut scope = harness();
        assert!(scope.select_range("MIC", 1.0).is_ok());
        assert_eq!(scope.channel("MIC").unwrap().gain(), 1);
    }

    #[test]
    fn select_range_picks_largest_gain_covering_the_request() {
        let mut scope = harness();
        scope.select_range("CH1", 1.0).unwrap();
        let gain = scope.channel("CH1").unwrap().gain();
        let full_scale = scope.channel("CH1").unwrap().full_scale();
        assert!(full_scale / gain as f64 >= 1.0);
    }
}
