// SPDX-License-Identifier: GPL-3.0-or-later

//! PWM generator (§4.8): four digital outputs (`SQ1`..`SQ4`) driven at a shared
//! frequency with independent duty cycle and phase, plus reference-clock remapping.
//!
//! The firmware's `SQR4` command always programs all four channels in one shot
//! (`examples/original_source/pslab/instrument/waveform_generator.py:461-472`), so
//! [`PwmGenerator::generate`] only updates the state of the channels it was asked to
//! touch, then resends every channel's current duty cycle/phase. Channels left at a
//! static HIGH/LOW level and channels mapped to the reference clock are restored
//! afterwards, since `SQR4` implicitly turns every pin into a PWM output.

use std::collections::HashMap;

use benchlink_protocol::{wavegen, Primary};

use crate::channel::{DigitalOutput, DigitalState, DIGITAL_OUTPUTS as CHANNELS};
use crate::error::{Error, Result};
use crate::transport::Port;
use crate::SharedTransport;

const HIGH_FREQUENCY_LIMIT: f64 = 1e7;

pub struct PwmGenerator<P: Port> {
    transport: SharedTransport<P>,
    channels: HashMap<&'static str, DigitalOutput>,
    frequency: f64,
    reference_prescaler: u8,
}

impl<P: Port> PwmGenerator<P> {
    pub fn new(transport: SharedTransport<P>) -> Self {
        let mut channels = HashMap::new();
        for &name in CHANNELS.iter() {
            channels.insert(name, DigitalOutput::new(name));
        }
        PwmGenerator {
            transport,
            channels,
            frequency: 0.0,
            reference_prescaler: 0,
        }
    }

    pub fn channel(&self, name: &str) -> Result<&DigitalOutput> {
        self.channels
            .get(name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown PWM channel {}", name)))
    }

    fn channel_mut(&mut self, name: &str) -> Result<&mut DigitalOutput> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown PWM channel {}", name)))
    }

    /// Starts `channels` generating a square wave at `frequency`, with each entry of
    /// `duty_cycles` in `[0, 1]` and each entry of `phases` (a fraction of one period)
    /// in `[0, 1)`. Every other channel keeps its previously set duty cycle and phase,
    /// but the wire command this issues (`SQR4`) always reprograms all four channels;
    /// channels holding a static HIGH/LOW level, and channels mapped to the reference
    /// clock, are restored immediately afterwards.
    pub fn generate(
        &mut self,
        channels: &[&str],
        frequency: f64,
        duty_cycles: &[f64],
        phases: &[f64],
    ) -> Result<()> {
        if frequency <= 0.0 || frequency > HIGH_FREQUENCY_LIMIT {
            return Err(Error::FrequencyOutOfRange(frequency));
        }
        if duty_cycles.len() != channels.len() || phases.len() != channels.len() {
            return Err(Error::ArgumentError(
                "channels, duty_cycles and phases must have the same length".into(),
            ));
        }
        for &duty_cycle in duty_cycles {
            if !(0.0..=1.0).contains(&duty_cycle) {
                return Err(Error::ArgumentError(format!(
                    "duty cycle must be in [0, 1], got {}",
                    duty_cycle
                )));
            }
        }
        for &phase in phases {
            if !(0.0..1.0).contains(&phase) {
                return Err(Error::ArgumentError(format!("phase must be in [0, 1), got {}", phase)));
            }
        }
        for &name in channels {
            self.channel(name)?;
        }

        self.frequency = frequency;
        for ((&name, &duty_cycle), &phase) in channels.iter().zip(duty_cycles).zip(phases) {
            let ch = self.channel_mut(name)?;
            ch.duty_cycle = duty_cycle;
            ch.phase = phase;
            ch.remapped = false;
            ch.state = if duty_cycle == 0.0 {
                DigitalState::Low
            } else if duty_cycle == 1.0 {
                DigitalState::High
            } else {
                DigitalState::Pwm
            };
        }

        self.send_sqr4()?;

        let static_states: Vec<(&'static str, bool)> = CHANNELS
            .iter()
            .filter_map(|&name| match self.channels[name].state {
                DigitalState::High => Some((name, true)),
                DigitalState::Low => Some((name, false)),
                DigitalState::Pwm => None,
            })
            .collect();
        if !static_states.is_empty() {
            self.set_state(&static_states)?;
        }

        let remapped: Vec<&'static str> = CHANNELS
            .iter()
            .copied()
            .filter(|&name| self.channels[name].remapped)
            .collect();
        if !remapped.is_empty() {
            let prescaler = self.reference_prescaler;
            self.map_reference_clock(&remapped, prescaler)?;
        }

        Ok(())
    }

    /// Sends `WAVEGEN + SQR4` for all four channels using each channel's current
    /// `duty_cycle`/`phase`, matching `waveform_generator.py`'s `PWMGenerator._generate`.
    fn send_sqr4(&mut self) -> Result<()> {
        let (wavelength, prescaler) =
            benchlink_protocol::wavelength(self.frequency, 1).ok_or(Error::FrequencyOutOfRange(self.frequency))?;
        self.frequency = benchlink_protocol::CLOCK_RATE as f64 / wavelength as f64 / prescaler as f64;
        let prescaler_idx = benchlink_protocol::prescaler_index(prescaler).unwrap_or(0) as u8;

        let mut duty_cycles = [0u16; 4];
        let mut phases = [0u16; 4];
        for (i, &name) in CHANNELS.iter().enumerate() {
            let ch = &self.channels[name];
            let duty = ((ch.duty_cycle + ch.phase) % 1.0 * wavelength as f64) as i64;
            duty_cycles[i] = duty.saturating_sub(1).max(1) as u16;
            let phase = (ch.phase % 1.0 * wavelength as f64) as i64;
            phases[i] = phase.saturating_sub(1).max(0) as u16;
        }

        let mut t = self.transport.borrow_mut();
        t.send_u8(Primary::Wavegen.into())?;
        t.send_u8(wavegen::SQR4)?;
        t.send_u16(wavelength - 1)?;
        t.send_u16(duty_cycles[0])?;
        t.send_u16(phases[1])?;
        t.send_u16(duty_cycles[1])?;
        t.send_u16(phases[2])?;
        t.send_u16(duty_cycles[2])?;
        t.send_u16(phases[3])?;
        t.send_u16(duty_cycles[3])?;
        t.send_u8(prescaler_idx | wavegen::CONTINUOUS)?;
        t.get_ack()?;
        Ok(())
    }

    /// Sets some channels to a static logic level, overriding any running PWM. A
    /// channel absent from `states` is left unchanged; a channel present with `false`
    /// is explicitly driven LOW, which is distinct on the wire from being left alone
    /// (its mask bit is still set, with the level bit clear).
    pub fn set_state(&mut self, states: &[(&str, bool)]) -> Result<()> {
        let mut arg = 0u8;
        for &(name, high) in states {
            self.channel(name)?;
            let index = CHANNELS.iter().position(|&c| c == name).expect("validated above");
            let mask = self.channel(name)?.state_mask();
            arg |= mask | ((high as u8) << index);
        }
        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(Primary::Dout.into())?;
            t.send_u8(benchlink_protocol::dout::SET_STATE)?;
            t.send_u8(arg)?;
            t.get_ack()?;
        }
        for &(name, high) in states {
            let ch = self.channel_mut(name)?;
            ch.state = if high { DigitalState::High } else { DigitalState::Low };
            ch.duty_cycle = if high { 1.0 } else { 0.0 };
        }
        Ok(())
    }

    /// Routes `channels` to the device's internal reference clock instead of their own
    /// generator. `prescaler` is the raw 0-15 shift sent to the firmware (output
    /// frequency is `128 MHz / (1 << prescaler)`), not an index into the generator's
    /// own prescaler ladder.
    pub fn map_reference_clock(&mut self, channels: &[&str], prescaler: u8) -> Result<()> {
        let mut maps = 0u8;
        for &name in channels {
            maps |= self.channel(name)?.reference_clock_map();
        }
        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(Primary::Wavegen.into())?;
            t.send_u8(wavegen::MAP_REFERENCE)?;
            t.send_u8(maps)?;
            t.send_u8(prescaler)?;
            t.get_ack()?;
        }
        self.reference_prescaler = prescaler;
        for &name in channels {
            let ch = self.channel_mut(name)?;
            ch.duty_cycle = 0.5;
            ch.phase = 0.0;
            ch.remapped = true;
            ch.state = DigitalState::Pwm;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::transport::test::Loopback;
    use crate::transport::{Transport, TransportConfig};

    fn harness() -> PwmGenerator<Loopback> {
        let transport = Rc::new(RefCell::new(Transport::from_stream(
            Loopback::new(),
            TransportConfig::default(),
        )));
        PwmGenerator::new(transport)
    }

    #[test]
    fn generate_rejects_duty_cycle_out_of_range() {
        let mut pwm = harness();
        assert!(pwm.generate(&["SQ1"], 1000.0, &[1.5], &[0.0]).is_err());
    }

    #[test]
    fn generate_rejects_phase_equal_to_one() {
        let mut pwm = harness();
        assert!(pwm.generate(&["SQ1"], 1000.0, &[0.5], &[1.0]).is_err());
    }

    #[test]
    fn generate_rejects_mismatched_slice_lengths() {
        let mut pwm = harness();
        assert!(pwm.generate(&["SQ1", "SQ2"], 1000.0, &[0.5], &[0.0, 0.0]).is_err());
    }

    #[test]
    fn generate_updates_channel_state_to_pwm() {
        let mut pwm = harness();
        // One ack for the SQR4 write, one for the set_state restore of SQ1/SQ3/SQ4
        // (left at their default LOW) that generate() always issues afterwards.
        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01, 0x01]);
        pwm.generate(&["SQ2"], 1000.0, &[0.25], &[0.0]).unwrap();
        let ch = pwm.channel("SQ2").unwrap();
        assert_eq!(ch.state, DigitalState::Pwm);
        assert_eq!(ch.duty_cycle, 0.25);
    }

    #[test]
    fn generate_always_sends_all_four_channels_in_one_sqr4_command() {
        let mut pwm = harness();
        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01, 0x01]);
        pwm.generate(&["SQ1"], 1000.0, &[0.5], &[0.0]).unwrap();
        let written = &pwm.transport.borrow().stream_for_test().written;
        // WAVEGEN, SQR4, wavelength-1 (u16), 7 interleaved duty/phase u16 fields, one
        // trailing prescaler|CONTINUOUS byte (2 + 2 + 7*2 + 1 = 19 bytes), followed by
        // a 3-byte set_state restore of SQ2/SQ3/SQ4 (left at their default LOW).
        assert_eq!(written.len(), 19 + 3);
        assert_eq!(written[0], u8::from(Primary::Wavegen));
        assert_eq!(written[1], wavegen::SQR4);
    }

    #[test]
    fn generate_restores_static_state_on_untouched_channels() {
        let mut pwm = harness();
        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        pwm.set_state(&[("SQ3", false)]).unwrap();

        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01, 0x01]);
        pwm.generate(&["SQ1"], 1000.0, &[0.5], &[0.0]).unwrap();

        let written = &pwm.transport.borrow().stream_for_test().written;
        // Last 3 bytes of the run are the DOUT+SET_STATE restoration triggered by
        // generate(); SQ3's mask bit (0x40) must be set with its level bit clear.
        let tail = &written[written.len() - 3..];
        assert_eq!(tail[0], u8::from(Primary::Dout));
        assert_eq!(tail[1], benchlink_protocol::dout::SET_STATE);
        assert_eq!(tail[2] & 0x40, 0x40);
        assert_eq!(tail[2] & (1 << 2), 0);
    }

    #[test]
    fn generate_remaps_previously_remapped_channels_after_sqr4() {
        let mut pwm = harness();
        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        pwm.map_reference_clock(&["SQ4"], 3).unwrap();

        // SQR4, the set_state restore for SQ2/SQ3 (still at their default LOW), and
        // the re-map of SQ4 each consume one ack.
        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01, 0x01, 0x01]);
        pwm.generate(&["SQ1"], 1000.0, &[0.5], &[0.0]).unwrap();

        let written = &pwm.transport.borrow().stream_for_test().written;
        let tail = &written[written.len() - 4..];
        assert_eq!(tail[0], u8::from(Primary::Wavegen));
        assert_eq!(tail[1], wavegen::MAP_REFERENCE);
        assert_eq!(tail[2], 8); // SQ4's reference_clock_map bit
        assert_eq!(tail[3], 3); // stored reference_prescaler
    }

    #[test]
    fn set_state_composes_multiple_channels_into_one_byte() {
        let mut pwm = harness();
        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        pwm.set_state(&[("SQ1", true), ("SQ3", false)]).unwrap();
        assert_eq!(pwm.channel("SQ1").unwrap().state, DigitalState::High);
        assert_eq!(pwm.channel("SQ3").unwrap().state, DigitalState::Low);

        let written = &pwm.transport.borrow().stream_for_test().written;
        // SQ1 HIGH: mask 0x10 | (1 << 0); SQ3 LOW: mask 0x40 | (0 << 2).
        assert_eq!(written[2], 0x10 | 0x01 | 0x40);
    }

    #[test]
    fn map_reference_clock_sends_the_trailing_prescaler_byte() {
        let mut pwm = harness();
        pwm.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        pwm.map_reference_clock(&["SQ3"], 5).unwrap();
        assert!(pwm.channel("SQ3").unwrap().remapped);

        let written = &pwm.transport.borrow().stream_for_test().written;
        assert_eq!(written, &[u8::from(Primary::Wavegen), wavegen::MAP_REFERENCE, 4, 5]);
    }
}
