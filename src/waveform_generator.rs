// SPDX-License-Identifier: GPL-3.0-or-later

//! Waveform generator (§4.7): two analog output channels (`SI1`, `SI2`) driven from a
//! 512-point lookup table, with a low-resolution fallback above 1100 Hz.

use std::collections::HashMap;

use benchlink_protocol::{wavegen, Primary};
use log::warn;

use crate::channel::{sine_table, tria_table, AnalogOutput, WaveType};
use crate::error::{Error, Result};
use crate::transport::Port;
use crate::SharedTransport;

const HIGHRES_TABLE_SIZE: u32 = 512;
const LOWRES_TABLE_SIZE: u32 = 32;
const HIGHRES_FREQUENCY_LIMIT: f64 = 1100.0;
const LOW_FREQUENCY_WARNING: f64 = 20.0;
const LOW_FREQUENCY_LIMIT: f64 = 0.1;
const HIGH_FREQUENCY_WARNING: f64 = 5e3;
const HIGH_FREQUENCY_LIMIT: f64 = 1e7;

const CHANNELS: [&str; 2] = ["SI1", "SI2"];

pub struct WaveformGenerator<P: Port> {
    transport: SharedTransport<P>,
    channels: HashMap<&'static str, AnalogOutput>,
}

impl<P: Port> WaveformGenerator<P> {
    pub fn new(transport: SharedTransport<P>) -> Self {
        let mut channels = HashMap::new();
        for &name in CHANNELS.iter() {
            channels.insert(name, AnalogOutput::new(name));
        }
        WaveformGenerator { transport, channels }
    }

    pub fn channel(&self, name: &str) -> Result<&AnalogOutput> {
        self.channels
            .get(name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown output channel {}", name)))
    }

    fn channel_mut(&mut self, name: &str) -> Result<&mut AnalogOutput> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| Error::ArgumentError(format!("unknown output channel {}", name)))
    }

    /// Loads one of the two built-in shapes.
    pub fn load_equation(&mut self, name: &str, wavetype: WaveType) -> Result<()> {
        let points = match wavetype {
            WaveType::Sine => sine_table(),
            WaveType::Tria => tria_table(),
            WaveType::Custom => {
                return Err(Error::ArgumentError(
                    "load_equation only accepts Sine or Tria; use load_table for a custom shape".into(),
                ))
            }
        };
        self.channel_mut(name)?.load_table(wavetype, &points)
    }

    /// Loads an arbitrary 512-point table and transmits it to the device.
    pub fn load_table(&mut self, name: &str, points: &[f64]) -> Result<()> {
        self.channel_mut(name)?.load_table(WaveType::Custom, points)?;
        self.transmit_table(name)
    }

    fn transmit_table(&mut self, name: &str) -> Result<()> {
        let channel = self.channel(name)?;
        let hires = channel.hires_table();
        let lowres = channel.lowres_table();
        let opcode = match name {
            "SI1" => wavegen::LOAD_WAVEFORM1,
            "SI2" => wavegen::LOAD_WAVEFORM2,
            _ => return Err(Error::ArgumentError(format!("unknown output channel {}", name))),
        };
        let mut t = self.transport.borrow_mut();
        t.send_u8(Primary::Wavegen.into())?;
        t.send_u8(opcode)?;
        for point in hires {
            t.send_u16(point)?;
        }
        for point in lowres {
            t.send_u8(point)?;
        }
        t.get_ack()?;
        Ok(())
    }

    fn table_size_for(frequency: f64) -> u32 {
        if frequency > HIGHRES_FREQUENCY_LIMIT {
            LOWRES_TABLE_SIZE
        } else {
            HIGHRES_TABLE_SIZE
        }
    }

    fn validate_frequency(frequency: f64) -> Result<()> {
        if frequency < LOW_FREQUENCY_LIMIT || frequency > HIGH_FREQUENCY_LIMIT {
            return Err(Error::FrequencyOutOfRange(frequency));
        }
        if frequency < LOW_FREQUENCY_WARNING {
            warn!("{} Hz is a very low waveform frequency; expect visible steps", frequency);
        }
        if frequency > HIGH_FREQUENCY_WARNING {
            warn!("{} Hz is a very high waveform frequency; expect reduced fidelity", frequency);
        }
        Ok(())
    }

    /// Starts a single channel generating continuously at `frequency`.
    pub fn generate(&mut self, name: &str, frequency: f64) -> Result<()> {
        Self::validate_frequency(frequency)?;
        let table_size = Self::table_size_for(frequency);
        let (ticks, prescaler) =
            benchlink_protocol::wavelength(frequency, table_size).ok_or(Error::FrequencyOutOfRange(frequency))?;
        let prescaler_idx = benchlink_protocol::prescaler_index(prescaler).unwrap_or(0) as u8;

        let opcode = match name {
            "SI1" => wavegen::SET_SINE1,
            "SI2" => wavegen::SET_SINE2,
            _ => return Err(Error::ArgumentError(format!("unknown output channel {}", name))),
        };
        let highres = u8::from(table_size == HIGHRES_TABLE_SIZE);
        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(Primary::Wavegen.into())?;
            t.send_u8(opcode)?;
            t.send_u8(highres | (prescaler_idx << 1))?;
            t.send_u16(ticks - 1)?;
            t.get_ack()?;
        }
        self.channel_mut(name)?.frequency = frequency;
        Ok(())
    }

    /// Starts both channels generating simultaneously, sharing one table size, with
    /// SI2 shifted from SI1 by `phase` degrees (`[0, 360)`).
    pub fn generate_both(&mut self, frequency1: f64, frequency2: f64, phase: f64) -> Result<()> {
        Self::validate_frequency(frequency1)?;
        Self::validate_frequency(frequency2)?;
        if !(0.0..360.0).contains(&phase) {
            return Err(Error::ArgumentError(format!("phase must be in [0, 360) degrees, got {}", phase)));
        }
        let table_size = Self::table_size_for(frequency1.max(frequency2));
        let (ticks1, prescaler1) =
            benchlink_protocol::wavelength(frequency1, table_size).ok_or(Error::FrequencyOutOfRange(frequency1))?;
        let (ticks2, prescaler2) =
            benchlink_protocol::wavelength(frequency2, table_size).ok_or(Error::FrequencyOutOfRange(frequency2))?;
        let idx1 = benchlink_protocol::prescaler_index(prescaler1).unwrap_or(0) as u8;
        let idx2 = benchlink_protocol::prescaler_index(prescaler2).unwrap_or(0) as u8;
        let highres = u8::from(table_size == HIGHRES_TABLE_SIZE);

        // Table position for the phase adjust, plus a timer-delay fine adjust to
        // cover the remainder the table's resolution can't express.
        let table_size_f = table_size as f64;
        let phase_coarse = (table_size_f * phase / 360.0) as u16;
        let phase_fine =
            (ticks2 as f64 * (phase - phase_coarse as f64 * 360.0 / table_size_f) / (360.0 / table_size_f)) as u16;

        {
            let mut t = self.transport.borrow_mut();
            t.send_u8(Primary::Wavegen.into())?;
            t.send_u8(wavegen::SET_BOTH_WG)?;
            t.send_u16(ticks1 - 1)?;
            t.send_u16(ticks2 - 1)?;
            t.send_u16(phase_coarse)?;
            t.send_u16(phase_fine)?;
            t.send_u8((idx2 << 4) | (idx1 << 2) | (highres << 1) | highres)?;
            t.get_ack()?;
        }
        self.channel_mut("SI1")?.frequency = frequency1;
        self.channel_mut("SI2")?.frequency = frequency2;
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

    fn harness() -> WaveformGenerator<Loopback> {
        let transport = Rc::new(RefCell::new(Transport::from_stream(
            Loopback::new(),
            TransportConfig::default(),
        )));
        WaveformGenerator::new(transport)
    }

    #[test]
    fn table_size_switches_at_highres_limit() {
        assert_eq!(WaveformGenerator::<Loopback>::table_size_for(100.0), HIGHRES_TABLE_SIZE);
        assert_eq!(WaveformGenerator::<Loopback>::table_size_for(2000.0), LOWRES_TABLE_SIZE);
    }

    #[test]
    fn validate_frequency_rejects_out_of_range() {
        assert!(WaveformGenerator::<Loopback>::validate_frequency(0.0).is_err());
        assert!(WaveformGenerator::<Loopback>::validate_frequency(1e8).is_err());
        assert!(WaveformGenerator::<Loopback>::validate_frequency(1000.0).is_ok());
    }

    #[test]
    fn generate_rejects_unknown_channel() {
        let mut wg = harness();
        assert!(wg.generate("SI9", 1000.0).is_err());
    }

    #[test]
    fn load_equation_rejects_custom() {
        let mut wg = harness();
        assert!(wg.load_equation("SI1", WaveType::Custom).is_err());
    }

    #[test]
    fn generate_sends_ack_and_records_frequency() {
        let mut wg = harness();
        wg.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        wg.generate("SI1", 1000.0).unwrap();
        assert_eq!(wg.channel("SI1").unwrap().frequency, 1000.0);
    }

    #[test]
    fn generate_sends_highres_bit_ored_with_prescaler_and_ticks_minus_one() {
        let mut wg = harness();
        wg.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        wg.generate("SI1", 1000.0).unwrap();

        let (ticks, prescaler) = benchlink_protocol::wavelength(1000.0, HIGHRES_TABLE_SIZE).unwrap();
        let idx = benchlink_protocol::prescaler_index(prescaler).unwrap() as u8;
        let written = &wg.transport.borrow().stream_for_test().written;
        assert_eq!(written[0], u8::from(Primary::Wavegen));
        assert_eq!(written[1], wavegen::SET_SINE1);
        assert_eq!(written[2], 1 | (idx << 1));
        assert_eq!(benchlink_protocol::unpack_u16(&written[3..5]), ticks - 1);
    }

    #[test]
    fn transmit_table_sends_both_hires_and_lowres_tables() {
        let mut wg = harness();
        wg.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        wg.load_table("SI1", &sine_table()).unwrap();

        let written = &wg.transport.borrow().stream_for_test().written;
        // WAVEGEN, LOAD_WAVEFORM1, 512 u16 hires points, 32 u8 lowres points.
        assert_eq!(written.len(), 2 + 512 * 2 + 32);
        assert_eq!(written[0], u8::from(Primary::Wavegen));
        assert_eq!(written[1], wavegen::LOAD_WAVEFORM1);
    }

    #[test]
    fn generate_both_rejects_phase_out_of_range() {
        let mut wg = harness();
        assert!(wg.generate_both(1000.0, 1000.0, 360.0).is_err());
        assert!(wg.generate_both(1000.0, 1000.0, -1.0).is_err());
    }

    #[test]
    fn generate_both_sends_four_u16_fields_before_the_composite_byte() {
        let mut wg = harness();
        wg.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        wg.generate_both(1000.0, 1000.0, 90.0).unwrap();

        let written = &wg.transport.borrow().stream_for_test().written;
        // WAVEGEN, SET_BOTH_WG, then ticks1-1/ticks2-1/phase_coarse/phase_fine (4 u16
        // fields), then one trailing composite prescaler/highres byte.
        assert_eq!(written.len(), 2 + 4 * 2 + 1);
        assert_eq!(written[0], u8::from(Primary::Wavegen));
        assert_eq!(written[1], wavegen::SET_BOTH_WG);

        let (ticks1, _) = benchlink_protocol::wavelength(1000.0, HIGHRES_TABLE_SIZE).unwrap();
        assert_eq!(benchlink_protocol::unpack_u16(&written[2..4]), ticks1 - 1);
        assert_eq!(benchlink_protocol::unpack_u16(&written[4..6]), ticks1 - 1);
        let phase_coarse = (HIGHRES_TABLE_SIZE as f64 * 90.0 / 360.0) as u16;
        assert_eq!(benchlink_protocol::unpack_u16(&written[6..8]), phase_coarse);
    }
}
