// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire-protocol constants shared by every instrument in the benchlink core.
//!
//! The numeric values below form a closed, self-consistent set invented for this
//! implementation (the firmware's own opcode table was not available while this crate
//! was written); what matters for callers is that every opcode named by a component is
//! present here exactly once and that primary/secondary pairs round-trip bit-for-bit.

use std::convert::TryFrom;

/// The device's fixed system clock, in Hz. Every timegap and prescaler computation is
/// derived from this constant.
pub const CLOCK_RATE: u32 = 64_000_000;

/// Capacity of the device's single linear ADC sample buffer, in 16-bit slots.
pub const MAX_SAMPLES: u16 = 10_000;

/// Divisors applied to [`CLOCK_RATE`] before it drives a 16-bit counter. Shared by the
/// waveform generator, the PWM generator and the logic analyzer's 4-channel capture.
pub const PRESCALERS: [u32; 4] = [1, 8, 64, 256];

/// USB VID:PID pairs recognised by the autodetect helper (out of scope here, but the
/// pairs themselves are part of the wire-level contract §6.2).
pub const USB_IDS: [(u16, u16); 2] = [(0x04D8, 0x00DF), (0x10C4, 0xEA60)];

/// Bit 0 of an ack byte; clear means the firmware rejected the preceding request.
pub const ACK_BIT: u8 = 0x01;

/// Primary opcode: the first byte of every request, selecting which subsystem on the
/// device interprets the secondary opcode and arguments that follow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Primary {
    Adc,
    Timing,
    Din,
    Dout,
    Wavegen,
    Dac,
    Common,
    I2c,
    Spi,
    Uart2,
    Flash,
    Nrfl01,
    Passthroughs,
    NonstandardIo,
    Unknown(u8),
}

impl Primary {
    const ADC: u8 = 1;
    const TIMING: u8 = 2;
    const DIN: u8 = 3;
    const DOUT: u8 = 4;
    const WAVEGEN: u8 = 5;
    const DAC: u8 = 6;
    const COMMON: u8 = 7;
    const I2C: u8 = 8;
    const SPI: u8 = 9;
    const UART2: u8 = 10;
    const FLASH: u8 = 11;
    const NRFL01: u8 = 12;
    const PASSTHROUGHS: u8 = 13;
    const NONSTANDARD_IO: u8 = 14;
}

impl From<u8> for Primary {
    fn from(val: u8) -> Self {
        match val {
            Primary::ADC => Primary::Adc,
            Primary::TIMING => Primary::Timing,
            Primary::DIN => Primary::Din,
            Primary::DOUT => Primary::Dout,
            Primary::WAVEGEN => Primary::Wavegen,
            Primary::DAC => Primary::Dac,
            Primary::COMMON => Primary::Common,
            Primary::I2C => Primary::I2c,
            Primary::SPI => Primary::Spi,
            Primary::UART2 => Primary::Uart2,
            Primary::FLASH => Primary::Flash,
            Primary::NRFL01 => Primary::Nrfl01,
            Primary::PASSTHROUGHS => Primary::Passthroughs,
            Primary::NONSTANDARD_IO => Primary::NonstandardIo,
            _ => Primary::Unknown(val),
        }
    }
}

impl From<Primary> for u8 {
    fn from(primary: Primary) -> Self {
        match primary {
            Primary::Adc => Primary::ADC,
            Primary::Timing => Primary::TIMING,
            Primary::Din => Primary::DIN,
            Primary::Dout => Primary::DOUT,
            Primary::Wavegen => Primary::WAVEGEN,
            Primary::Dac => Primary::DAC,
            Primary::Common => Primary::COMMON,
            Primary::I2c => Primary::I2C,
            Primary::Spi => Primary::SPI,
            Primary::Uart2 => Primary::UART2,
            Primary::Flash => Primary::FLASH,
            Primary::Nrfl01 => Primary::NRFL01,
            Primary::Passthroughs => Primary::PASSTHROUGHS,
            Primary::NonstandardIo => Primary::NONSTANDARD_IO,
            Primary::Unknown(val) => val,
        }
    }
}

/// Secondary opcodes under [`Primary::Adc`]: single-shot voltage/capture control.
pub mod adc {
    pub const SET_PGA_GAIN: u8 = 1;
    pub const CAPTURE_ONE: u8 = 2;
    pub const CAPTURE_TWO: u8 = 3;
    pub const CAPTURE_FOUR: u8 = 4;
    pub const CAPTURE_DMASPEED: u8 = 5;
    pub const GET_CAPTURE_STATUS: u8 = 6;
    pub const CONFIGURE_TRIGGER: u8 = 7;
    pub const GET_VOLTAGE_SUMMED: u8 = 8;
    pub const SET_CAP: u8 = 9;

    /// OR-masked into the capture secondary opcode/mux byte to request 12-bit mode.
    pub const DMASPEED_BIT: u8 = 0x80;
    /// OR-masked into a capture secondary opcode to arm the configured trigger.
    pub const TRIGGER_BIT: u8 = 0x80;
}

/// Secondary opcodes under [`Primary::Timing`]: logic analyzer capture/fetch control.
pub mod timing {
    pub const START_ALTERNATE_ONE_CHAN_LA: u8 = 1;
    pub const START_TWO_CHAN_LA: u8 = 2;
    pub const START_FOUR_CHAN_LA: u8 = 3;
    pub const FETCH_LONG_DMA_DATA: u8 = 4;
    pub const FETCH_INT_DMA_DATA: u8 = 5;
    pub const STOP_LA: u8 = 6;
    pub const GET_ALTERNATE_HIGH_FREQUENCY: u8 = 7;
    pub const GET_FREQUENCY: u8 = 8;
}

/// Secondary opcodes under [`Primary::Dout`].
pub mod dout {
    pub const SET_STATE: u8 = 1;
}

/// Secondary opcodes under [`Primary::Wavegen`].
pub mod wavegen {
    pub const SET_SINE1: u8 = 1;
    pub const SET_SINE2: u8 = 2;
    pub const SET_BOTH_WG: u8 = 3;
    pub const LOAD_WAVEFORM1: u8 = 4;
    pub const LOAD_WAVEFORM2: u8 = 5;
    pub const SQR4: u8 = 6;
    pub const MAP_REFERENCE: u8 = 7;

    /// OR-masked continuous-mode bit for [`SQR4`]'s trailing prescaler byte.
    pub const CONTINUOUS: u8 = 0x20;
}

/// Secondary opcodes under [`Primary::Dac`].
pub mod dac {
    pub const SET_POWER: u8 = 1;
}

/// Secondary opcodes under [`Primary::Common`]: buffer façade and shared counters.
pub mod common {
    pub const RETRIEVE_BUFFER: u8 = 1;
    pub const CLEAR_BUFFER: u8 = 2;
    pub const FILL_BUFFER: u8 = 3;
    pub const GET_CAPACITANCE: u8 = 4;
    pub const START_COUNTING: u8 = 5;
    pub const FETCH_COUNT: u8 = 6;
    pub const GET_VERSION: u8 = 7;
}

/// Pack an unsigned integer into little-endian bytes.
pub fn pack_u16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Pack an unsigned integer into little-endian bytes.
pub fn pack_u32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Unpack a little-endian `u16`. Panics if `bytes` is shorter than 2 -- callers are
/// expected to have already validated the read length against [`crate::Error::ShortRead`]
/// equivalents in the layer above; this module has no error type of its own.
pub fn unpack_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    u16::from_le_bytes(buf)
}

/// Unpack a little-endian `u32`.
pub fn unpack_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Index of `prescaler` within [`PRESCALERS`], if present.
pub fn prescaler_index(prescaler: u32) -> Option<usize> {
    PRESCALERS.iter().position(|&p| p == prescaler)
}

/// Pick the smallest prescaler in [`PRESCALERS`] such that `clock / (frequency *
/// prescaler * table_size)` rounds to a value in `[1, 65535]`. This is the single
/// source of truth for waveform-generator, PWM-generator and 4-channel logic-analyzer
/// timing (invariant I5 / §4.9).
pub fn wavelength(frequency: f64, table_size: u32) -> Option<(u16, u32)> {
    for &prescaler in PRESCALERS.iter() {
        let divisor = frequency * prescaler as f64 * table_size as f64;
        if divisor <= 0.0 {
            continue;
        }
        let timegap = (CLOCK_RATE as f64 / divisor).round();
        if timegap > 0.0 && timegap < 65536.0 {
            return u16::try_from(timegap as i64).ok().map(|w| (w, prescaler));
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_roundtrip() {
        for &val in &[1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14] {
            assert_eq!(val, u8::from(Primary::from(val)));
        }
        assert_eq!(0xff, u8::from(Primary::from(0xff)));
    }

    #[test]
    fn wavelength_picks_smallest_prescaler() {
        let (w, p) = wavelength(1000.0, 512).unwrap();
        assert_eq!(p, 1);
        assert_eq!(w, (CLOCK_RATE as f64 / (1000.0 * 512.0)).round() as u16);
    }

    #[test]
    fn wavelength_escalates_prescaler_for_low_frequency() {
        let (w, p) = wavelength(1.0, 512).unwrap();
        assert!(p > 1);
        assert!((w as u32) < 65536);
    }

    #[test]
    fn wavelength_out_of_range_fails() {
        assert!(wavelength(0.0, 512).is_none());
    }

    #[test]
    fn pack_unpack_roundtrip() {
        assert_eq!(unpack_u16(&pack_u16(0xBEEF)), 0xBEEF);
        assert_eq!(unpack_u32(&pack_u32(0xDEAD_BEEF)), 0xDEAD_BEEF);
    }
}
