// SPDX-License-Identifier: GPL-3.0-or-later

//! Power supply (§4.10, added): four fixed-range DAC outputs. Unlike every other
//! analog setter in this crate, out-of-range inputs are clamped rather than rejected
//! (I9) -- a physical safety bound, not an input-validation error.

use benchlink_protocol::{dac, Primary};

use crate::error::Result;
use crate::transport::Port;
use crate::SharedTransport;

const REFERENCE: u16 = 3300;

struct Rail {
    dac_channel: u8,
    range: (f64, f64),
}

const PV1: Rail = Rail { dac_channel: 3, range: (-5.0, 5.0) };
const PV2: Rail = Rail { dac_channel: 2, range: (-3.3, 3.3) };
const PV3: Rail = Rail { dac_channel: 1, range: (0.0, 3.3) };
const PCS: Rail = Rail { dac_channel: 0, range: (3.3e-3, 0.0) };

fn bound(value: f64, range: (f64, f64)) -> f64 {
    let (lo, hi) = (range.0.min(range.1), range.0.max(range.1));
    value.max(lo).min(hi)
}

/// Linear map from a rail's physical range onto `[0, REFERENCE]` DAC codes.
fn scale(value: f64, range: (f64, f64)) -> u16 {
    let (lo, hi) = range;
    let fraction = (value - lo) / (hi - lo);
    (fraction * REFERENCE as f64).round().max(0.0).min(REFERENCE as f64) as u16
}

pub struct PowerSupply<P: Port> {
    transport: SharedTransport<P>,
    pv1: f64,
    pv2: f64,
    pv3: f64,
    pcs: f64,
}

impl<P: Port> PowerSupply<P> {
    pub fn new(transport: SharedTransport<P>) -> Self {
        PowerSupply {
            transport,
            pv1: 0.0,
            pv2: 0.0,
            pv3: 0.0,
            pcs: 0.0,
        }
    }

    fn set_power(&mut self, rail: &Rail, voltage: f64) -> Result<f64> {
        let clamped = bound(voltage, rail.range);
        let code = scale(clamped, rail.range);
        let mut t = self.transport.borrow_mut();
        t.send_u8(Primary::Dac.into())?;
        t.send_u8(dac::SET_POWER)?;
        t.send_u8(rail.dac_channel)?;
        t.send_u16(code)?;
        t.get_ack()?;
        Ok(clamped)
    }

    /// Bipolar rail, `[-5, 5]` V.
    pub fn set_pv1(&mut self, voltage: f64) -> Result<()> {
        self.pv1 = self.set_power(&PV1, voltage)?;
        Ok(())
    }

    /// Bipolar rail, `[-3.3, 3.3]` V.
    pub fn set_pv2(&mut self, voltage: f64) -> Result<()> {
        self.pv2 = self.set_power(&PV2, voltage)?;
        Ok(())
    }

    /// Unipolar rail, `[0, 3.3]` V.
    pub fn set_pv3(&mut self, voltage: f64) -> Result<()> {
        self.pv3 = self.set_power(&PV3, voltage)?;
        Ok(())
    }

    /// Current source, `[0, 3.3]` mA. The firmware's range is stored inverted
    /// (`(3.3e-3, 0.0)`), so full current corresponds to DAC code zero.
    pub fn set_pcs(&mut self, current: f64) -> Result<()> {
        self.pcs = self.set_power(&PCS, current)?;
        Ok(())
    }

    pub fn pv1(&self) -> f64 {
        self.pv1
    }

    pub fn pv2(&self) -> f64 {
        self.pv2
    }

    pub fn pv3(&self) -> f64 {
        self.pv3
    }

    pub fn pcs(&self) -> f64 {
        self.pcs
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::transport::test::Loopback;
    use crate::transport::{Transport, TransportConfig};

    fn harness() -> PowerSupply<Loopback> {
        let transport = Rc::new(RefCell::new(Transport::from_stream(
            Loopback::new(),
            TransportConfig::default(),
        )));
        PowerSupply::new(transport)
    }

    #[test]
    fn set_pv1_clamps_rather_than_rejects_out_of_range() {
        let mut ps = harness();
        ps.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        ps.set_pv1(50.0).unwrap();
        assert_eq!(ps.pv1(), 5.0);
    }

    #[test]
    fn set_pv3_clamps_negative_input_to_zero() {
        let mut ps = harness();
        ps.transport.borrow_mut().stream_for_test().queue(&[0x01]);
        ps.set_pv3(-1.0).unwrap();
        assert_eq!(ps.pv3(), 0.0);
    }

    #[test]
    fn scale_maps_range_endpoints_to_dac_extremes() {
        assert_eq!(scale(-5.0, PV1.range), 0);
        assert_eq!(scale(5.0, PV1.range), REFERENCE);
    }

    #[test]
    fn scale_handles_inverted_pcs_range() {
        assert_eq!(scale(0.0, PCS.range), REFERENCE);
        assert_eq!(scale(3.3e-3, PCS.range), 0);
    }
}
