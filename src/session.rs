// SPDX-License-Identifier: GPL-3.0-or-later

//! `Session` (§3, §4.1): owns one transport and every instrument that shares it. This
//! is the crate's one entry point for normal use; instruments are only ever
//! constructed already wired to a [`SharedTransport`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::logic_analyzer::LogicAnalyzer;
use crate::multimeter::Multimeter;
use crate::oscilloscope::Oscilloscope;
use crate::power_supply::PowerSupply;
use crate::pwm_generator::PwmGenerator;
use crate::transport::{Port, Transport, TransportConfig};
use crate::waveform_generator::WaveformGenerator;
use crate::SharedTransport;

pub struct Session<P: Port> {
    transport: SharedTransport<P>,
    multimeter: Multimeter<P>,
    logic_analyzer: LogicAnalyzer<P>,
    waveform_generator: WaveformGenerator<P>,
    pwm_generator: PwmGenerator<P>,
    power_supply: PowerSupply<P>,
}

impl<P: Port> Session<P> {
    /// Wraps an already-open [`Transport`] and constructs every instrument on top of
    /// it. Used directly by tests; real callers go through [`connect`].
    pub fn from_transport(transport: Transport<P>) -> Result<Self> {
        let transport: SharedTransport<P> = Rc::new(RefCell::new(transport));
        let scope = Oscilloscope::new(transport.clone())?;
        Ok(Session {
            multimeter: Multimeter::new(scope)?,
            logic_analyzer: LogicAnalyzer::new(transport.clone())?,
            waveform_generator: WaveformGenerator::new(transport.clone()),
            pwm_generator: PwmGenerator::new(transport.clone()),
            power_supply: PowerSupply::new(transport.clone()),
            transport,
        })
    }

    pub fn oscilloscope(&self) -> &Oscilloscope<P> {
        self.multimeter.oscilloscope()
    }

    pub fn oscilloscope_mut(&mut self) -> &mut Oscilloscope<P> {
        self.multimeter.oscilloscope_mut()
    }

    pub fn multimeter(&mut self) -> &mut Multimeter<P> {
        &mut self.multimeter
    }

    pub fn logic_analyzer(&mut self) -> &mut LogicAnalyzer<P> {
        &mut self.logic_analyzer
    }

    pub fn waveform_generator(&mut self) -> &mut WaveformGenerator<P> {
        &mut self.waveform_generator
    }

    pub fn pwm_generator(&mut self) -> &mut PwmGenerator<P> {
        &mut self.pwm_generator
    }

    pub fn power_supply(&mut self) -> &mut PowerSupply<P> {
        &mut self.power_supply
    }

    pub fn is_connected(&self) -> bool {
        self.transport.borrow().is_connected()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.transport.borrow().firmware_version().map(str::to_owned)
    }

    pub fn disconnect(&mut self) {
        self.transport.borrow_mut().disconnect();
    }
}

/// Opens the real serial device (autodetecting if `config.port` is `None`) and returns
/// a fully-wired [`Session`].
pub fn connect(config: TransportConfig) -> Result<Session<Box<dyn serialport::SerialPort>>> {
    let transport = crate::transport::connect(config)?;
    Session::from_transport(transport)
}

/// Disconnects and re-opens the device with the same configuration.
pub fn reconnect(
    session: Session<Box<dyn serialport::SerialPort>>,
) -> Result<Session<Box<dyn serialport::SerialPort>>> {
    let config = session.transport.borrow().config().clone();
    drop(session);
    connect(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::test::Loopback;

    fn harness() -> Session<Loopback> {
        let transport = Transport::from_stream(Loopback::new(), TransportConfig::default());
        Session::from_transport(transport).unwrap()
    }

    #[test]
    fn session_wires_every_instrument_to_the_same_transport() {
        let session = harness();
        assert!(session.is_connected());
    }

    #[test]
    fn disconnect_propagates_to_every_instrument_view() {
        let mut session = harness();
        session.disconnect();
        assert!(!session.is_connected());
    }
}
