// SPDX-License-Identifier: GPL-3.0-or-later

//! Host-side control library for a USB-connected mixed-signal measurement board.
//!
//! A [`Session`] owns one [`Transport`](transport::Transport) and the instruments that
//! share it: [`Oscilloscope`](oscilloscope::Oscilloscope), [`Multimeter`](multimeter::Multimeter),
//! [`LogicAnalyzer`](logic_analyzer::LogicAnalyzer), [`WaveformGenerator`](waveform_generator::WaveformGenerator),
//! [`PwmGenerator`](pwm_generator::PwmGenerator) and [`PowerSupply`](power_supply::PowerSupply).

pub mod buffer;
pub mod channel;
pub mod error;
pub mod logic_analyzer;
pub mod multimeter;
pub mod oscilloscope;
pub mod power_supply;
pub mod pwm_generator;
pub mod session;
pub mod transport;
pub mod waveform_generator;

use std::cell::RefCell;
use std::rc::Rc;

pub use error::{Error, Result};
pub use session::{connect, reconnect, Session};
pub use transport::{Port, Transport, TransportConfig};

/// Every instrument holds a clone of this handle. `Rc<RefCell<_>>`, not `Arc<Mutex<_>>`:
/// the transport holds stateful partial-protocol position (pending ack, in-flight
/// capture), and the crate is deliberately `!Send` in effect (§5) rather than papering
/// over cross-thread access with a lock that would hide an I7 violation.
pub type SharedTransport<P> = Rc<RefCell<Transport<P>>>;
