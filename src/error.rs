// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;

/// Every fallible operation in this crate returns this error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("missing ack: device returned {0:#04x}")]
    MissingAck(u8),

    #[error("invalid argument: {0}")]
    ArgumentError(String),

    #[error("capture timed out after {0:?}")]
    CaptureTimeout(std::time::Duration),

    #[error("no (wavelength, prescaler) pair reproduces {0} Hz")]
    FrequencyOutOfRange(f64),

    #[error("timegap {0} us is smaller than the minimum for this capture mode")]
    TimegapTooSmall(f64),

    #[error("requested interval exceeds the largest representable timegap")]
    TimegapTooLarge,

    #[error("channel {0} does not support triggering in this capture mode")]
    TriggerNotSupportedOnChannel(String),

    #[error("channel {0} does not support this operation")]
    NotSupported(String),

    #[error("firmware does not support this feature: {0}")]
    FirmwareFeatureMissing(String),
}

pub type Result<T> = std::result::Result<T, Error>;
