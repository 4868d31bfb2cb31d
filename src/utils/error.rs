//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for the mutual exclusion service. The variant tells
/// how the error should be treated: `Config` errors are fatal at startup,
/// `Anomaly` errors are logged and the offending input dropped, `Transport`
/// errors stop the affected node's progress.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MaekawaError {
    /// Invalid startup configuration (quorum table, CLI args, TOML).
    Config(String),

    /// Protocol anomaly such as a mismatched RELEASE or duplicate REQUEST.
    Anomaly(String),

    /// Link failure or wire codec failure.
    Transport(String),

    /// Any other internal error.
    Msg(String),
}

impl MaekawaError {
    pub fn msg(msg: impl ToString) -> Self {
        MaekawaError::Msg(msg.to_string())
    }

    pub fn config(msg: impl ToString) -> Self {
        MaekawaError::Config(msg.to_string())
    }

    pub fn anomaly(msg: impl ToString) -> Self {
        MaekawaError::Anomaly(msg.to_string())
    }

    pub fn transport(msg: impl ToString) -> Self {
        MaekawaError::Transport(msg.to_string())
    }

    /// Returns true if this error is a dropped-message protocol anomaly.
    #[inline]
    pub fn is_anomaly(&self) -> bool {
        matches!(self, MaekawaError::Anomaly(_))
    }
}

impl fmt::Display for MaekawaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // do not display literal quotes
        match self {
            MaekawaError::Config(s) => write!(f, "config error: {}", s),
            MaekawaError::Anomaly(s) => write!(f, "protocol anomaly: {}", s),
            MaekawaError::Transport(s) => write!(f, "transport error: {}", s),
            MaekawaError::Msg(s) => write!(f, "{}", s),
        }
    }
}

impl error::Error for MaekawaError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `MaekawaError`.
macro_rules! impl_from_error {
    ($error:ty => $variant:ident) => {
        impl From<$error> for MaekawaError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MaekawaError::$variant(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `MaekawaError`.
macro_rules! impl_from_error_generic {
    ($error:ty => $variant:ident) => {
        impl<T> From<$error> for MaekawaError {
            fn from(e: $error) -> MaekawaError {
                MaekawaError::$variant(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error => Transport);
impl_from_error!(rmp_serde::encode::Error => Transport);
impl_from_error!(rmp_serde::decode::Error => Transport);
impl_from_error!(num::ParseIntError => Config);
impl_from_error!(net::AddrParseError => Config);
impl_from_error!(toml::de::Error => Config);
impl_from_error!(ctrlc::Error => Msg);
impl_from_error!(tokio::sync::oneshot::error::RecvError => Msg);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T> => Msg);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T> => Msg);
