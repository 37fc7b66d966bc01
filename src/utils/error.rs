//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;

/// Customized error type for the CoPilot client.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CopilotError(pub(crate) String);

impl CopilotError {
    pub fn msg(msg: impl ToString) -> Self {
        CopilotError(msg.to_string())
    }
}

impl fmt::Display for CopilotError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for CopilotError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `CopilotError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CopilotError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                CopilotError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `CopilotError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for CopilotError {
            fn from(e: $error) -> CopilotError {
                CopilotError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::de::Error);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = CopilotError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::UnexpectedEof, "oh no!");
        let e = CopilotError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_addr_parse_error() {
        let e: CopilotError =
            "not-an-addr".parse::<net::SocketAddr>().unwrap_err().into();
        assert!(!e.0.is_empty());
    }
}
