//! How the server reports failure.
//!
//! Fallible operations in this crate log their diagnostics at the place
//! where the problem is understood and then hand a bare [`Failed`] marker
//! up the call chain, so callers unwind with `?` without repeating the
//! report. At the very top, [`ExitError`] decides the process exit code.
//!
//! Failures with structure of their own live next to the code that
//! produces them: a malformed frame is a [`DecodeError`], a signing
//! problem a [`SignError`]. Both end up either answered on the wire or
//! funneled into the pattern here.
//!
//! [`DecodeError`]: crate::pdu::DecodeError
//! [`SignError`]: crate::bgpsec::SignError

use log::error;


//------------ Failed --------------------------------------------------------

/// A marker for an operation that already reported its failure.
///
/// Whoever returns this has written the diagnostics to the log. There is
/// nothing useful left to attach, and callers must not log again on the
/// way up.
#[derive(Clone, Copy, Debug)]
pub struct Failed;


//------------ ExitError -----------------------------------------------------

/// The reason the process is about to terminate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitError {
    /// A subsystem could not be brought up or fell over while running.
    Runtime,

    /// The configuration cannot be put to use.
    Config,
}

impl ExitError {
    /// Returns the code to exit the process with.
    pub fn exit_code(self) -> i32 {
        match self {
            ExitError::Runtime => 1,
            ExitError::Config => 2,
        }
    }
}

impl From<Failed> for ExitError {
    fn from(_: Failed) -> ExitError {
        error!("Shutting down after a fatal error.");
        ExitError::Runtime
    }
}
