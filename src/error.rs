use std::str::Utf8Error;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // --------------------------------- channel errors --------------------------------------------
    #[error("connection error: {0}")]
    Connection(String),
    #[error("channel closed before a response arrived")]
    ChannelClosed,
    #[error("remote call `{0}` failed: {1}")]
    RemoteFailure(String, String),

    // --------------------------------- wire protocol errors --------------------------------------
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("binary segment of {declared} bytes exceeds the {available} bytes on the wire")]
    SegmentOverrun { declared: usize, available: usize },
    #[error("unexpected payload for `{0}`: {1}")]
    UnexpectedPayload(&'static str, serde_json::Error),
    #[error("unknown remote event `{0}`")]
    UnknownEvent(String),

    // --------------------------------- session errors --------------------------------------------
    #[error("source `{0}` is not registered")]
    SourceNotFound(String),
    #[error("no source matches path `{0}`")]
    NoSourceForPath(String),
    #[error("entry script `{0}` does not exist locally")]
    EntryScriptMissing(String),
    #[error("frame {0} is not in the current stack")]
    FrameNotFound(u32),
    #[error("variable reference {0} does not decode")]
    BadVariableReference(i64),
    #[error("session is not launched")]
    NotLaunched,
    #[error("no exception recorded")]
    NoException,
    #[error("unsupported request `{0}`")]
    UnsupportedRequest(String),
}

impl Error {
    /// Return a hint to the serve loop - keep the session alive after this error or tear it down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => true,
            Error::Connection(_) => true,
            Error::EntryScriptMissing(_) => true,

            // A closed channel rejects the one call that was pending on
            // it; escalation (if any) comes from the transport loss
            // callback, not from here.
            Error::ChannelClosed => false,
            Error::Utf8(_) => false,
            Error::FromUtf8(_) => false,
            Error::Json(_) => false,
            Error::RemoteFailure(_, _) => false,
            Error::MalformedFrame(_) => false,
            Error::SegmentOverrun { .. } => false,
            Error::UnexpectedPayload(_, _) => false,
            Error::UnknownEvent(_) => false,
            Error::SourceNotFound(_) => false,
            Error::NoSourceForPath(_) => false,
            Error::FrameNotFound(_) => false,
            Error::BadVariableReference(_) => false,
            Error::NotLaunched => false,
            Error::NoException => false,
            Error::UnsupportedRequest(_) => false,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
