use std::{path::PathBuf, time::Duration};

use snafu::{Backtrace, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum IpcError {
    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    //
    #[snafu(display("CBOR error: {source}"))]
    Codec {
        source: serde_cbor::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("frame of {len} bytes exceeds the {max} byte limit"))]
    FrameTooLarge { len: usize, max: usize },
    /// The peer did not reply in time. The caller may retry.
    #[snafu(display("no reply within {timeout:?}"))]
    Timeout { timeout: Duration },
    /// The peer process is gone (or never came up).
    #[snafu(display("peer on {} disconnected", path.display()))]
    Disconnected { path: PathBuf },
    #[snafu(display("unexpected frame: {what}"))]
    UnexpectedFrame { what: String },
}

impl IpcError {
    /// `Disconnected` means the other process went away; everything else is
    /// scoped to a single exchange.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::Disconnected { .. })
    }
}
