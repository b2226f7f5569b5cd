use std::time::Duration;
use thiserror::Error;

use crate::signal::Signal;

#[derive(Error, Debug)]
pub enum CloserError {
    #[error("failed to install {signal} handler: {source}")]
    SignalHandler {
        signal: Signal,
        #[source]
        source: std::io::Error,
    },

    #[error("signal {0} is not supported on this platform")]
    UnsupportedSignal(Signal),

    #[error("close did not complete within {0:?}")]
    Timeout(Duration),

    #[error("default closer already installed or closing")]
    GlobalInstalled,

    #[error("no tokio runtime to watch signals on")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, CloserError>;
