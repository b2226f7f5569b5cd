use futures::future::{self, FutureExt};
use serde::Deserialize;
use std::str::FromStr;
use strum_macros::Display;

use crate::error::{CloserError, Result};

/// Termination signals a [`Closer`](crate::Closer) can watch for.
#[derive(Deserialize, Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
#[serde(try_from = "String")]
pub enum Signal {
    #[strum(to_string = "SIGINT")]
    Interrupt,
    #[strum(to_string = "SIGTERM")]
    Terminate,
    #[strum(to_string = "SIGQUIT")]
    Quit,
    #[strum(to_string = "SIGHUP")]
    Hangup,
}

impl Signal {
    /// Interrupt and terminate, the pair most services stop on.
    pub fn defaults() -> Vec<Signal> {
        vec![Signal::Interrupt, Signal::Terminate]
    }

    /// Conventional POSIX number, also used for the `128 + n` exit code.
    pub fn number(self) -> i32 {
        match self {
            Signal::Hangup => 1,
            Signal::Interrupt => 2,
            Signal::Quit => 3,
            Signal::Terminate => 15,
        }
    }

    #[cfg(unix)]
    fn kind(self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;

        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Quit => SignalKind::quit(),
            Signal::Hangup => SignalKind::hangup(),
        }
    }
}

#[derive(Debug)]
pub struct SignalParseError(String);

impl std::fmt::Display for SignalParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SignalParseError {}

impl FromStr for Signal {
    type Err = SignalParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "interrupt" | "int" | "sigint" => Ok(Self::Interrupt),
            "terminate" | "term" | "sigterm" => Ok(Self::Terminate),
            "quit" | "sigquit" => Ok(Self::Quit),
            "hangup" | "hup" | "sighup" => Ok(Self::Hangup),
            _ => Err(SignalParseError(format!(
                "Invalid signal '{}'. Valid options: interrupt, terminate, quit, hangup",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Signal {
    type Error = SignalParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(unix)]
type Listener = tokio::signal::unix::Signal;
#[cfg(windows)]
type Listener = tokio::signal::windows::CtrlC;

/// Listeners for a set of signals, installed up front so a delivery right
/// after construction is not lost.
pub(crate) struct Watcher {
    listeners: Vec<(Signal, Listener)>,
}

impl Watcher {
    #[cfg(unix)]
    pub(crate) fn install(signals: &[Signal]) -> Result<Self> {
        let mut listeners = Vec::with_capacity(signals.len());
        for (i, &signal) in signals.iter().enumerate() {
            if signals[..i].contains(&signal) {
                continue;
            }
            let listener = tokio::signal::unix::signal(signal.kind())
                .map_err(|source| CloserError::SignalHandler { signal, source })?;
            listeners.push((signal, listener));
        }
        Ok(Self { listeners })
    }

    #[cfg(windows)]
    pub(crate) fn install(signals: &[Signal]) -> Result<Self> {
        let mut listeners = Vec::with_capacity(1);
        for &signal in signals {
            if signal != Signal::Interrupt {
                return Err(CloserError::UnsupportedSignal(signal));
            }
            if !listeners.is_empty() {
                continue;
            }
            let listener = tokio::signal::windows::ctrl_c()
                .map_err(|source| CloserError::SignalHandler { signal, source })?;
            listeners.push((signal, listener));
        }
        Ok(Self { listeners })
    }

    /// Resolves with the next signal delivered to any listener.
    pub(crate) async fn recv(&mut self) -> Signal {
        if self.listeners.is_empty() {
            return future::pending().await;
        }
        let next = self.listeners.iter_mut().map(|(signal, listener)| {
            let signal = *signal;
            async move {
                match listener.recv().await {
                    Some(()) => signal,
                    // driver gone, the runtime is shutting down
                    None => future::pending().await,
                }
            }
            .boxed()
        });
        let (signal, _, _) = future::select_all(next).await;
        signal
    }
}

/// Exit the way the default disposition of `signal` would.
pub(crate) fn exit_with(signal: Signal) -> ! {
    std::process::exit(128 + signal.number())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_aliases() {
        assert_eq!("interrupt".parse::<Signal>().unwrap(), Signal::Interrupt);
        assert_eq!("SIGINT".parse::<Signal>().unwrap(), Signal::Interrupt);
        assert_eq!("term".parse::<Signal>().unwrap(), Signal::Terminate);
        assert_eq!(" SigTerm ".parse::<Signal>().unwrap(), Signal::Terminate);
        assert_eq!("sigquit".parse::<Signal>().unwrap(), Signal::Quit);
        assert_eq!("hup".parse::<Signal>().unwrap(), Signal::Hangup);
    }

    #[test]
    fn test_parse_signal_invalid() {
        let err = "usr1".parse::<Signal>().unwrap_err();
        assert!(err.to_string().contains("usr1"));
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(Signal::Interrupt.to_string(), "SIGINT");
        assert_eq!(Signal::Terminate.to_string(), "SIGTERM");
        assert_eq!(Signal::Hangup.to_string(), "SIGHUP");
    }

    #[test]
    fn test_signal_numbers() {
        assert_eq!(Signal::Interrupt.number(), 2);
        assert_eq!(Signal::Terminate.number(), 15);
        assert_eq!(128 + Signal::Hangup.number(), 129);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_dedups_signals() {
        let watcher =
            Watcher::install(&[Signal::Hangup, Signal::Hangup, Signal::Quit]).unwrap();
        assert_eq!(watcher.listeners.len(), 2);
    }
}
