//! Operator console.
//!
//! Input is read on its own task and queued as [`ConsoleCommand`]s; the
//! supervisor drains the queue and runs each command with [`execute`], so a
//! slow or silent operator never blocks the control loop.

use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::lifecycle::Lifecycle;
use crate::store::ProfileStore;

/// Pending commands buffered between the reader and the supervisor.
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// A single operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Terminate the server.
    Quit,
    /// Log every stored profile.
    Profiles,
    /// Anything else, verbatim.
    Unknown(String),
}

impl ConsoleCommand {
    /// Interpret one whitespace-free token, ignoring case.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        if token.eq_ignore_ascii_case("quit") {
            Self::Quit
        } else if token.eq_ignore_ascii_case("profiles") {
            Self::Profiles
        } else {
            Self::Unknown(token.to_owned())
        }
    }

    /// Split an input line into commands, one per token.
    pub fn parse_line(line: &str) -> impl Iterator<Item = Self> + '_ {
        line.split_whitespace().map(Self::parse)
    }
}

impl fmt::Display for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quit => f.write_str("quit"),
            Self::Profiles => f.write_str("profiles"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Queue of commands read from operator input.
#[derive(Debug)]
pub struct Console {
    rx: mpsc::Receiver<ConsoleCommand>,
    reader: JoinHandle<()>,
}

impl Console {
    /// Start reading commands from `input`.
    pub fn spawn<R>(input: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_commands(input, tx));
        Self { rx, reader }
    }

    /// Take the next queued command without waiting.
    ///
    /// Returns `None` when nothing is pending or input has ended.
    pub fn try_next(&mut self) -> Option<ConsoleCommand> {
        match self.rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for the next command.
    ///
    /// Returns `None` once input has ended and the queue is drained.
    pub async fn next(&mut self) -> Option<ConsoleCommand> {
        self.rx.recv().await
    }

    /// Stop reading input.
    pub fn close(&mut self) {
        self.rx.close();
        self.reader.abort();
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_commands<R>(input: R, tx: mpsc::Sender<ConsoleCommand>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                for cmd in ConsoleCommand::parse_line(&line) {
                    if tx.send(cmd).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                tracing::info!("Console input closed");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read console input");
                return;
            }
        }
    }
}

/// Run `command`.
///
/// `quit` terminates the lifecycle, `profiles` logs each stored profile in
/// store order, and anything else is logged and ignored. Store failures are
/// logged rather than returned.
pub async fn execute(command: &ConsoleCommand, lifecycle: &Lifecycle, store: &dyn ProfileStore) {
    tracing::info!(command = %command, "Command received");
    match command {
        ConsoleCommand::Quit => {
            tracing::info!("Quit requested from the console");
            lifecycle.terminate();
        }
        ConsoleCommand::Profiles => match store.list_profiles().await {
            Ok(profiles) => {
                tracing::info!(
                    count = profiles.len(),
                    "Following profiles are registered in the database",
                );
                for profile in &profiles {
                    tracing::info!(
                        id = profile.id,
                        name = %profile.name,
                        age = profile.age,
                        "Profile",
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list profiles"),
        },
        ConsoleCommand::Unknown(raw) => {
            tracing::info!(input = %raw, "Ignoring unrecognised command");
        }
    }
}
