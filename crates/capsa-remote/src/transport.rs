//! Byte transports carrying the line protocol.
//!
//! A transport only hands over a raw read/write pair; framing and
//! message semantics live above it.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::PoisonError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{RemoteError, RemoteResult};

/// The byte streams a transport yields once connected.
pub struct TransportIo {
    /// Bytes arriving from the far side.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Bytes sent to the far side.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for TransportIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportIo").finish_non_exhaustive()
    }
}

/// A connectable byte channel to a remote peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel and return its read/write halves.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying channel cannot be opened or
    /// was already consumed.
    async fn connect(&self) -> RemoteResult<TransportIo>;

    /// Tear the channel down, releasing any held resources.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown itself fails; the channel is
    /// unusable either way.
    async fn terminate(&self) -> RemoteResult<()>;
}

/// Transport over a pre-established read/write pair.
///
/// Used for in-process wiring, e.g. connecting both protocol ends over
/// a duplex pipe.
pub struct PipeTransport {
    io: Mutex<Option<TransportIo>>,
}

impl PipeTransport {
    /// Wrap an existing read/write pair. `connect` hands the pair out
    /// exactly once.
    #[must_use]
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            io: Mutex::new(Some(TransportIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })),
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn connect(&self) -> RemoteResult<TransportIo> {
        self.io
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| RemoteError::transport("pipe transport already connected"))
    }

    async fn terminate(&self) -> RemoteResult<()> {
        drop(
            self.io
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        Ok(())
    }
}

/// Transport that spawns a child process and speaks over its stdio.
///
/// Stderr is inherited so the child's diagnostics land in the parent's
/// terminal.
pub struct ChildProcessTransport {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl ChildProcessTransport {
    /// Transport launching `program` with `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
        }
    }

    /// Transport running `command` on `host` through `ssh`.
    #[must_use]
    pub fn remote_shell(host: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new("ssh", vec![host.into(), command.into()])
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    async fn connect(&self) -> RemoteResult<TransportIo> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RemoteError::transport("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::transport("child stdout not captured"))?;

        debug!(program = %self.program, "Child process transport connected");
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);

        Ok(TransportIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }

    async fn terminate(&self) -> RemoteResult<()> {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            if let Err(error) = child.kill().await {
                warn!(%error, "Failed to kill child process");
            }
        }
        Ok(())
    }
}
