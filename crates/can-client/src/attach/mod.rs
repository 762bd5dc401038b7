//! Interactive attach sessions.
//!
//! An attach session relays local stdin to a remote container process and
//! demultiplexes the container's combined output stream back into local
//! stdout/stderr sinks. Two pumps run as independent tasks over disjoint
//! halves of one bidirectional stream:
//!
//! - the inbound pump copies [`OutputFrame`]s to the matching local sink and
//!   half-closes the outbound direction once the remote side ends;
//! - the outbound pump (only when stdin is present) forwards stdin in chunks
//!   of at most [`STDIN_BUFFER_SIZE`] bytes and stops quietly at end of file.
//!
//! The first outcome posted by either pump becomes the session outcome.

mod grpc;
mod pump;


use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

use can_proto::v1::AttachResponse;

pub use grpc::{AttachRequestStream, GrpcAttachStream, GrpcChunkSender, open_grpc_stream};

/// Maximum number of stdin bytes carried by one outbound chunk.
pub const STDIN_BUFFER_SIZE: usize = 1024;

/// Capacity of the completion queue. Each pump posts at most once, so the
/// lagging pump can always post without blocking.
const OUTCOME_CAPACITY: usize = 2;

/// Boxed local input source.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed local output sink.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local stdio wired into an attach session.
///
/// The sinks stay owned by the caller's side of the session: the relay only
/// writes and flushes them.
pub struct AttachIo {
    pub stdin: Option<BoxReader>,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

impl AttachIo {
    /// Wire arbitrary readers and writers.
    pub fn new<I, O, E>(stdin: Option<I>, stdout: O, stderr: E) -> Self
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stdin: stdin.map(|s| Box::new(s) as BoxReader),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// Relay output only; nothing is forwarded to the container's stdin.
    pub fn output_only<O, E>(stdout: O, stderr: E) -> Self
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stdin: None,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// The current process's stdin, stdout and stderr.
    pub fn stdio() -> Self {
        Self::new(
            Some(tokio::io::stdin()),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
    }
}

impl fmt::Debug for AttachIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachIo")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Local sink an output frame is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One unit of container output received from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub payload: Vec<u8>,
    pub stream: OutputStream,
}

impl OutputFrame {
    pub fn stdout(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            stream: OutputStream::Stdout,
        }
    }

    pub fn stderr(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            stream: OutputStream::Stderr,
        }
    }
}

impl From<AttachResponse> for OutputFrame {
    fn from(resp: AttachResponse) -> Self {
        Self {
            payload: resp.output,
            stream: if resp.stderr {
                OutputStream::Stderr
            } else {
                OutputStream::Stdout
            },
        }
    }
}

/// Inbound half of an attach stream.
#[tonic::async_trait]
pub trait FrameReceiver: Send + 'static {
    /// Receive the next frame. `Ok(None)` signals a clean end of stream.
    async fn recv(&mut self) -> Result<Option<OutputFrame>, Status>;
}

/// Outbound half of an attach stream.
///
/// Clones feed the same underlying stream.
#[tonic::async_trait]
pub trait ChunkSender: Clone + Send + Sync + 'static {
    /// Send one chunk of stdin bytes.
    async fn send(&self, chunk: Vec<u8>) -> Result<(), Status>;

    /// Half-close the outbound direction. Further sends fail.
    async fn close_send(&self) -> Result<(), Status>;

    /// Whether [`close_send`](Self::close_send) has been called.
    fn is_closed(&self) -> bool;
}

/// An opened attach stream bound to one container.
///
/// `release` is cancelled exactly once when the session returns; the inbound
/// pump and the transport itself watch it.
pub struct AttachStream<R, S> {
    frames: R,
    input: S,
    release: CancellationToken,
}

impl<R: FrameReceiver, S: ChunkSender> AttachStream<R, S> {
    pub const fn new(frames: R, input: S, release: CancellationToken) -> Self {
        Self {
            frames,
            input,
            release,
        }
    }

    /// Token cancelled when the session releases the transport.
    pub fn release_token(&self) -> CancellationToken {
        self.release.clone()
    }
}

/// Run an attach session until the first pump reaches a terminal state.
///
/// Returns `Ok(())` when the remote output stream ended cleanly before any
/// failure was reported. The transport is released on every return path.
/// The inbound pump stops at release so the sinks are never written after
/// `run` returns. The outbound pump keeps running until stdin ends or fails;
/// a failure it reports afterwards is logged and never changes the outcome.
pub async fn run<R, S>(io: AttachIo, stream: AttachStream<R, S>) -> Result<(), AttachError>
where
    R: FrameReceiver,
    S: ChunkSender,
{
    let AttachStream {
        frames,
        input,
        release,
    } = stream;
    let _release = release.clone().drop_guard();

    let (outcome_tx, mut outcome_rx) = mpsc::channel(OUTCOME_CAPACITY);

    tokio::spawn(pump::inbound(
        frames,
        input.clone(),
        io.stdout,
        io.stderr,
        release,
        outcome_tx.clone(),
    ));

    if let Some(stdin) = io.stdin {
        tokio::spawn(pump::outbound(stdin, input, outcome_tx));
    } else {
        debug!("No stdin attached, relaying output only");
        drop(outcome_tx);
    }

    let outcome = outcome_rx.recv().await.unwrap_or(Err(AttachError::Aborted));
    match &outcome {
        Ok(()) => debug!("Attach session finished"),
        Err(e) => debug!(direction = ?e.direction(), error = %e, "Attach session failed"),
    }

    tokio::spawn(drain_late_outcomes(outcome_rx));
    outcome
}

async fn drain_late_outcomes(mut outcomes: mpsc::Receiver<Result<(), AttachError>>) {
    while let Some(late) = outcomes.recv().await {
        if let Err(e) = late {
            warn!(
                direction = ?e.direction(),
                error = %e,
                "Attach pump failed after the session ended"
            );
        }
    }
}

/// Direction of data flow an attach failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote output towards local stdout/stderr.
    Inbound,
    /// Local stdin towards the remote process.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Attach session errors.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("Received error while reading attach stream: {0}")]
    InboundRecv(#[source] Status),

    #[error("Error while copying attach output: {0}")]
    InboundCopy(#[source] io::Error),

    #[error("Failed to close attach input: {0}")]
    CloseSend(#[source] Status),

    #[error("Error while reading stdin: {0}")]
    OutboundRead(#[source] io::Error),

    #[error("Sending to attach stream returned error: {0}")]
    OutboundSend(#[source] Status),

    #[error("Attach pumps exited without reporting an outcome")]
    Aborted,
}

impl AttachError {
    /// Direction the failure originated from, `None` for [`AttachError::Aborted`].
    pub const fn direction(&self) -> Option<Direction> {
        match self {
            Self::InboundRecv(_) | Self::InboundCopy(_) => Some(Direction::Inbound),
            Self::CloseSend(_) | Self::OutboundRead(_) | Self::OutboundSend(_) => {
                Some(Direction::Outbound)
            }
            Self::Aborted => None,
        }
    }
}
