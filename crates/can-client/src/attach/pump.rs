//! Inbound and outbound attach pumps.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    AttachError, BoxReader, BoxWriter, ChunkSender, FrameReceiver, OutputStream,
    STDIN_BUFFER_SIZE,
};

type Outcome = Result<(), AttachError>;

/// Copy remote output to the local sinks until the stream ends or fails.
///
/// Always posts exactly one outcome unless the session was released first.
pub(super) async fn inbound<R, S>(
    mut frames: R,
    input: S,
    mut stdout: BoxWriter,
    mut stderr: BoxWriter,
    release: CancellationToken,
    outcome: mpsc::Sender<Outcome>,
) where
    R: FrameReceiver,
    S: ChunkSender,
{
    let result = tokio::select! {
        () = release.cancelled() => {
            debug!("Inbound pump stopped by session release");
            return;
        }
        result = relay_output(&mut frames, &input, &mut stdout, &mut stderr) => result,
    };
    post(&outcome, result);
}

async fn relay_output<R, S>(
    frames: &mut R,
    input: &S,
    stdout: &mut BoxWriter,
    stderr: &mut BoxWriter,
) -> Outcome
where
    R: FrameReceiver,
    S: ChunkSender,
{
    let mut frame_count = 0u64;
    loop {
        let Some(frame) = frames.recv().await.map_err(AttachError::InboundRecv)? else {
            debug!(frame_count, "Attach output stream ended");
            input.close_send().await.map_err(AttachError::CloseSend)?;
            return Ok(());
        };
        frame_count += 1;

        let sink = match frame.stream {
            OutputStream::Stdout => &mut *stdout,
            OutputStream::Stderr => &mut *stderr,
        };
        trace!(stream = ?frame.stream, len = frame.payload.len(), "Attach output frame");
        sink.write_all(&frame.payload).await.map_err(AttachError::InboundCopy)?;
        sink.flush().await.map_err(AttachError::InboundCopy)?;
    }
}

/// Forward local stdin to the remote process.
///
/// End of file stops the pump without posting an outcome and without
/// half-closing the stream; only failures are posted. The pump does not
/// watch the session release: it runs until its own terminal state, so a
/// failure after the session ended still reaches the late-outcome log.
/// Input read once the stream is closed is dropped, never sent.
pub(super) async fn outbound<S>(mut stdin: BoxReader, input: S, outcome: mpsc::Sender<Outcome>)
where
    S: ChunkSender,
{
    match forward_input(&mut stdin, &input).await {
        Ok(()) => debug!("Outbound pump stopped"),
        Err(e) => post(&outcome, Err(e)),
    }
}

async fn forward_input<S: ChunkSender>(stdin: &mut BoxReader, input: &S) -> Outcome {
    let mut buf = vec![0u8; STDIN_BUFFER_SIZE];
    loop {
        let n = stdin.read(&mut buf).await.map_err(AttachError::OutboundRead)?;
        if n == 0 {
            debug!("stdin reached end of file");
            return Ok(());
        }
        // Closed by the inbound side once the remote ended, or by the
        // session release. Either way this is not a send failure.
        if input.is_closed() {
            debug!("Attach input closed, dropping remaining stdin");
            return Ok(());
        }
        if let Err(status) = input.send(buf[..n].to_vec()).await {
            if input.is_closed() {
                return Ok(());
            }
            return Err(AttachError::OutboundSend(status));
        }
    }
}

fn post(outcome: &mpsc::Sender<Outcome>, result: Outcome) {
    if let Err(e) = outcome.try_send(result) {
        warn!(error = %e, "Attach outcome could not be posted");
    }
}
