//! tonic-backed attach transport.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Status, Streaming};
use tracing::{debug, trace};

use can_proto::methods::{META_CONTAINER, META_NAMESPACE};
use can_proto::v1::containers_client::ContainersClient;
use can_proto::v1::{AttachRequest, AttachResponse};

use super::{AttachStream, ChunkSender, FrameReceiver, OutputFrame};

/// Chunks buffered between the outbound pump and the HTTP/2 stream.
const OUTBOUND_BUFFER: usize = 32;

/// Request stream handed to the `Attach` RPC.
pub type AttachRequestStream = Pin<Box<dyn Stream<Item = AttachRequest> + Send>>;

/// Attach stream backed by a live tonic call.
pub type GrpcAttachStream = AttachStream<Streaming<AttachResponse>, GrpcChunkSender>;

#[tonic::async_trait]
impl FrameReceiver for Streaming<AttachResponse> {
    async fn recv(&mut self) -> Result<Option<OutputFrame>, Status> {
        Ok(self.message().await?.map(OutputFrame::from))
    }
}

/// Outbound half of a tonic attach call.
///
/// Chunks are queued on a bounded channel drained by the request stream.
/// Half-closing ends the request stream, which ends the HTTP/2 request body.
/// Chunks still queued at that point are dropped: the inbound side only
/// half-closes once the remote output has ended, and the session release
/// ends the call anyway.
#[derive(Debug, Clone)]
pub struct GrpcChunkSender {
    tx: mpsc::Sender<AttachRequest>,
    half_closed: CancellationToken,
}

impl GrpcChunkSender {
    /// Create a sender and the request stream it feeds.
    ///
    /// The request stream also ends when `release` is cancelled.
    pub fn channel(release: &CancellationToken) -> (Self, AttachRequestStream) {
        let (tx, rx) = mpsc::channel::<AttachRequest>(OUTBOUND_BUFFER);
        let half_closed = release.child_token();
        let requests = RequestStream {
            rx,
            closed: Box::pin(half_closed.clone().cancelled_owned()),
        };

        (Self { tx, half_closed }, Box::pin(requests))
    }
}

/// Queued chunks until the half-close token fires.
struct RequestStream {
    rx: mpsc::Receiver<AttachRequest>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Stream for RequestStream {
    type Item = AttachRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed.as_mut().poll(cx).is_ready() {
            trace!("Attach request stream closed");
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

#[tonic::async_trait]
impl ChunkSender for GrpcChunkSender {
    async fn send(&self, chunk: Vec<u8>) -> Result<(), Status> {
        if self.half_closed.is_cancelled() {
            return Err(Status::failed_precondition("attach input is closed"));
        }
        self.tx
            .send(AttachRequest { input: chunk })
            .await
            .map_err(|_| Status::unavailable("attach request stream dropped"))
    }

    async fn close_send(&self) -> Result<(), Status> {
        self.half_closed.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.half_closed.is_cancelled()
    }
}

/// Open an `Attach` call for one container.
///
/// The target travels as request metadata, not in the stream payload.
pub async fn open_grpc_stream(
    channel: Channel,
    namespace: &str,
    container_id: &str,
) -> Result<GrpcAttachStream, Status> {
    let release = CancellationToken::new();
    let (input, requests) = GrpcChunkSender::channel(&release);

    let mut request = Request::new(requests);
    let metadata = request.metadata_mut();
    metadata.insert(META_NAMESPACE, metadata_value(namespace)?);
    metadata.insert(META_CONTAINER, metadata_value(container_id)?);

    debug!(namespace, container_id, "Opening attach stream");
    let frames = ContainersClient::new(channel)
        .attach(request)
        .await?
        .into_inner();

    Ok(AttachStream::new(frames, input, release))
}

fn metadata_value(value: &str) -> Result<MetadataValue<tonic::metadata::Ascii>, Status> {
    MetadataValue::try_from(value)
        .map_err(|_| Status::invalid_argument(format!("invalid metadata value: {value:?}")))
}
