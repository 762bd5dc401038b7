//! Image-fetch progress while a pod is being created.
//!
//! The daemon pushes one [`CreatePodResponse`] per progress snapshot. The
//! consumer forwards every snapshot to a [`ProgressRenderer`] in arrival order
//! and finalizes the renderer once the stream ends cleanly.

mod render;

use std::time::SystemTime;

use tonic::{Status, Streaming};
use tracing::debug;

use can_proto::v1::{CreatePodResponse, ImageFetch, ImageFetchStatus};

pub use render::{DEFAULT_REFRESH, TerminalRenderer, human_bytes};

/// State of one image fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Unknown,
    Resolving,
    Waiting,
    Downloading,
    Done,
    Exists,
    Failed,
}

impl FetchStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Resolving => "resolving",
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Done => "done",
            Self::Exists => "exists",
            Self::Failed => "failed",
        }
    }

    /// No further progress is expected for this fetch.
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Exists | Self::Failed)
    }
}

impl From<ImageFetchStatus> for FetchStatus {
    fn from(status: ImageFetchStatus) -> Self {
        match status {
            ImageFetchStatus::Unspecified => Self::Unknown,
            ImageFetchStatus::Resolving => Self::Resolving,
            ImageFetchStatus::Waiting => Self::Waiting,
            ImageFetchStatus::Downloading => Self::Downloading,
            ImageFetchStatus::Done => Self::Done,
            ImageFetchStatus::Exists => Self::Exists,
            ImageFetchStatus::Failed => Self::Failed,
        }
    }
}

/// Progress of one container image being fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchProgress {
    pub container_id: String,
    pub image: String,
    /// Resolved digest, empty until the reference has been resolved.
    pub resolved: String,
    pub status: FetchStatus,
    pub offset: u64,
    pub total: u64,
    pub started_at: Option<SystemTime>,
}

impl FetchProgress {
    /// Identity used to merge successive snapshots of the same fetch.
    pub fn key(&self) -> (&str, &str) {
        (&self.container_id, &self.image)
    }
}

impl From<ImageFetch> for FetchProgress {
    fn from(fetch: ImageFetch) -> Self {
        let status = fetch.status().into();
        Self {
            status,
            offset: u64::try_from(fetch.offset).unwrap_or(0),
            total: u64::try_from(fetch.total).unwrap_or(0),
            started_at: fetch.started_at.and_then(|ts| SystemTime::try_from(ts).ok()),
            container_id: fetch.container_id,
            image: fetch.image,
            resolved: fetch.resolved,
        }
    }
}

/// Map one server message into renderer updates, keeping the server's order.
pub fn map_fetches(images: Vec<ImageFetch>) -> Vec<FetchProgress> {
    images.into_iter().map(FetchProgress::from).collect()
}

/// Display side of create progress.
///
/// Implementations own their refresh cadence; the consumer only feeds
/// updates and lifecycle signals.
pub trait ProgressRenderer {
    /// Replace the state of the fetches named in `fetches`.
    fn update(&mut self, fetches: Vec<FetchProgress>);

    /// The stream ended cleanly. Called at most once.
    fn done(&mut self);

    /// Release rendering resources. Called exactly once per consumer run.
    fn stop(&mut self);
}

/// Server-pushed stream of create-pod progress messages.
#[tonic::async_trait]
pub trait ProgressStream: Send {
    /// Next message, `Ok(None)` at end of stream.
    async fn recv(&mut self) -> Result<Option<CreatePodResponse>, Status>;

    /// Acknowledge the end of the stream from the client side.
    async fn close_send(&mut self) -> Result<(), Status>;
}

#[tonic::async_trait]
impl ProgressStream for Streaming<CreatePodResponse> {
    async fn recv(&mut self) -> Result<Option<CreatePodResponse>, Status> {
        self.message().await
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        // The request of a server-streaming call is already complete.
        Ok(())
    }
}

/// Stops the renderer when dropped.
struct StopOnDrop<'a, R: ProgressRenderer + ?Sized>(&'a mut R);

impl<R: ProgressRenderer + ?Sized> Drop for StopOnDrop<'_, R> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Drain a create-pod progress stream into `renderer`.
///
/// Every message becomes one `update` in arrival order. On clean end of
/// stream the close acknowledgement is sent, `done` is called once and the
/// close result returned. A receive error is returned as is, without `done`.
/// `stop` runs on every return path.
pub async fn consume_create_progress<S, R>(stream: &mut S, renderer: &mut R) -> Result<(), Status>
where
    S: ProgressStream + ?Sized,
    R: ProgressRenderer + ?Sized,
{
    let mut renderer = StopOnDrop(renderer);
    let mut updates = 0u64;

    loop {
        match stream.recv().await {
            Ok(Some(resp)) => {
                updates += 1;
                renderer.0.update(map_fetches(resp.images));
            }
            Ok(None) => {
                let closed = stream.close_send().await;
                renderer.0.done();
                debug!(updates, "Create progress stream ended");
                return closed;
            }
            Err(status) => {
                debug!(updates, error = %status, "Create progress stream failed");
                return Err(status);
            }
        }
    }
}
