//! In-process can daemon used by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use can_client::{Client, ClientConfig};
use can_proto::methods::{META_CONTAINER, META_NAMESPACE};
use can_proto::v1::containers_server::{Containers, ContainersServer};
use can_proto::v1::pods_server::{Pods, PodsServer};
use can_proto::v1::{
    AttachRequest, AttachResponse, CreatePodRequest, CreatePodResponse, DeletePodRequest,
    DeletePodResponse, ListPodsRequest, ListPodsResponse, Pod, PodMetadata, SignalRequest,
    SignalResponse, StartPodRequest, StartPodResponse,
};

pub const NAMESPACE: &str = "test";

/// Everything the fake daemon observed.
#[derive(Debug, Default)]
pub struct Observed {
    pub attach_targets: Vec<(String, String)>,
    pub attach_input: Vec<u8>,
    pub created: Vec<Pod>,
    pub started: Vec<(String, String)>,
    pub deleted: Vec<(String, String)>,
    pub signals: Vec<(String, String, i32)>,
}

/// Shared state behind both fake services.
#[derive(Clone, Default)]
pub struct Daemon {
    pub observed: Arc<Mutex<Observed>>,
    pub pods: Arc<Mutex<Vec<Pod>>>,
    pub progress: Arc<Mutex<Vec<Result<CreatePodResponse, Status>>>>,
}

impl Daemon {
    pub fn with_pods(names: &[&str]) -> Self {
        let daemon = Self::default();
        *daemon.pods.lock().unwrap() = names.iter().map(|n| pod(n)).collect();
        daemon
    }

    pub fn observed(&self) -> std::sync::MutexGuard<'_, Observed> {
        self.observed.lock().unwrap()
    }

    /// Serve both services on an ephemeral port and return a client for it.
    pub async fn spawn(self) -> Client {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(
            Server::builder()
                .add_service(PodsServer::new(self.clone()))
                .add_service(ContainersServer::new(self))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        Client::new(ClientConfig::new(&addr.to_string(), NAMESPACE))
    }
}

pub fn pod(name: &str) -> Pod {
    Pod {
        metadata: Some(PodMetadata {
            name: name.into(),
            namespace: NAMESPACE.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stdout(output: &[u8]) -> Result<AttachResponse, Status> {
    Ok(AttachResponse {
        output: output.to_vec(),
        stderr: false,
    })
}

fn stderr(output: &[u8]) -> Result<AttachResponse, Status> {
    Ok(AttachResponse {
        output: output.to_vec(),
        stderr: true,
    })
}

fn metadata(request: &Request<Streaming<AttachRequest>>, key: &str) -> Result<String, Status> {
    request
        .metadata()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .ok_or_else(|| Status::invalid_argument(format!("missing {key} metadata")))
}

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl Containers for Daemon {
    type AttachStream = BoxStream<AttachResponse>;

    /// Behaviour depends on the container id:
    /// - `greeter`: writes `hello` to stdout and `warn` to stderr, then exits;
    /// - `echo`: echoes every input chunk to stdout and exits on `exit`;
    /// - `crash`: writes one frame, then fails the stream.
    async fn attach(
        &self,
        request: Request<Streaming<AttachRequest>>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let namespace = metadata(&request, META_NAMESPACE)?;
        let container = metadata(&request, META_CONTAINER)?;
        self.observed()
            .attach_targets
            .push((namespace, container.clone()));

        let (tx, rx) = mpsc::channel(16);
        let mut input = request.into_inner();
        let observed = Arc::clone(&self.observed);

        match container.as_str() {
            "greeter" => {
                tx.send(stdout(b"hello")).await.unwrap();
                tx.send(stderr(b"warn")).await.unwrap();
            }
            "crash" => {
                tx.send(stdout(b"starting")).await.unwrap();
                tx.send(Err(Status::internal("container crashed")))
                    .await
                    .unwrap();
            }
            "echo" => {
                tokio::spawn(async move {
                    while let Some(Ok(req)) = input.next().await {
                        observed
                            .lock()
                            .unwrap()
                            .attach_input
                            .extend_from_slice(&req.input);
                        if req.input.starts_with(b"exit") {
                            break;
                        }
                        if tx.send(stdout(&req.input)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            other => return Err(Status::not_found(format!("no container {other}"))),
        }

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn signal(
        &self,
        request: Request<SignalRequest>,
    ) -> Result<Response<SignalResponse>, Status> {
        let req = request.into_inner();
        self.observed()
            .signals
            .push((req.namespace, req.container_id, req.signal));
        Ok(Response::new(SignalResponse {}))
    }
}

#[tonic::async_trait]
impl Pods for Daemon {
    type CreateStream = BoxStream<CreatePodResponse>;

    async fn list(
        &self,
        request: Request<ListPodsRequest>,
    ) -> Result<Response<ListPodsResponse>, Status> {
        let namespace = request.into_inner().namespace;
        let pods = self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.metadata.as_ref().is_some_and(|m| m.namespace == namespace))
            .cloned()
            .collect();
        Ok(Response::new(ListPodsResponse { pods }))
    }

    async fn create(
        &self,
        request: Request<CreatePodRequest>,
    ) -> Result<Response<Self::CreateStream>, Status> {
        let pod = request
            .into_inner()
            .pod
            .ok_or_else(|| Status::invalid_argument("pod is required"))?;
        self.observed().created.push(pod);

        let script = std::mem::take(&mut *self.progress.lock().unwrap());
        let progress = async_stream::stream! {
            for snapshot in script {
                tokio::task::yield_now().await;
                yield snapshot;
            }
        };
        Ok(Response::new(Box::pin(progress)))
    }

    async fn start(
        &self,
        request: Request<StartPodRequest>,
    ) -> Result<Response<StartPodResponse>, Status> {
        let req = request.into_inner();
        self.observed()
            .started
            .push((req.namespace.clone(), req.name.clone()));
        let pod = self.find(&req.name)?;
        Ok(Response::new(StartPodResponse { pod: Some(pod) }))
    }

    async fn delete(
        &self,
        request: Request<DeletePodRequest>,
    ) -> Result<Response<DeletePodResponse>, Status> {
        let req = request.into_inner();
        self.observed()
            .deleted
            .push((req.namespace.clone(), req.name.clone()));
        let pod = self.find(&req.name)?;
        self.pods
            .lock()
            .unwrap()
            .retain(|p| p.metadata.as_ref().is_none_or(|m| m.name != req.name));
        Ok(Response::new(DeletePodResponse { pod: Some(pod) }))
    }
}

impl Daemon {
    fn find(&self, name: &str) -> Result<Pod, Status> {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.metadata.as_ref().is_some_and(|m| m.name == name))
            .cloned()
            .ok_or_else(|| Status::not_found(format!("pod {name} not found")))
    }
}

/// Sink shared between the code under test and the assertions.
#[derive(Clone, Default)]
pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Wait until the sink contains `needle`.
    pub async fn wait_for(&self, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.text().contains(needle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got {:?}", self.text()));
    }
}

impl AsyncWrite for SharedSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
