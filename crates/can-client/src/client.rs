//! Service façade over the can daemon.
//!
//! Every call dials its own channel, issues one RPC and drops the channel
//! again. Unary calls carry the configured request timeout; the attach and
//! create streams run until they end on their own.

use std::collections::HashMap;
use std::time::Duration;

use nix::sys::signal::Signal;
use tonic::Request;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, instrument};

use can_core::config::ClientSettings;
use can_proto::methods::{
    METHOD_ATTACH, METHOD_CREATE_POD, METHOD_DELETE_POD, METHOD_LIST_PODS, METHOD_SIGNAL,
    METHOD_START_POD,
};
use can_proto::v1::containers_client::ContainersClient;
use can_proto::v1::pods_client::PodsClient;
use can_proto::v1::{
    CreatePodRequest, DeletePodRequest, ListPodsRequest, Pod, SignalRequest, StartPodRequest,
};

use crate::attach::{self, AttachError, AttachIo};
use crate::progress::{ProgressRenderer, consume_create_progress};

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Daemon URI, always with a scheme.
    pub addr: String,
    /// Namespace pod and container operations are scoped to.
    pub namespace: String,
    pub connect_timeout: Duration,
    /// Deadline applied to unary calls.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Build a config for `addr`, adding `http://` when no scheme is given.
    pub fn new(addr: &str, namespace: impl Into<String>) -> Self {
        Self {
            addr: normalize_addr(addr),
            namespace: namespace.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            addr: normalize_addr(&settings.server),
            namespace: settings.namespace.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        }
    }
}

fn normalize_addr(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Mutation applied to a pod before it is sent to the daemon.
pub type PodOpt = Box<dyn FnOnce(&mut Pod) -> Result<(), ClientError> + Send>;

/// Merge `labels` into the pod's metadata labels.
pub fn with_labels<I, K, V>(labels: I) -> PodOpt
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let labels: HashMap<String, String> = labels
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    Box::new(move |pod| {
        pod.metadata.get_or_insert_with(Default::default).labels.extend(labels);
        Ok(())
    })
}

/// Append `KEY=value` entries to the environment of the named container.
pub fn with_env<I, S>(container: &str, env: I) -> PodOpt
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let container = container.to_string();
    let env: Vec<String> = env.into_iter().map(Into::into).collect();
    Box::new(move |pod| {
        if let Some(entry) = env.iter().find(|e| !e.contains('=')) {
            return Err(ClientError::InvalidPod(format!(
                "environment entry {entry:?} is not KEY=value"
            )));
        }
        let target = pod
            .spec
            .as_mut()
            .and_then(|spec| spec.containers.iter_mut().find(|c| c.name == container))
            .ok_or_else(|| ClientError::InvalidPod(format!("no container named {container:?}")))?;
        target.env.extend(env);
        Ok(())
    })
}

/// Client for the can daemon.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub const fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn channel(&self) -> Result<Channel, ClientError> {
        let channel = Endpoint::from_shared(self.config.addr.clone())
            .map_err(|e| ClientError::InvalidAddress(e.to_string()))?
            .connect_timeout(self.config.connect_timeout)
            .connect()
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        debug!(addr = %self.config.addr, "Connected");
        Ok(channel)
    }

    fn unary<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.config.request_timeout);
        request
    }

    /// List every pod in the configured namespace.
    #[instrument(skip(self), fields(method = METHOD_LIST_PODS, namespace = %self.config.namespace))]
    pub async fn list_pods(&self) -> Result<Vec<Pod>, ClientError> {
        let mut client = PodsClient::new(self.channel().await?);
        let response = client
            .list(self.unary(ListPodsRequest {
                namespace: self.config.namespace.clone(),
            }))
            .await?;
        Ok(response.into_inner().pods)
    }

    /// Find a pod by name.
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn get_pod(&self, name: &str) -> Result<Pod, ClientError> {
        self.list_pods()
            .await?
            .into_iter()
            .find(|pod| pod.metadata.as_ref().is_some_and(|m| m.name == name))
            .ok_or_else(|| ClientError::PodNotFound(name.to_string()))
    }

    /// Create a pod, rendering image-fetch progress until the daemon is done.
    ///
    /// Options run in order before anything is dialed; the first failing
    /// option aborts the call.
    #[instrument(skip_all, fields(method = METHOD_CREATE_POD, pod = tracing::field::Empty))]
    pub async fn create_pod<R>(
        &self,
        mut pod: Pod,
        opts: Vec<PodOpt>,
        renderer: &mut R,
    ) -> Result<(), ClientError>
    where
        R: ProgressRenderer + Send + ?Sized,
    {
        for opt in opts {
            opt(&mut pod)?;
        }
        if let Some(meta) = &pod.metadata {
            tracing::Span::current().record("pod", meta.name.as_str());
        }

        let mut client = PodsClient::new(self.channel().await?);
        let mut stream = client
            .create(CreatePodRequest { pod: Some(pod) })
            .await?
            .into_inner();
        consume_create_progress(&mut stream, renderer).await?;
        info!("Pod created");
        Ok(())
    }

    /// Start a created pod.
    #[instrument(skip(self), fields(method = METHOD_START_POD, namespace = %self.config.namespace))]
    pub async fn start_pod(&self, name: &str) -> Result<Pod, ClientError> {
        let mut client = PodsClient::new(self.channel().await?);
        let response = client
            .start(self.unary(StartPodRequest {
                namespace: self.config.namespace.clone(),
                name: name.to_string(),
            }))
            .await?;
        response
            .into_inner()
            .pod
            .ok_or_else(|| ClientError::PodNotFound(name.to_string()))
    }

    /// Delete a pod. Namespace and name come from the pod itself.
    #[instrument(skip_all, fields(method = METHOD_DELETE_POD))]
    pub async fn delete_pod(&self, pod: &Pod) -> Result<Pod, ClientError> {
        let meta = pod
            .metadata
            .as_ref()
            .ok_or_else(|| ClientError::InvalidPod("pod has no metadata".into()))?;
        debug!(namespace = %meta.namespace, name = %meta.name, "Deleting pod");

        let mut client = PodsClient::new(self.channel().await?);
        let response = client
            .delete(self.unary(DeletePodRequest {
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            }))
            .await?;
        response
            .into_inner()
            .pod
            .ok_or_else(|| ClientError::PodNotFound(meta.name.clone()))
    }

    /// Attach local stdio to a running container until the session ends.
    #[instrument(
        skip(self, io),
        fields(method = METHOD_ATTACH, namespace = %self.config.namespace)
    )]
    pub async fn attach(&self, container_id: &str, io: AttachIo) -> Result<(), ClientError> {
        let channel = self.channel().await?;
        let stream =
            attach::open_grpc_stream(channel, &self.config.namespace, container_id).await?;
        attach::run(io, stream).await?;
        Ok(())
    }

    /// Deliver a signal to a container's main process.
    #[instrument(skip(self), fields(method = METHOD_SIGNAL, namespace = %self.config.namespace))]
    pub async fn signal(&self, container_id: &str, signal: Signal) -> Result<(), ClientError> {
        let mut client = ContainersClient::new(self.channel().await?);
        client
            .signal(self.unary(SignalRequest {
                namespace: self.config.namespace.clone(),
                container_id: container_id.to_string(),
                signal: signal as i32,
            }))
            .await?;
        Ok(())
    }
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("RPC call failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("No pod found with name [{0}]")]
    PodNotFound(String),

    #[error("Invalid pod: {0}")]
    InvalidPod(String),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

impl ClientError {
    /// gRPC status code, when the daemon answered with an error.
    pub fn code(&self) -> Option<tonic::Code> {
        match self {
            Self::Rpc(status) => Some(status.code()),
            Self::Attach(
                AttachError::InboundRecv(status)
                | AttachError::CloseSend(status)
                | AttachError::OutboundSend(status),
            ) => Some(status.code()),
            _ => None,
        }
    }
}
