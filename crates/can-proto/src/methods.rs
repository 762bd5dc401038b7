//! Named constants for gRPC method paths and metadata keys.
//!
//! Shared between the client façade and the in-process test servers so the
//! strings stay in sync with the protobuf service definitions.

// ---------------------------------------------------------------------------
// Pods
// ---------------------------------------------------------------------------

/// `Pods/List`
pub const METHOD_LIST_PODS: &str = "Pods/List";

/// `Pods/Create`
pub const METHOD_CREATE_POD: &str = "Pods/Create";

/// `Pods/Start`
pub const METHOD_START_POD: &str = "Pods/Start";

/// `Pods/Delete`
pub const METHOD_DELETE_POD: &str = "Pods/Delete";

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// `Containers/Attach`
pub const METHOD_ATTACH: &str = "Containers/Attach";

/// `Containers/Signal`
pub const METHOD_SIGNAL: &str = "Containers/Signal";

// ---------------------------------------------------------------------------
// Attach metadata
// ---------------------------------------------------------------------------

/// Request metadata key naming the namespace of the attach target.
pub const META_NAMESPACE: &str = "namespace";

/// Request metadata key naming the container id of the attach target.
pub const META_CONTAINER: &str = "container";
