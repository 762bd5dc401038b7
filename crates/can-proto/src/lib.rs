//! can Protocol Buffers
//!
//! Generated protobuf code for the can gRPC API.
//!
//! This crate contains:
//! - `Pods` for pod lifecycle (list, create with image-fetch progress, start, delete)
//! - `Containers` for interactive attach and signal delivery

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod methods;

/// can v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("can.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

// Re-export prost_types for downstream crates that need Timestamp conversion
pub use prost_types;
