//! can client library.
//!
//! Talks to the can daemon over gRPC: pod lifecycle calls, interactive attach
//! sessions and image-fetch progress while a pod is created.

#![allow(clippy::result_large_err)]

pub mod attach;
pub mod client;
pub mod progress;

pub use attach::{AttachError, AttachIo};
pub use client::{Client, ClientConfig, ClientError, PodOpt, with_env, with_labels};
pub use progress::{ProgressRenderer, TerminalRenderer};
