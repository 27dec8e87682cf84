//! Core client for a remote serverless compute platform.
//!
//! This crate owns transport, auth, retries, the invocation engine and
//! every collaborator/sandbox object. It never encodes or decodes call
//! arguments itself -- that boundary is the [`Serializer`] trait, supplied
//! by the caller at [`Client::connect`] time.

pub mod auth;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod function;
pub mod heartbeat;
pub mod invocation;
pub mod sandbox;
pub mod serializer;

mod rpc;

#[cfg(test)]
test_r::enable!();

pub use auth::{AuthToken, AuthTokenManager, TokenFetcher};
pub use client::{Client, Middleware};
pub use config::ClientConfig;
pub use function::{AutoscalerUpdate, Cls, ClsHandle, Function, FunctionCall, FunctionOptions, FunctionStats};
pub use serializer::{JsonSerializer, Serializer};

pub use nimbus_common::model::{App, DynamicValue};
pub use nimbus_common::NimbusError;
