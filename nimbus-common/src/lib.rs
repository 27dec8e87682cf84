pub mod error;
pub mod grpc_client;
pub mod model;
pub mod retries;

#[cfg(test)]
test_r::enable!();

pub use error::{NimbusError, Result};
pub use grpc_client::{GrpcClient, GrpcClientConfig};
pub use retries::{call_with_retries, ExpBackoff, Retriable, RetryConfig};
