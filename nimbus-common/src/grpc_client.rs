use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint, Uri};

use crate::retries::RetryConfig;

#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    pub retries_on_unavailable: RetryConfig,
    pub connect_timeout: Duration,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            retries_on_unavailable: RetryConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A lazily-connected, cheaply cloneable handle to one gRPC service stub.
///
/// The channel is built once with `connect_lazy` (no network round trip at
/// construction time) and shared across clones. `call` performs a single
/// attempt; callers wrap it with [`crate::retries::call_with_retries`] using
/// `retries_on_unavailable`, the same way every collaborator-object client
/// in this core does.
pub struct GrpcClient<T> {
    name: &'static str,
    client: T,
    pub config: GrpcClientConfig,
}

impl<T: Clone> Clone for GrpcClient<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            client: self.client.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Clone> GrpcClient<T> {
    pub fn new(
        name: &'static str,
        make_client: impl FnOnce(Channel) -> T,
        uri: Uri,
        config: GrpcClientConfig,
    ) -> Self {
        let channel = Endpoint::from(uri)
            .connect_timeout(config.connect_timeout)
            .connect_lazy();

        Self {
            name,
            client: make_client(channel),
            config,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs one attempt of an RPC against a fresh clone of the underlying
    /// stub. Retrying across attempts is the caller's responsibility.
    pub async fn call<F, R>(&self, f: F) -> Result<tonic::Response<R>, tonic::Status>
    where
        F: FnOnce(&mut T) -> Pin<Box<dyn Future<Output = Result<tonic::Response<R>, tonic::Status>> + Send + '_>>,
    {
        let mut client = self.client.clone();
        f(&mut client).await
    }
}
