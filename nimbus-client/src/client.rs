use std::collections::HashMap;
use std::sync::Arc;

use nimbus_common::{GrpcClient, GrpcClientConfig, NimbusError};
use nimbus_grpc::proto::control::{
    app_service_client::AppServiceClient, blob_service_client::BlobServiceClient,
    container_service_client::ContainerServiceClient, dict_service_client::DictServiceClient,
    filesystem_service_client::FilesystemServiceClient,
    function_call_service_client::FunctionCallServiceClient,
    function_service_client::FunctionServiceClient, image_service_client::ImageServiceClient,
    proxy_service_client::ProxyServiceClient,
    sandbox_image_service_client::SandboxImageServiceClient,
    sandbox_service_client::SandboxServiceClient, secret_service_client::SecretServiceClient,
    volume_service_client::VolumeServiceClient,
};
use nimbus_grpc::proto::input::attempt_service_client::AttemptServiceClient;
use tokio::sync::Mutex as AsyncMutex;
use tonic::transport::Channel;

use crate::auth::AuthTokenManager;
use crate::config::{headers, ClientConfig, CLIENT_TYPE};
use crate::heartbeat::HeartbeatRegistry;
use crate::serializer::Serializer;

/// User-supplied request middleware, applied after the core's own auth and
/// identification headers (spec section 4.D, step 3).
pub trait Middleware: Send + Sync {
    fn apply(&self, metadata: &mut tonic::metadata::MetadataMap);
}

struct ControlPlaneServices {
    apps: GrpcClient<AppServiceClient<Channel>>,
    images: GrpcClient<ImageServiceClient<Channel>>,
    secrets: GrpcClient<SecretServiceClient<Channel>>,
    sandboxes: GrpcClient<SandboxServiceClient<Channel>>,
    containers: GrpcClient<ContainerServiceClient<Channel>>,
    filesystem: GrpcClient<FilesystemServiceClient<Channel>>,
    sandbox_images: GrpcClient<SandboxImageServiceClient<Channel>>,
    functions: GrpcClient<FunctionServiceClient<Channel>>,
    function_calls: GrpcClient<FunctionCallServiceClient<Channel>>,
    dicts: GrpcClient<DictServiceClient<Channel>>,
    queues: GrpcClient<nimbus_grpc::proto::control::queue_service_client::QueueServiceClient<Channel>>,
    volumes: GrpcClient<VolumeServiceClient<Channel>>,
    proxies: GrpcClient<ProxyServiceClient<Channel>>,
    blobs: GrpcClient<BlobServiceClient<Channel>>,
}

/// Owns every control-plane stub, the per-function input-plane stub cache,
/// the auth token manager and the ephemeral-object heartbeat registry.
///
/// Cloning a `Client` is cheap: everything behind it is reference-counted,
/// and `close` only needs to run once from any one of the clones.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    services: ControlPlaneServices,
    input_plane: AsyncMutex<HashMap<String, GrpcClient<AttemptServiceClient<Channel>>>>,
    auth: Arc<AuthTokenManager>,
    token_id: String,
    token_secret: String,
    environment: Option<String>,
    middleware: Vec<Box<dyn Middleware>>,
    image_builder_versions: AsyncMutex<HashMap<String, String>>,
    heartbeats: HeartbeatRegistry,
    retries: nimbus_common::RetryConfig,
    serializer: Arc<dyn Serializer>,
    closed: AsyncMutex<bool>,
}

impl Client {
    pub async fn connect(
        config: ClientConfig,
        auth: Arc<AuthTokenManager>,
        middleware: Vec<Box<dyn Middleware>>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, NimbusError> {
        auth.start().await?;

        let grpc_config = GrpcClientConfig {
            retries_on_unavailable: config.retries.clone(),
            ..Default::default()
        };
        let uri = config.control_plane_uri.clone();

        macro_rules! client {
            ($name:literal, $ctor:expr) => {
                GrpcClient::new($name, $ctor, uri.clone(), grpc_config.clone())
            };
        }

        let services = ControlPlaneServices {
            apps: client!("apps", AppServiceClient::new),
            images: client!("images", ImageServiceClient::new),
            secrets: client!("secrets", SecretServiceClient::new),
            sandboxes: client!("sandboxes", SandboxServiceClient::new),
            containers: client!("containers", ContainerServiceClient::new),
            filesystem: client!("filesystem", FilesystemServiceClient::new),
            sandbox_images: client!("sandbox_images", SandboxImageServiceClient::new),
            functions: client!("functions", FunctionServiceClient::new),
            function_calls: client!("function_calls", FunctionCallServiceClient::new),
            dicts: client!("dicts", DictServiceClient::new),
            queues: client!(
                "queues",
                nimbus_grpc::proto::control::queue_service_client::QueueServiceClient::new
            ),
            volumes: client!("volumes", VolumeServiceClient::new),
            proxies: client!("proxies", ProxyServiceClient::new),
            blobs: client!("blobs", BlobServiceClient::new),
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                services,
                input_plane: AsyncMutex::new(HashMap::new()),
                auth,
                token_id: config.token_id,
                token_secret: config.token_secret,
                environment: config.environment,
                middleware,
                image_builder_versions: AsyncMutex::new(HashMap::new()),
                heartbeats: HeartbeatRegistry::default(),
                retries: config.retries,
                serializer,
                closed: AsyncMutex::new(false),
            }),
        })
    }

    pub(crate) fn retries(&self) -> &nimbus_common::RetryConfig {
        &self.inner.retries
    }

    pub(crate) fn apps(&self) -> &GrpcClient<AppServiceClient<Channel>> {
        &self.inner.services.apps
    }

    pub(crate) fn images(&self) -> &GrpcClient<ImageServiceClient<Channel>> {
        &self.inner.services.images
    }

    pub(crate) fn secrets(&self) -> &GrpcClient<SecretServiceClient<Channel>> {
        &self.inner.services.secrets
    }

    pub(crate) fn sandboxes(&self) -> &GrpcClient<SandboxServiceClient<Channel>> {
        &self.inner.services.sandboxes
    }

    pub(crate) fn containers(&self) -> &GrpcClient<ContainerServiceClient<Channel>> {
        &self.inner.services.containers
    }

    pub(crate) fn filesystem(&self) -> &GrpcClient<FilesystemServiceClient<Channel>> {
        &self.inner.services.filesystem
    }

    pub(crate) fn sandbox_images(&self) -> &GrpcClient<SandboxImageServiceClient<Channel>> {
        &self.inner.services.sandbox_images
    }

    pub(crate) fn functions(&self) -> &GrpcClient<FunctionServiceClient<Channel>> {
        &self.inner.services.functions
    }

    pub(crate) fn function_calls(&self) -> &GrpcClient<FunctionCallServiceClient<Channel>> {
        &self.inner.services.function_calls
    }

    pub(crate) fn dicts(&self) -> &GrpcClient<DictServiceClient<Channel>> {
        &self.inner.services.dicts
    }

    pub(crate) fn queues(
        &self,
    ) -> &GrpcClient<nimbus_grpc::proto::control::queue_service_client::QueueServiceClient<Channel>>
    {
        &self.inner.services.queues
    }

    pub(crate) fn volumes(&self) -> &GrpcClient<VolumeServiceClient<Channel>> {
        &self.inner.services.volumes
    }

    pub(crate) fn proxies(&self) -> &GrpcClient<ProxyServiceClient<Channel>> {
        &self.inner.services.proxies
    }

    pub(crate) fn blobs(&self) -> &GrpcClient<BlobServiceClient<Channel>> {
        &self.inner.services.blobs
    }

    pub(crate) fn heartbeats(&self) -> &HeartbeatRegistry {
        &self.inner.heartbeats
    }

    pub(crate) fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.inner.serializer
    }

    pub(crate) async fn auth_header(&self) -> Result<String, NimbusError> {
        self.inner.auth.get_token().await
    }

    /// Resolves the effective environment for a call: explicit argument,
    /// then the client's default, then "no environment" (the server falls
    /// back to the profile/server default in that case).
    pub(crate) fn resolve_environment(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::to_string)
            .or_else(|| self.inner.environment.clone())
    }

    /// Applies the fixed interception order: static token credentials, auth
    /// header, client identity + environment, then user middleware.
    pub(crate) async fn authorize<T>(&self, mut request: tonic::Request<T>) -> Result<tonic::Request<T>, NimbusError> {
        let token = self.auth_header().await?;
        let metadata = request.metadata_mut();
        metadata.insert(
            headers::TOKEN_ID,
            self.inner
                .token_id
                .parse()
                .map_err(|_| NimbusError::Internal("invalid token id header".to_string()))?,
        );
        metadata.insert(
            headers::TOKEN_SECRET,
            self.inner
                .token_secret
                .parse()
                .map_err(|_| NimbusError::Internal("invalid token secret header".to_string()))?,
        );
        metadata.insert(
            headers::AUTH_TOKEN,
            format!("Bearer {token}")
                .parse()
                .map_err(|_| NimbusError::Internal("invalid auth token header".to_string()))?,
        );
        metadata.insert(
            headers::CLIENT_TYPE,
            CLIENT_TYPE
                .parse()
                .map_err(|_| NimbusError::Internal("invalid client type header".to_string()))?,
        );
        metadata.insert(
            headers::CLIENT_VERSION,
            crate::config::client_version()
                .parse()
                .map_err(|_| NimbusError::Internal("invalid client version header".to_string()))?,
        );
        for mw in &self.inner.middleware {
            mw.apply(metadata);
        }
        Ok(request)
    }

    /// Opens (or reuses) the stub for a function's input-plane URL.
    pub(crate) async fn input_plane_stub(
        &self,
        url: &str,
    ) -> GrpcClient<AttemptServiceClient<Channel>> {
        let mut map = self.inner.input_plane.lock().await;
        if let Some(existing) = map.get(url) {
            return existing.clone();
        }
        let uri: http::Uri = url.parse().unwrap_or_else(|_| {
            http::Uri::from_static("http://invalid-input-plane-url.invalid")
        });
        let grpc_config = GrpcClientConfig {
            retries_on_unavailable: self.inner.retries.clone(),
            ..Default::default()
        };
        let stub = GrpcClient::new("input_plane", AttemptServiceClient::new, uri, grpc_config);
        map.insert(url.to_string(), stub.clone());
        stub
    }

    pub(crate) async fn cached_image_builder_version(&self, environment: &str) -> Option<String> {
        self.inner
            .image_builder_versions
            .lock()
            .await
            .get(environment)
            .cloned()
    }

    pub(crate) async fn cache_image_builder_version(&self, environment: &str, version: &str) {
        self.inner
            .image_builder_versions
            .lock()
            .await
            .insert(environment.to_string(), version.to_string());
    }

    /// Stops the token manager, cancels all ephemeral heartbeats and marks
    /// the client closed. Safe to call more than once.
    pub async fn close(&self) {
        let mut closed = self.inner.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        self.inner.auth.stop().await;
        self.inner.heartbeats.stop_all().await;
    }
}
