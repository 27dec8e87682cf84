use nimbus_common::RetryConfig;

/// Metadata headers attached to every outgoing request (spec section 6).
pub mod headers {
    pub const TOKEN_ID: &str = "x-nimbus-token-id";
    pub const TOKEN_SECRET: &str = "x-nimbus-token-secret";
    pub const AUTH_TOKEN: &str = "x-nimbus-auth-token";
    pub const CLIENT_TYPE: &str = "x-nimbus-client-type";
    pub const CLIENT_VERSION: &str = "x-nimbus-client-version";
}

/// Build-time identity sent on every call. The exact semver comes from
/// `CARGO_PKG_VERSION`; config-file/env resolution of the rest of this
/// struct's fields is handled by the caller, not by this core.
pub const CLIENT_TYPE: &str = "libnimbus";

pub fn client_version() -> String {
    format!("rust/{}", env!("CARGO_PKG_VERSION"))
}

/// Construction parameters for [`crate::Client`]. Resolving these from a
/// profile file, environment variables or CLI flags is outside the core's
/// scope; this core only consumes the final, resolved values.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub control_plane_uri: http::Uri,
    pub token_id: String,
    pub token_secret: String,
    pub environment: Option<String>,
    pub retries: RetryConfig,
}

impl ClientConfig {
    pub fn new(control_plane_uri: http::Uri, token_id: String, token_secret: String) -> Self {
        Self {
            control_plane_uri,
            token_id,
            token_secret,
            environment: None,
            retries: RetryConfig::default(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}
