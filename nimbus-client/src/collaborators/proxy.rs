use nimbus_common::model::{not_found_for, validate_object_name, App};
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::ProxyGetOrCreateRequest;

use crate::client::Client;
use crate::rpc;

const KIND: &str = "Proxy";

#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub environment: Option<String>,
}

/// A named network proxy, referenced by id when creating a sandbox.
pub struct Proxy {
    proxy_id: String,
    name: String,
}

impl Proxy {
    pub async fn from_name(client: &Client, app: &App, name: &str, opts: ProxyOptions) -> Result<Self, NimbusError> {
        validate_object_name(KIND, name)?;
        let environment = client.resolve_environment(opts.environment.as_deref());
        let request = ProxyGetOrCreateRequest {
            app_id: app.id.clone(),
            object_name: name.to_string(),
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.proxies(), "proxy_get_or_create", request, |c, r| {
            Box::pin(c.proxy_get_or_create(r))
        })
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, name),
            other => other,
        })?;

        Ok(Self {
            proxy_id: response.proxy_id,
            name: name.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.proxy_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_object_name(KIND, "has space").is_err());
    }
}
