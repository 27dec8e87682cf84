use std::collections::HashMap;

use nimbus_common::model::{not_found_for, validate_object_name, App};
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::{SecretDeleteRequest, SecretGetOrCreateRequest};

use crate::client::Client;
use crate::collaborators::absorb_not_found;
use crate::rpc;

const KIND: &str = "Secret";

#[derive(Debug, Clone, Default)]
pub struct SecretLookupOptions {
    pub environment: Option<String>,
    /// Keys the caller asserts must be present; the server rejects the
    /// lookup if any are missing.
    pub required_keys: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SecretFromMapOptions {
    /// Naming a secret makes it persistent; omitting it creates an
    /// anonymous, unshared secret with no heartbeat of its own.
    pub name: Option<String>,
    pub environment: Option<String>,
}

/// A handle to a set of environment variables injected into sandboxes and
/// function containers. The values themselves never round-trip back to the
/// caller once created.
pub struct Secret {
    secret_id: String,
    name: Option<String>,
}

impl Secret {
    pub async fn from_name(
        client: &Client,
        app: &App,
        name: &str,
        opts: SecretLookupOptions,
    ) -> Result<Self, NimbusError> {
        validate_object_name(KIND, name)?;
        let environment = client.resolve_environment(opts.environment.as_deref());
        let request = SecretGetOrCreateRequest {
            app_id: app.id.clone(),
            secret_name: name.to_string(),
            env_dict: HashMap::new(),
            required_keys: opts.required_keys,
            create_if_missing: false,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.secrets(), "secret_get_or_create", request, |c, r| {
            Box::pin(c.secret_get_or_create(r))
        })
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, name),
            other => other,
        })?;

        Ok(Self {
            secret_id: response.secret_id,
            name: Some(name.to_string()),
        })
    }

    pub async fn from_map(
        client: &Client,
        app: &App,
        env_dict: HashMap<String, String>,
        opts: SecretFromMapOptions,
    ) -> Result<Self, NimbusError> {
        if let Some(name) = &opts.name {
            validate_object_name(KIND, name)?;
        }
        let environment = client.resolve_environment(opts.environment.as_deref());
        let request = SecretGetOrCreateRequest {
            app_id: app.id.clone(),
            secret_name: opts.name.clone().unwrap_or_default(),
            env_dict,
            required_keys: Vec::new(),
            create_if_missing: true,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.secrets(), "secret_get_or_create", request, |c, r| {
            Box::pin(c.secret_get_or_create(r))
        })
        .await?;

        Ok(Self {
            secret_id: response.secret_id,
            name: opts.name,
        })
    }

    pub async fn delete(
        client: &Client,
        app: &App,
        name: &str,
        environment: Option<&str>,
        allow_missing: bool,
    ) -> Result<(), NimbusError> {
        let result: Result<(), NimbusError> = async {
            let secret = Self::from_name(
                client,
                app,
                name,
                SecretLookupOptions {
                    environment: environment.map(str::to_string),
                    required_keys: Vec::new(),
                },
            )
            .await?;

            rpc::call(
                client,
                client.secrets(),
                "secret_delete",
                SecretDeleteRequest {
                    secret_id: secret.secret_id,
                },
                |c, r| Box::pin(c.secret_delete(r)),
            )
            .await
            .map(|_| ())
        }
        .await;

        absorb_not_found(result, allow_missing)
    }

    pub fn id(&self) -> &str {
        &self.secret_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_object_name(KIND, "bad name").is_err());
    }
}
