use std::sync::Arc;

use nimbus_common::model::{not_found_for, validate_object_name, App};
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::{
    VolumeDeleteRequest, VolumeGetOrCreateRequest, VolumeHeartbeatRequest,
};

use crate::client::Client;
use crate::collaborators::absorb_not_found;
use crate::heartbeat::EphemeralHandle;
use crate::rpc;

const KIND: &str = "Volume";

#[derive(Debug, Clone, Default)]
pub struct VolumeOptions {
    pub environment: Option<String>,
    pub create_if_missing: bool,
}

/// A distributed filesystem volume, mounted into sandboxes by id. `read_only`
/// derives a view sharing the same id that sandbox mounting must treat as
/// non-writable.
#[derive(Clone)]
pub struct Volume {
    client: Client,
    volume_id: String,
    name: Option<String>,
    read_only: bool,
    heartbeat: Option<Arc<EphemeralHandle>>,
}

impl Volume {
    pub async fn from_name(
        client: &Client,
        app: &App,
        name: &str,
        opts: VolumeOptions,
    ) -> Result<Self, NimbusError> {
        validate_object_name(KIND, name)?;
        let environment = client.resolve_environment(opts.environment.as_deref());
        let request = VolumeGetOrCreateRequest {
            app_id: app.id.clone(),
            object_name: name.to_string(),
            ephemeral: false,
            create_if_missing: opts.create_if_missing,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.volumes(), "volume_get_or_create", request, |c, r| {
            Box::pin(c.volume_get_or_create(r))
        })
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, name),
            other => other,
        })?;

        Ok(Self {
            client: client.clone(),
            volume_id: response.volume_id,
            name: Some(name.to_string()),
            read_only: false,
            heartbeat: None,
        })
    }

    pub async fn ephemeral(client: &Client, app: &App, environment: Option<&str>) -> Result<Self, NimbusError> {
        let environment = client.resolve_environment(environment);
        let request = VolumeGetOrCreateRequest {
            app_id: app.id.clone(),
            object_name: String::new(),
            ephemeral: true,
            create_if_missing: true,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.volumes(), "volume_get_or_create", request, |c, r| {
            Box::pin(c.volume_get_or_create(r))
        })
        .await?;

        let volume_id = response.volume_id;
        let heartbeat_client = client.clone();
        let heartbeat_volume_id = volume_id.clone();
        let heartbeat = client
            .heartbeats()
            .spawn(move || {
                let client = heartbeat_client.clone();
                let volume_id = heartbeat_volume_id.clone();
                async move {
                    rpc::call(
                        &client,
                        client.volumes(),
                        "volume_heartbeat",
                        VolumeHeartbeatRequest {
                            volume_id: volume_id.clone(),
                        },
                        |c, r| Box::pin(c.volume_heartbeat(r)),
                    )
                    .await
                    .map(|_| ())
                }
            })
            .await;

        Ok(Self {
            client: client.clone(),
            volume_id,
            name: None,
            read_only: false,
            heartbeat: Some(heartbeat),
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
            let volume = Self::from_name(
                client,
                app,
                name,
                VolumeOptions {
                    environment: environment.map(str::to_string),
                    create_if_missing: false,
                },
            )
            .await?;

            rpc::call(
                client,
                client.volumes(),
                "volume_delete",
                VolumeDeleteRequest {
                    volume_id: volume.volume_id,
                },
                |c, r| Box::pin(c.volume_delete(r)),
            )
            .await
            .map(|_| ())
        }
        .await;

        absorb_not_found(result, allow_missing)
    }

    pub async fn close_ephemeral(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.close().await;
        }
    }

    pub fn id(&self) -> &str {
        &self.volume_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Derives a read-only view over the same volume. Sandbox mounting must
    /// reject writes through a handle created this way.
    pub fn read_only(&self) -> Self {
        Self {
            client: self.client.clone(),
            volume_id: self.volume_id.clone(),
            name: self.name.clone(),
            read_only: true,
            heartbeat: self.heartbeat.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_object_name(KIND, "").is_err());
    }
}
