use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use nimbus_common::model::{not_found_for, validate_object_name, App};
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::{
    DictClearRequest, DictContainsRequest, DictDeleteRequest, DictGetOrCreateRequest,
    DictGetRequest, DictHeartbeatRequest, DictListRequest, DictLenRequest, DictPopRequest,
    DictPutRequest,
};

use crate::client::Client;
use crate::collaborators::absorb_not_found;
use crate::heartbeat::EphemeralHandle;
use crate::rpc;

const KIND: &str = "Dict";

/// Options accepted by [`Dict::from_name`] and [`Dict::ephemeral`].
#[derive(Debug, Clone, Default)]
pub struct DictOptions {
    pub environment: Option<String>,
    pub create_if_missing: bool,
}

/// A handle to a remote key/value store. Keys and values are opaque blobs;
/// encoding them is the serializer's job, not this core's.
pub struct Dict {
    client: Client,
    dict_id: String,
    name: Option<String>,
    heartbeat: Option<Arc<EphemeralHandle>>,
}

impl Dict {
    pub async fn from_name(
        client: &Client,
        app: &App,
        name: &str,
        opts: DictOptions,
    ) -> Result<Self, NimbusError> {
        validate_object_name(KIND, name)?;
        let environment = client.resolve_environment(opts.environment.as_deref());
        let request = DictGetOrCreateRequest {
            app_id: app.id.clone(),
            object_name: name.to_string(),
            ephemeral: false,
            create_if_missing: opts.create_if_missing,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.dicts(), "dict_get_or_create", request, |c, r| {
            Box::pin(c.dict_get_or_create(r))
        })
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, name),
            other => other,
        })?;

        Ok(Self {
            client: client.clone(),
            dict_id: response.dict_id,
            name: Some(name.to_string()),
            heartbeat: None,
        })
    }

    pub async fn ephemeral(client: &Client, app: &App, environment: Option<&str>) -> Result<Self, NimbusError> {
        let environment = client.resolve_environment(environment);
        let request = DictGetOrCreateRequest {
            app_id: app.id.clone(),
            object_name: String::new(),
            ephemeral: true,
            create_if_missing: true,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.dicts(), "dict_get_or_create", request, |c, r| {
            Box::pin(c.dict_get_or_create(r))
        })
        .await?;

        let dict_id = response.dict_id;
        let heartbeat_client = client.clone();
        let heartbeat_dict_id = dict_id.clone();
        let heartbeat = client
            .heartbeats()
            .spawn(move || {
                let client = heartbeat_client.clone();
                let dict_id = heartbeat_dict_id.clone();
                async move {
                    rpc::call(
                        &client,
                        client.dicts(),
                        "dict_heartbeat",
                        DictHeartbeatRequest {
                            dict_id: dict_id.clone(),
                        },
                        |c, r| Box::pin(c.dict_heartbeat(r)),
                    )
                    .await
                    .map(|_| ())
                }
            })
            .await;

        Ok(Self {
            client: client.clone(),
            dict_id,
            name: None,
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
            let dict = Self::from_name(
                client,
                app,
                name,
                DictOptions {
                    environment: environment.map(str::to_string),
                    create_if_missing: false,
                },
            )
            .await?;

            rpc::call(
                client,
                client.dicts(),
                "dict_delete",
                DictDeleteRequest {
                    dict_id: dict.dict_id,
                },
                |c, r| Box::pin(c.dict_delete(r)),
            )
            .await
            .map(|_| ())
        }
        .await;

        absorb_not_found(result, allow_missing)
    }

    /// Stops this dict's heartbeat, if it has one. Idempotent.
    pub async fn close_ephemeral(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.close().await;
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, NimbusError> {
        let response = rpc::call(
            &self.client,
            self.client.dicts(),
            "dict_get",
            DictGetRequest {
                dict_id: self.dict_id.clone(),
                key: key.to_vec(),
            },
            |c, r| Box::pin(c.dict_get(r)),
        )
        .await?;
        Ok(response.found.then_some(response.value))
    }

    pub async fn put(&self, key: &[u8], value: &[u8], skip_if_exists: bool) -> Result<bool, NimbusError> {
        let response = rpc::call(
            &self.client,
            self.client.dicts(),
            "dict_put",
            DictPutRequest {
                dict_id: self.dict_id.clone(),
                key: key.to_vec(),
                value: value.to_vec(),
                skip_if_exists,
            },
            |c, r| Box::pin(c.dict_put(r)),
        )
        .await?;
        Ok(response.created)
    }

    /// Puts every entry in `items`. Entries after the first failure are not
    /// attempted; the caller sees the first error.
    pub async fn update(&self, items: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<(), NimbusError> {
        for (key, value) in items {
            self.put(&key, &value, false).await?;
        }
        Ok(())
    }

    pub async fn pop(&self, key: &[u8]) -> Result<Option<Vec<u8>>, NimbusError> {
        let response = rpc::call(
            &self.client,
            self.client.dicts(),
            "dict_pop",
            DictPopRequest {
                dict_id: self.dict_id.clone(),
                key: key.to_vec(),
            },
            |c, r| Box::pin(c.dict_pop(r)),
        )
        .await?;
        Ok(response.found.then_some(response.value))
    }

    pub async fn contains(&self, key: &[u8]) -> Result<bool, NimbusError> {
        let response = rpc::call(
            &self.client,
            self.client.dicts(),
            "dict_contains",
            DictContainsRequest {
                dict_id: self.dict_id.clone(),
                key: key.to_vec(),
            },
            |c, r| Box::pin(c.dict_contains(r)),
        )
        .await?;
        Ok(response.contains)
    }

    pub async fn len(&self) -> Result<u64, NimbusError> {
        let response = rpc::call(
            &self.client,
            self.client.dicts(),
            "dict_len",
            DictLenRequest {
                dict_id: self.dict_id.clone(),
            },
            |c, r| Box::pin(c.dict_len(r)),
        )
        .await?;
        Ok(response.len)
    }

    pub async fn clear(&self) -> Result<(), NimbusError> {
        rpc::call(
            &self.client,
            self.client.dicts(),
            "dict_clear",
            DictClearRequest {
                dict_id: self.dict_id.clone(),
            },
            |c, r| Box::pin(c.dict_clear(r)),
        )
        .await?;
        Ok(())
    }

    /// Lazily pages through every entry. A per-step error does not discard
    /// entries already yielded; the stream simply ends after surfacing it.
    pub fn items(&self) -> impl Stream<Item = Result<(Vec<u8>, Vec<u8>), NimbusError>> + '_ {
        futures::stream::unfold(IterState::default(), move |state| self.next_page(state))
    }

    pub fn keys(&self) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> + '_ {
        futures::stream::StreamExt::map(self.items(), |item| item.map(|(k, _)| k))
    }

    pub fn values(&self) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> + '_ {
        futures::stream::StreamExt::map(self.items(), |item| item.map(|(_, v)| v))
    }

    async fn next_page(
        &self,
        mut state: IterState,
    ) -> Option<(Result<(Vec<u8>, Vec<u8>), NimbusError>, IterState)> {
        loop {
            if let Some(entry) = state.buffer.pop_front() {
                return Some((Ok(entry), state));
            }
            if state.done {
                return None;
            }

            let request = DictListRequest {
                dict_id: self.dict_id.clone(),
                page_cursor: state.cursor.clone(),
            };
            match rpc::call(&self.client, self.client.dicts(), "dict_list", request, |c, r| {
                Box::pin(c.dict_list(r))
            })
            .await
            {
                Ok(response) => {
                    state.cursor = response.next_page_cursor;
                    if state.cursor.is_empty() {
                        state.done = true;
                    }
                    state
                        .buffer
                        .extend(response.entries.into_iter().map(|e| (e.key, e.value)));
                }
                Err(error) => {
                    state.done = true;
                    return Some((Err(error), state));
                }
            }
        }
    }
}

#[derive(Default)]
struct IterState {
    cursor: String,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    done: bool,
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
