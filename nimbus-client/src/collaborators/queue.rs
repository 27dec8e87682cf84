use std::sync::Arc;

use futures::Stream;
use nimbus_common::model::{not_found_for, validate_object_name, App};
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::{
    QueueDeleteRequest, QueueGetOrCreateRequest, QueueGetRequest, QueueHeartbeatRequest,
    QueueIterateRequest, QueuePutRequest,
};

use crate::client::Client;
use crate::collaborators::absorb_not_found;
use crate::heartbeat::EphemeralHandle;
use crate::rpc;

const KIND: &str = "Queue";

/// Poll window used by a single [`Queue::iterate`] long-poll request.
const DEFAULT_ITEM_POLL_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub environment: Option<String>,
    pub create_if_missing: bool,
}

/// Blocking behavior for a single put/get: `None` blocks indefinitely until
/// the server accepts or returns data; `Some(0)` never blocks.
pub type QueueTimeout = Option<u32>;

pub struct Queue {
    client: Client,
    queue_id: String,
    name: Option<String>,
    heartbeat: Option<Arc<EphemeralHandle>>,
}

impl Queue {
    pub async fn from_name(
        client: &Client,
        app: &App,
        name: &str,
        opts: QueueOptions,
    ) -> Result<Self, NimbusError> {
        validate_object_name(KIND, name)?;
        let environment = client.resolve_environment(opts.environment.as_deref());
        let request = QueueGetOrCreateRequest {
            app_id: app.id.clone(),
            object_name: name.to_string(),
            ephemeral: false,
            create_if_missing: opts.create_if_missing,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.queues(), "queue_get_or_create", request, |c, r| {
            Box::pin(c.queue_get_or_create(r))
        })
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, name),
            other => other,
        })?;

        Ok(Self {
            client: client.clone(),
            queue_id: response.queue_id,
            name: Some(name.to_string()),
            heartbeat: None,
        })
    }

    pub async fn ephemeral(client: &Client, app: &App, environment: Option<&str>) -> Result<Self, NimbusError> {
        let environment = client.resolve_environment(environment);
        let request = QueueGetOrCreateRequest {
            app_id: app.id.clone(),
            object_name: String::new(),
            ephemeral: true,
            create_if_missing: true,
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.queues(), "queue_get_or_create", request, |c, r| {
            Box::pin(c.queue_get_or_create(r))
        })
        .await?;

        let queue_id = response.queue_id;
        let heartbeat_client = client.clone();
        let heartbeat_queue_id = queue_id.clone();
        let heartbeat = client
            .heartbeats()
            .spawn(move || {
                let client = heartbeat_client.clone();
                let queue_id = heartbeat_queue_id.clone();
                async move {
                    rpc::call(
                        &client,
                        client.queues(),
                        "queue_heartbeat",
                        QueueHeartbeatRequest {
                            queue_id: queue_id.clone(),
                        },
                        |c, r| Box::pin(c.queue_heartbeat(r)),
                    )
                    .await
                    .map(|_| ())
                }
            })
            .await;

        Ok(Self {
            client: client.clone(),
            queue_id,
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
            let queue = Self::from_name(
                client,
                app,
                name,
                QueueOptions {
                    environment: environment.map(str::to_string),
                    create_if_missing: false,
                },
            )
            .await?;

            rpc::call(
                client,
                client.queues(),
                "queue_delete",
                QueueDeleteRequest {
                    queue_id: queue.queue_id,
                },
                |c, r| Box::pin(c.queue_delete(r)),
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

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub async fn put_many(
        &self,
        values: Vec<Vec<u8>>,
        partition: &str,
        timeout_ms: QueueTimeout,
    ) -> Result<(), NimbusError> {
        rpc::call(
            &self.client,
            self.client.queues(),
            "queue_put",
            QueuePutRequest {
                queue_id: self.queue_id.clone(),
                partition: partition.to_string(),
                values,
                timeout_ms,
            },
            |c, r| Box::pin(c.queue_put(r)),
        )
        .await?;
        Ok(())
    }

    pub async fn put(&self, value: &[u8], partition: &str, timeout_ms: QueueTimeout) -> Result<(), NimbusError> {
        self.put_many(vec![value.to_vec()], partition, timeout_ms).await
    }

    /// Returns up to `n_values` items. On `timeout_ms == Some(0)` with nothing
    /// available, returns an empty vec (callers wanting the spec's
    /// `QueueEmpty` signal on a single-item get should use [`Queue::get`]).
    pub async fn get_many(
        &self,
        n_values: u32,
        partition: &str,
        timeout_ms: QueueTimeout,
    ) -> Result<Vec<Vec<u8>>, NimbusError> {
        let response = rpc::call(
            &self.client,
            self.client.queues(),
            "queue_get",
            QueueGetRequest {
                queue_id: self.queue_id.clone(),
                partition: partition.to_string(),
                n_values,
                timeout_ms,
            },
            |c, r| Box::pin(c.queue_get(r)),
        )
        .await?;
        Ok(response.values)
    }

    pub async fn get(&self, partition: &str, timeout_ms: QueueTimeout) -> Result<Vec<u8>, NimbusError> {
        let mut values = self.get_many(1, partition, timeout_ms).await?;
        if values.is_empty() {
            return Err(NimbusError::QueueEmpty);
        }
        Ok(values.remove(0))
    }

    /// Yields values forever until the server reports EOF or the stream is
    /// dropped. Resumes via `entry_id` across reconnects.
    pub fn iterate(
        &self,
        partition: &str,
        item_poll_timeout_ms: Option<u32>,
    ) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> + '_ {
        let partition = partition.to_string();
        let poll_timeout = item_poll_timeout_ms.unwrap_or(DEFAULT_ITEM_POLL_TIMEOUT_MS);
        futures::stream::unfold(
            IterateState {
                entry_id: String::new(),
                buffer: Vec::new().into_iter(),
                done: false,
            },
            move |state| self.next_item(state, partition.clone(), poll_timeout),
        )
    }

    async fn next_item(
        &self,
        mut state: IterateState,
        partition: String,
        poll_timeout_ms: u32,
    ) -> Option<(Result<Vec<u8>, NimbusError>, IterateState)> {
        loop {
            if let Some(value) = state.buffer.next() {
                return Some((Ok(value), state));
            }
            if state.done {
                return None;
            }

            let request = QueueIterateRequest {
                queue_id: self.queue_id.clone(),
                partition: partition.clone(),
                entry_id: state.entry_id.clone(),
                item_poll_timeout_ms: poll_timeout_ms,
            };
            match rpc::call(&self.client, self.client.queues(), "queue_iterate", request, |c, r| {
                Box::pin(c.queue_iterate(r))
            })
            .await
            {
                Ok(response) => {
                    state.entry_id = response.next_entry_id;
                    state.done = response.eof;
                    state.buffer = response.values.into_iter();
                }
                Err(error) => {
                    state.done = true;
                    return Some((Err(error), state));
                }
            }
        }
    }
}

struct IterateState {
    entry_id: String,
    buffer: std::vec::IntoIter<Vec<u8>>,
    done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_object_name(KIND, "has/slash").is_err());
    }
}
