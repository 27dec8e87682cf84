use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use nimbus_common::{ExpBackoff, NimbusError};
use nimbus_grpc::proto::control::{SandboxGetLogsRequest, SandboxStdinWriteRequest};
use tracing::debug;

use crate::client::Client;
use crate::rpc;
use crate::sandbox::Sandbox;

const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

impl Sandbox {
    /// Lazy, restartable byte stream. No `SandboxGetLogs` call is made until
    /// the stream is first polled.
    pub fn stdout(&self) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> {
        log_stream(self.client.clone(), self.sandbox_id.clone(), false)
    }

    pub fn stderr(&self) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> {
        log_stream(self.client.clone(), self.sandbox_id.clone(), true)
    }

    pub fn stdin(&self) -> SandboxStdin {
        SandboxStdin {
            client: self.client.clone(),
            sandbox_id: self.sandbox_id.clone(),
            index: Arc::new(AtomicU64::new(0)),
        }
    }
}

fn log_stream(client: Client, sandbox_id: String, stderr: bool) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> {
    struct State {
        entry_id: String,
        backoff: ExpBackoff,
        done: bool,
    }

    futures::stream::unfold(
        State {
            entry_id: String::new(),
            backoff: ExpBackoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
            done: false,
        },
        move |mut state| {
            let client = client.clone();
            let sandbox_id = sandbox_id.clone();
            async move {
                loop {
                    if state.done {
                        return None;
                    }

                    let request = SandboxGetLogsRequest {
                        sandbox_id: sandbox_id.clone(),
                        last_entry_id: state.entry_id.clone(),
                        stderr,
                    };
                    match rpc::call(&client, client.sandboxes(), "sandbox_get_logs", request, |c, r| {
                        Box::pin(c.sandbox_get_logs(r))
                    })
                    .await
                    {
                        Ok(response) => {
                            state.entry_id = response.entry_id;
                            state.done = response.eof;
                            state.backoff.reset();
                            if response.data.is_empty() && !response.eof {
                                continue;
                            }
                            return Some((Ok(response.data), state));
                        }
                        Err(error) if error.is_retriable() => {
                            let delay = state.backoff.next_delay();
                            debug!(sandbox_id, ?delay, %error, "log stream reconnecting after transient failure");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        Err(error) => {
                            state.done = true;
                            return Some((Err(error), state));
                        }
                    }
                }
            }
        },
    )
}

/// Single-writer stdin handle. `write` and `close` each send one
/// `SandboxStdinWrite` with a monotonically increasing append cursor.
pub struct SandboxStdin {
    client: Client,
    sandbox_id: String,
    index: Arc<AtomicU64>,
}

impl SandboxStdin {
    pub async fn write(&self, data: Vec<u8>) -> Result<(), NimbusError> {
        self.send(data, false).await
    }

    pub async fn close(&self) -> Result<(), NimbusError> {
        self.send(Vec::new(), true).await
    }

    async fn send(&self, data: Vec<u8>, eof: bool) -> Result<(), NimbusError> {
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        rpc::call(
            &self.client,
            self.client.sandboxes(),
            "sandbox_stdin_write",
            SandboxStdinWriteRequest {
                sandbox_id: self.sandbox_id.clone(),
                data,
                index,
                eof,
            },
            |c, r| Box::pin(c.sandbox_stdin_write(r)),
        )
        .await?;
        Ok(())
    }
}
