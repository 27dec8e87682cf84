use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use nimbus_common::{ExpBackoff, NimbusError};
use nimbus_grpc::proto::control::{
    ContainerExecRequest, TaskExecGetOutputRequest, TaskExecStdinWriteRequest, TaskExecWaitRequest,
};
use tracing::debug;

use crate::client::Client;
use crate::rpc;
use crate::sandbox::Sandbox;

const MAX_ARGV_BYTES: usize = 1 << 16;
const OUTPUT_POLL_TIMEOUT_SECS: u32 = 30;
const WAIT_POLL_TIMEOUT_SECS: u32 = 55;
const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Pipe,
    Ignore,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub workdir: Option<String>,
    pub timeout: Option<Duration>,
    pub pty: bool,
    pub secret_ids: Vec<String>,
    pub env: HashMap<String, String>,
    /// `None` means `Pipe`.
    pub stdout: Option<StreamMode>,
    pub stderr: Option<StreamMode>,
}

impl Sandbox {
    /// Starts a process via `ContainerExec`. Argv byte-length is validated
    /// locally before any RPC is made.
    pub async fn exec(&self, argv: &[impl AsRef<str>], opts: ExecOptions) -> Result<SandboxProcess, NimbusError> {
        self.check_attached()?;

        let command: Vec<String> = argv.iter().map(|a| a.as_ref().to_string()).collect();
        let total_bytes: usize = command.iter().map(|a| a.len()).sum();
        if total_bytes >= MAX_ARGV_BYTES {
            return Err(NimbusError::invalid_parameter(
                "argv",
                format!("combined argument length must be < {MAX_ARGV_BYTES} bytes"),
            ));
        }

        let stdout_mode = opts.stdout.unwrap_or(StreamMode::Pipe);
        let stderr_mode = opts.stderr.unwrap_or(StreamMode::Pipe);

        let response = rpc::call(
            &self.client,
            self.client.containers(),
            "container_exec",
            ContainerExecRequest {
                sandbox_id: self.sandbox_id.clone(),
                command,
                workdir: opts.workdir.unwrap_or_default(),
                env: opts.env,
                secret_ids: opts.secret_ids,
                pty: opts.pty,
                timeout_secs: opts.timeout.map(|d| d.as_secs() as u32).unwrap_or_default(),
                stdout_ignore: stdout_mode == StreamMode::Ignore,
                stderr_ignore: stderr_mode == StreamMode::Ignore,
            },
            |c, r| Box::pin(c.container_exec(r)),
        )
        .await?;

        let process = SandboxProcess {
            client: self.client.clone(),
            exec_id: response.exec_id,
            stdin_index: Arc::new(AtomicU64::new(0)),
        };

        if stdout_mode == StreamMode::Ignore {
            process.spawn_drain(false);
        }
        if stderr_mode == StreamMode::Ignore {
            process.spawn_drain(true);
        }

        Ok(process)
    }
}

async fn read_output_once(
    client: &Client,
    exec_id: &str,
    stderr: bool,
    last_entry_id: &str,
) -> Result<(Vec<u8>, String, bool), NimbusError> {
    let response = rpc::call(
        client,
        client.containers(),
        "task_exec_get_output",
        TaskExecGetOutputRequest {
            exec_id: exec_id.to_string(),
            last_entry_id: last_entry_id.to_string(),
            stderr,
        },
        |c, r| Box::pin(c.task_exec_get_output(r)),
    )
    .await?;
    Ok((response.data, response.entry_id, response.eof))
}

/// A started in-sandbox process. `stdout`/`stderr` are lazy resumable byte
/// streams (`read_stdout`/`read_stderr`); `stdin_write`/`stdin_close` append
/// to the remote pipe with a local cursor.
#[derive(Clone)]
pub struct SandboxProcess {
    client: Client,
    exec_id: String,
    stdin_index: Arc<AtomicU64>,
}

impl SandboxProcess {
    pub fn id(&self) -> &str {
        &self.exec_id
    }

    fn output_stream(&self, stderr: bool) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> {
        struct State {
            entry_id: String,
            backoff: ExpBackoff,
            done: bool,
        }

        let client = self.client.clone();
        let exec_id = self.exec_id.clone();
        futures::stream::unfold(
            State {
                entry_id: String::new(),
                backoff: ExpBackoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
                done: false,
            },
            move |mut state| {
                let client = client.clone();
                let exec_id = exec_id.clone();
                async move {
                    loop {
                        if state.done {
                            return None;
                        }
                        match read_output_once(&client, &exec_id, stderr, &state.entry_id).await {
                            Ok((data, entry_id, eof)) => {
                                state.entry_id = entry_id;
                                state.done = eof;
                                state.backoff.reset();
                                if data.is_empty() && !eof {
                                    continue;
                                }
                                return Some((Ok(data), state));
                            }
                            Err(error) if error.is_retriable() => {
                                let delay = state.backoff.next_delay();
                                debug!(exec_id, ?delay, %error, "exec output read failed, retrying");
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

    pub fn read_stdout(&self) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> {
        self.output_stream(false)
    }

    pub fn read_stderr(&self) -> impl Stream<Item = Result<Vec<u8>, NimbusError>> {
        self.output_stream(true)
    }

    fn spawn_drain(&self, stderr: bool) {
        let process = self.clone();
        tokio::spawn(async move {
            let stream = process.output_stream(stderr);
            futures::pin_mut!(stream);
            while futures_util::StreamExt::next(&mut stream).await.is_some() {}
        });
    }

    pub async fn stdin_write(&self, data: Vec<u8>) -> Result<(), NimbusError> {
        let index = self.stdin_index.fetch_add(1, Ordering::SeqCst);
        rpc::call(
            &self.client,
            self.client.containers(),
            "task_exec_stdin_write",
            TaskExecStdinWriteRequest {
                exec_id: self.exec_id.clone(),
                data,
                index,
                eof: false,
            },
            |c, r| Box::pin(c.task_exec_stdin_write(r)),
        )
        .await?;
        Ok(())
    }

    pub async fn stdin_close(&self) -> Result<(), NimbusError> {
        let index = self.stdin_index.fetch_add(1, Ordering::SeqCst);
        rpc::call(
            &self.client,
            self.client.containers(),
            "task_exec_stdin_write",
            TaskExecStdinWriteRequest {
                exec_id: self.exec_id.clone(),
                data: Vec::new(),
                index,
                eof: true,
            },
            |c, r| Box::pin(c.task_exec_stdin_write(r)),
        )
        .await?;
        Ok(())
    }

    /// Blocks until the process exits or `timeout` elapses. A signal-killed
    /// process reports `128 + signal`, per the server's own convention.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<i32, NimbusError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let poll_timeout = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(tokio::time::Instant::now())
                    .as_secs()
                    .min(WAIT_POLL_TIMEOUT_SECS as u64) as u32,
                None => WAIT_POLL_TIMEOUT_SECS,
            };

            let response = rpc::call(
                &self.client,
                self.client.containers(),
                "task_exec_wait",
                TaskExecWaitRequest {
                    exec_id: self.exec_id.clone(),
                    timeout_secs: poll_timeout,
                },
                |c, r| Box::pin(c.task_exec_wait(r)),
            )
            .await?;

            if response.exited {
                return Ok(response.exit_code);
            }

            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Err(NimbusError::SandboxTimeout(format!(
                    "exec {} did not exit within the requested timeout",
                    self.exec_id
                )));
            }
        }
    }
}
