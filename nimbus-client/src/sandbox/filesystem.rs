use std::time::Duration;

use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::container_filesystem_exec_request::Op;
use nimbus_grpc::proto::control::{
    ContainerFilesystemExecGetOutputRequest, ContainerFilesystemExecGetOutputResponse,
    ContainerFilesystemExecRequest, FilesystemCloseRequest, FilesystemFlushRequest,
    FilesystemOpenRequest, FilesystemReadRequest, FilesystemWriteRequest,
};

use crate::client::Client;
use crate::rpc;
use crate::sandbox::Sandbox;

const MAX_OUTPUT_RETRIES: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const VALID_MODES: [&str; 6] = ["r", "w", "a", "r+", "w+", "a+"];

impl Sandbox {
    pub async fn open(&self, path: &str, mode: &str) -> Result<FileHandle, NimbusError> {
        self.check_attached()?;
        if !VALID_MODES.contains(&mode) {
            return Err(NimbusError::invalid_parameter(
                "mode",
                format!("must be one of {VALID_MODES:?}"),
            ));
        }

        let response = exec_op(
            &self.client,
            &self.task_id,
            Op::Open(FilesystemOpenRequest {
                path: path.to_string(),
                mode: mode.to_string(),
            }),
        )
        .await?;

        Ok(FileHandle {
            client: self.client.clone(),
            task_id: self.task_id.clone(),
            fd: response.fd,
        })
    }
}

/// Issues one `ContainerFilesystemExec` and polls its output via a bounded
/// loop; a retriable failure that survives `MAX_OUTPUT_RETRIES` attempts is
/// surfaced as `RemoteError`, per the filesystem RPC's error contract.
async fn exec_op(client: &Client, task_id: &str, op: Op) -> Result<ContainerFilesystemExecGetOutputResponse, NimbusError> {
    let start = rpc::call(
        client,
        client.filesystem(),
        "container_filesystem_exec",
        ContainerFilesystemExecRequest {
            task_id: task_id.to_string(),
            op: Some(op),
        },
        |c, r| Box::pin(c.container_filesystem_exec(r)),
    )
    .await?;

    let mut attempt = 0;
    loop {
        match rpc::call(
            client,
            client.filesystem(),
            "container_filesystem_exec_get_output",
            ContainerFilesystemExecGetOutputRequest {
                exec_id: start.exec_id.clone(),
            },
            |c, r| Box::pin(c.container_filesystem_exec_get_output(r)),
        )
        .await
        {
            Ok(response) if response.completed => {
                if !response.error_message.is_empty() {
                    return Err(NimbusError::RemoteError(response.error_message));
                }
                return Ok(response);
            }
            Ok(_) => {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(error) if error.is_retriable() && attempt < MAX_OUTPUT_RETRIES => {
                attempt += 1;
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(error) => return Err(NimbusError::RemoteError(error.to_string())),
        }
    }
}

/// An open remote file. Operations are not internally synchronized; callers
/// should not interleave concurrent reads and writes on the same handle.
pub struct FileHandle {
    client: Client,
    task_id: String,
    fd: u64,
}

impl FileHandle {
    pub async fn read(&self) -> Result<Vec<u8>, NimbusError> {
        let response = exec_op(&self.client, &self.task_id, Op::Read(FilesystemReadRequest { fd: self.fd })).await?;
        Ok(response.data)
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<(), NimbusError> {
        exec_op(
            &self.client,
            &self.task_id,
            Op::Write(FilesystemWriteRequest { fd: self.fd, data }),
        )
        .await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), NimbusError> {
        exec_op(&self.client, &self.task_id, Op::Flush(FilesystemFlushRequest { fd: self.fd })).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), NimbusError> {
        exec_op(&self.client, &self.task_id, Op::Close(FilesystemCloseRequest { fd: self.fd })).await?;
        Ok(())
    }
}
