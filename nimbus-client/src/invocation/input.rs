use std::time::{Duration, Instant};

use nimbus_common::NimbusError;
use nimbus_grpc::proto::input::attempt_await_response::Status as AttemptStatus;
use nimbus_grpc::proto::input::{AttemptAwaitRequest, AttemptRetryRequest, AttemptStartRequest};

use crate::client::Client;
use crate::invocation::{decode_output, encode_input, POLL_TIMEOUT};
use crate::rpc;

/// An invocation running against a function's dedicated input-plane stub,
/// identified by an opaque `attempt_token`.
pub struct InputPlaneInvocation {
    client: Client,
    input_plane_url: String,
    attempt_token: String,
}

impl InputPlaneInvocation {
    pub(crate) async fn start(
        client: &Client,
        input_plane_url: &str,
        function_id: &str,
        call_type: &str,
        args: &[u8],
    ) -> Result<Self, NimbusError> {
        let encoded = encode_input(client, args).await?;
        let request = AttemptStartRequest {
            function_id: function_id.to_string(),
            input_args: encoded.inline,
            input_args_blob_id: encoded.blob_id,
            data_format: String::new(),
            function_call_type: call_type.to_string(),
        };

        let stub = client.input_plane_stub(input_plane_url).await;
        let response = rpc::call(client, &stub, "attempt_start", request, |c, r| Box::pin(c.attempt_start(r))).await?;

        Ok(Self {
            client: client.clone(),
            input_plane_url: input_plane_url.to_string(),
            attempt_token: response.attempt_token,
        })
    }

    pub fn attempt_token(&self) -> &str {
        &self.attempt_token
    }

    pub async fn await_output(&self, timeout: Option<Duration>) -> Result<Vec<u8>, NimbusError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let stub = self.client.input_plane_stub(&self.input_plane_url).await;

        loop {
            let poll_timeout = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(POLL_TIMEOUT),
                None => POLL_TIMEOUT,
            };

            let request = AttemptAwaitRequest {
                attempt_token: self.attempt_token.clone(),
                timeout_secs: poll_timeout.as_secs() as u32,
            };
            let response = rpc::call(&self.client, &stub, "attempt_await", request, |c, r| {
                Box::pin(c.attempt_await(r))
            })
            .await?;

            match response.status() {
                AttemptStatus::Pending => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(self.timeout_error());
                    }
                    continue;
                }
                AttemptStatus::Success => return decode_output(response.data, &response.data_blob_id).await,
                AttemptStatus::Timeout => return Err(self.timeout_error()),
                AttemptStatus::InternalFailure => {
                    return Err(NimbusError::InternalFailure(response.exception_message))
                }
                AttemptStatus::Exception => return Err(NimbusError::RemoteError(response.exception_message)),
            }
        }
    }

    fn timeout_error(&self) -> NimbusError {
        NimbusError::FunctionTimeout(format!(
            "attempt {} timed out waiting for output",
            self.attempt_token
        ))
    }

    /// Issues `AttemptRetry`, which mints a fresh attempt token, and returns
    /// the invocation updated to poll that new attempt.
    pub async fn retry(self, attempt_number: u32) -> Result<Self, NimbusError> {
        let stub = self.client.input_plane_stub(&self.input_plane_url).await;
        let request = AttemptRetryRequest {
            attempt_token: self.attempt_token.clone(),
            attempt_number,
        };
        let response = rpc::call(&self.client, &stub, "attempt_retry", request, |c, r| {
            Box::pin(c.attempt_retry(r))
        })
        .await?;

        Ok(Self {
            client: self.client,
            input_plane_url: self.input_plane_url,
            attempt_token: response.attempt_token,
        })
    }
}
