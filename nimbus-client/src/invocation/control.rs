use std::time::{Duration, Instant};

use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::function_output::Status as OutputStatus;
use nimbus_grpc::proto::control::{
    FunctionCallCancelRequest, FunctionCallType, FunctionGetOutputsRequest, FunctionInput,
    FunctionMapRequest,
};

use crate::client::Client;
use crate::invocation::{decode_output, encode_input, POLL_TIMEOUT};
use crate::rpc;

/// An invocation running through the control plane, identified by a
/// `function_call_id` that outlives the call that created it (so it can be
/// polled again after a process restart, given the id).
pub struct ControlPlaneInvocation {
    client: Client,
    function_call_id: String,
}

impl ControlPlaneInvocation {
    pub(crate) async fn start(
        client: &Client,
        function_id: &str,
        call_type: FunctionCallType,
        args: &[u8],
    ) -> Result<Self, NimbusError> {
        let encoded = encode_input(client, args).await?;
        let request = FunctionMapRequest {
            function_id: function_id.to_string(),
            invocation_type: call_type as i32,
            input: Some(FunctionInput {
                args: encoded.inline,
                args_blob_id: encoded.blob_id,
                data_format: String::new(),
            }),
        };

        let response = rpc::call(client, client.functions(), "function_map", request, |c, r| {
            Box::pin(c.function_map(r))
        })
        .await?;

        Ok(Self {
            client: client.clone(),
            function_call_id: response.function_call_id,
        })
    }

    pub fn function_call_id(&self) -> &str {
        &self.function_call_id
    }

    /// Polls `FunctionGetOutputs` until a terminal output arrives or the
    /// caller's timeout elapses. `timeout = Some(Duration::ZERO)` performs
    /// exactly one non-blocking poll.
    pub async fn await_output(&self, timeout: Option<Duration>) -> Result<Vec<u8>, NimbusError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut last_entry_id = "0-0".to_string();

        loop {
            let poll_timeout = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(POLL_TIMEOUT),
                None => POLL_TIMEOUT,
            };

            let request = FunctionGetOutputsRequest {
                function_call_id: self.function_call_id.clone(),
                max_values: 1,
                timeout_secs: poll_timeout.as_secs() as u32,
                last_entry_id: last_entry_id.clone(),
                clear_on_success: true,
            };
            let response = rpc::call(
                &self.client,
                self.client.functions(),
                "function_get_outputs",
                request,
                |c, r| Box::pin(c.function_get_outputs(r)),
            )
            .await?;

            let Some(output) = response.outputs.into_iter().next() else {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(self.timeout_error());
                }
                continue;
            };

            last_entry_id = output.entry_id.clone();
            return match output.status() {
                OutputStatus::Success => decode_output(output.data, &output.data_blob_id).await,
                OutputStatus::Timeout => Err(self.timeout_error()),
                OutputStatus::InternalFailure => Err(NimbusError::InternalFailure(output.exception_message)),
                OutputStatus::Exception => Err(NimbusError::RemoteError(output.exception_message)),
            };
        }
    }

    fn timeout_error(&self) -> NimbusError {
        NimbusError::FunctionTimeout(format!(
            "function call {} timed out waiting for output",
            self.function_call_id
        ))
    }

    pub async fn cancel(&self) -> Result<(), NimbusError> {
        rpc::call(
            &self.client,
            self.client.function_calls(),
            "function_call_cancel",
            FunctionCallCancelRequest {
                function_call_id: self.function_call_id.clone(),
            },
            |c, r| Box::pin(c.function_call_cancel(r)),
        )
        .await?;
        Ok(())
    }
}
