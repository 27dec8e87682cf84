use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nimbus_common::model::{not_found_for, validate_object_name, App, DynamicValue};
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::{
    generic_param, FunctionBindParamsRequest, FunctionCallType, FunctionGetCurrentStatsRequest,
    FunctionGetRequest, FunctionUpdateSchedulingParamsRequest, GenericParam, HandleMetadata,
};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::client::Client;
use crate::invocation::control::ControlPlaneInvocation;
use crate::invocation::input::InputPlaneInvocation;
use crate::invocation::MAX_SYSTEM_RETRIES;
use crate::rpc;

const KIND: &str = "Function";

fn dynamic_value_to_generic_param(key: &str, value: &DynamicValue) -> GenericParam {
    let value = match value {
        DynamicValue::Bool(b) => generic_param::Value::BoolValue(*b),
        DynamicValue::Int(i) => generic_param::Value::IntValue(*i),
        DynamicValue::String(s) => generic_param::Value::StringValue(s.clone()),
        DynamicValue::Bytes(b) => generic_param::Value::BytesValue(b.clone()),
    };
    GenericParam {
        key: key.to_string(),
        value: Some(value),
    }
}

enum Invocation {
    ControlPlane(ControlPlaneInvocation),
    InputPlane(InputPlaneInvocation),
}

impl Invocation {
    async fn await_output(&self, timeout: Option<Duration>) -> Result<Vec<u8>, NimbusError> {
        match self {
            Invocation::ControlPlane(inv) => inv.await_output(timeout).await,
            Invocation::InputPlane(inv) => inv.await_output(timeout).await,
        }
    }
}

/// A callable handle to a deployed remote function.
pub struct Function {
    client: Client,
    function_id: String,
    handle: HandleMetadata,
}

impl Function {
    pub async fn from_name(
        client: &Client,
        app: &App,
        name: &str,
        environment: Option<&str>,
    ) -> Result<Self, NimbusError> {
        if name.contains('.') {
            return Err(NimbusError::invalid_argument(format!(
                "function name {name:?} contains '.'; use Cls::from_name to look up a class method"
            )));
        }
        validate_object_name(KIND, name)?;

        let environment = client.resolve_environment(environment);
        let request = FunctionGetRequest {
            app_id: app.id.clone(),
            function_name: name.to_string(),
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.functions(), "function_get", request, |c, r| {
            Box::pin(c.function_get(r))
        })
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, name),
            other => other,
        })?;

        Ok(Self {
            client: client.clone(),
            function_id: response.function_id,
            handle: response.handle_metadata.unwrap_or_default(),
        })
    }

    pub(crate) fn from_parts(client: Client, function_id: String, handle: HandleMetadata) -> Self {
        Self {
            client,
            function_id,
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.function_id
    }

    pub fn web_url(&self) -> Option<&str> {
        (!self.handle.web_url.is_empty()).then_some(self.handle.web_url.as_str())
    }

    fn is_input_plane_bound(&self) -> bool {
        !self.handle.input_plane_url.is_empty()
    }

    fn check_supported_format(&self) -> Result<(), NimbusError> {
        let format = self.client.serializer().format_tag();
        if self.handle.supported_input_formats.is_empty()
            || self
                .handle
                .supported_input_formats
                .iter()
                .any(|f| f == format)
        {
            Ok(())
        } else {
            Err(NimbusError::FailedPrecondition(format!(
                "remote function does not support the {format:?} input format; please redeploy the remote function"
            )))
        }
    }

    async fn invoke(&self, call_type: FunctionCallType, payload: &[u8]) -> Result<Invocation, NimbusError> {
        self.check_supported_format()?;

        if self.is_input_plane_bound() {
            let call_type_str = match call_type {
                FunctionCallType::Sync => "SYNC",
                FunctionCallType::Async => "ASYNC",
            };
            let invocation = InputPlaneInvocation::start(
                &self.client,
                &self.handle.input_plane_url,
                &self.function_id,
                call_type_str,
                payload,
            )
            .await?;
            Ok(Invocation::InputPlane(invocation))
        } else {
            let invocation = ControlPlaneInvocation::start(&self.client, &self.function_id, call_type, payload).await?;
            Ok(Invocation::ControlPlane(invocation))
        }
    }

    /// Invokes the function and waits for its result, transparently retrying
    /// up to [`MAX_SYSTEM_RETRIES`] `InternalFailure` outcomes.
    ///
    /// An input-plane invocation retries the same attempt via
    /// `AttemptRetry`; a control-plane invocation has no such RPC, so a
    /// retry there starts an entirely new `FunctionMap` call.
    pub async fn remote(&self, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value, NimbusError> {
        let payload = self.client.serializer().encode_call(args, kwargs)?;
        let mut invocation = self.invoke(FunctionCallType::Sync, &payload).await?;

        let mut attempt = 0;
        loop {
            match invocation.await_output(None).await {
                Ok(bytes) => return self.client.serializer().decode_result(&bytes),
                Err(NimbusError::InternalFailure(message)) => {
                    attempt += 1;
                    if attempt > MAX_SYSTEM_RETRIES {
                        return Err(NimbusError::InternalFailure(message));
                    }
                    invocation = match invocation {
                        Invocation::InputPlane(inv) => Invocation::InputPlane(inv.retry(attempt).await?),
                        Invocation::ControlPlane(_) => self.invoke(FunctionCallType::Sync, &payload).await?,
                    };
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Starts an async control-plane invocation and returns a handle that
    /// can be polled or cancelled independently.
    pub async fn spawn(&self, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<FunctionCall, NimbusError> {
        let payload = self.client.serializer().encode_call(args, kwargs)?;
        match self.invoke(FunctionCallType::Async, &payload).await? {
            Invocation::ControlPlane(inner) => Ok(FunctionCall {
                client: self.client.clone(),
                inner,
            }),
            Invocation::InputPlane(_) => Err(NimbusError::Internal(
                "spawn is only supported for control-plane functions".to_string(),
            )),
        }
    }
}

/// A handle to an in-flight async control-plane invocation.
pub struct FunctionCall {
    client: Client,
    inner: ControlPlaneInvocation,
}

impl FunctionCall {
    pub fn id(&self) -> &str {
        self.inner.function_call_id()
    }

    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value, NimbusError> {
        let bytes = self.inner.await_output(timeout).await?;
        self.client.serializer().decode_result(&bytes)
    }

    pub async fn cancel(&self) -> Result<(), NimbusError> {
        self.inner.cancel().await
    }
}

/// Accumulated per-call overrides composed via [`ClsHandle::with_options`]
/// and friends. `None` fields mean "leave as deployed".
#[derive(Debug, Clone, Default)]
pub struct FunctionOptions {
    pub timeout: Option<Duration>,
    pub scaledown_window: Option<Duration>,
    pub memory_mib: Option<u32>,
    pub memory_limit_mib: Option<u32>,
    pub cpu: Option<f32>,
    pub cpu_limit: Option<f32>,
    pub secrets: Vec<String>,
    pub volumes: HashMap<String, String>,
    pub max_concurrency: Option<u32>,
    pub target_concurrency: Option<u32>,
    pub batch_max_size: Option<u32>,
    pub batch_wait: Option<Duration>,
    pub retries: Option<u32>,
}

impl FunctionOptions {
    pub fn validate(&self) -> Result<(), NimbusError> {
        if let Some(timeout) = self.timeout {
            require_whole_seconds("timeout", timeout, 1)?;
        }
        if let Some(window) = self.scaledown_window {
            require_whole_seconds("scaledown_window", window, 1)?;
        }
        if let Some(memory) = self.memory_mib {
            if memory == 0 {
                return Err(NimbusError::invalid_parameter("memory_mib", "must be positive"));
            }
        }
        if let Some(cpu) = self.cpu {
            if cpu <= 0.0 {
                return Err(NimbusError::invalid_parameter("cpu", "must be positive"));
            }
        }
        if let (Some(cpu), Some(cpu_limit)) = (self.cpu, self.cpu_limit) {
            if cpu_limit < cpu {
                return Err(NimbusError::invalid_parameter("cpu_limit", "must be >= cpu"));
            }
        }
        if let (Some(memory), Some(memory_limit)) = (self.memory_mib, self.memory_limit_mib) {
            if memory_limit < memory {
                return Err(NimbusError::invalid_parameter("memory_limit_mib", "must be >= memory_mib"));
            }
        }
        Ok(())
    }

    /// Whether a non-empty `secrets` override should replace the deployed
    /// set. An empty list means "no change", not "clear the secrets".
    pub fn replace_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }

    /// Same rule as [`FunctionOptions::replace_secrets`], for volume mounts.
    pub fn replace_volumes(&self) -> bool {
        !self.volumes.is_empty()
    }

    fn merge(mut self, other: FunctionOptions) -> FunctionOptions {
        macro_rules! take_some {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take_some!(timeout);
        take_some!(scaledown_window);
        take_some!(memory_mib);
        take_some!(memory_limit_mib);
        take_some!(cpu);
        take_some!(cpu_limit);
        take_some!(max_concurrency);
        take_some!(target_concurrency);
        take_some!(batch_max_size);
        take_some!(batch_wait);
        take_some!(retries);
        if !other.secrets.is_empty() {
            self.secrets = other.secrets;
        }
        if !other.volumes.is_empty() {
            self.volumes = other.volumes;
        }
        self
    }
}

fn require_whole_seconds(name: &str, duration: Duration, min_secs: u64) -> Result<(), NimbusError> {
    if duration.subsec_nanos() != 0 {
        return Err(NimbusError::invalid_parameter(name, "must be a whole number of seconds"));
    }
    if duration.as_secs() < min_secs {
        return Err(NimbusError::invalid_parameter(
            name,
            format!("must be >= {min_secs}s"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct AutoscalerUpdate {
    pub min_containers: Option<u32>,
    pub max_containers: Option<u32>,
    pub buffer_containers: Option<u32>,
    pub scaledown_window: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct FunctionStats {
    pub backlog: u64,
    pub num_total_runners: u64,
}

/// A bound reference to a remote class, from which per-instance `Function`
/// handles are minted via `FunctionBindParams`.
pub struct Cls {
    client: Client,
    service_function_id: String,
    handle: HandleMetadata,
}

impl Cls {
    pub async fn from_name(
        client: &Client,
        app: &App,
        name: &str,
        environment: Option<&str>,
    ) -> Result<Self, NimbusError> {
        validate_object_name("Cls", name)?;
        let environment = client.resolve_environment(environment);
        let request = FunctionGetRequest {
            app_id: app.id.clone(),
            function_name: name.to_string(),
            environment_name: environment.unwrap_or_default(),
        };

        let response = rpc::call(client, client.functions(), "function_get", request, |c, r| {
            Box::pin(c.function_get(r))
        })
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for("Cls", name),
            other => other,
        })?;

        Ok(Self {
            client: client.clone(),
            service_function_id: response.function_id,
            handle: response.handle_metadata.unwrap_or_default(),
        })
    }

    pub fn handle(&self) -> ClsHandle {
        ClsHandle {
            client: self.client.clone(),
            service_function_id: self.service_function_id.clone(),
            handle: self.handle.clone(),
            options: FunctionOptions::default(),
            identity_cache: Arc::new(AsyncMutex::new(None)),
        }
    }
}

#[derive(Clone)]
pub struct ClsHandle {
    client: Client,
    service_function_id: String,
    handle: HandleMetadata,
    options: FunctionOptions,
    identity_cache: Arc<AsyncMutex<Option<Function>>>,
}

impl ClsHandle {
    pub fn with_options(&self, options: FunctionOptions) -> Result<Self, NimbusError> {
        options.validate()?;
        Ok(Self {
            options: self.options.clone().merge(options),
            identity_cache: Arc::new(AsyncMutex::new(None)),
            ..self.clone()
        })
    }

    pub fn with_concurrency(&self, max_concurrency: u32, target_concurrency: u32) -> Result<Self, NimbusError> {
        self.with_options(FunctionOptions {
            max_concurrency: Some(max_concurrency),
            target_concurrency: Some(target_concurrency),
            ..Default::default()
        })
    }

    pub fn with_batching(&self, max_size: u32, wait: Duration) -> Result<Self, NimbusError> {
        self.with_options(FunctionOptions {
            batch_max_size: Some(max_size),
            batch_wait: Some(wait),
            ..Default::default()
        })
    }

    pub fn with_retries(&self, retries: u32) -> Result<Self, NimbusError> {
        self.with_options(FunctionOptions {
            retries: Some(retries),
            ..Default::default()
        })
    }

    /// Binds class parameters and returns a callable `Function`. An empty
    /// parameter list reuses a cached identity instance instead of issuing a
    /// fresh `FunctionBindParams` call every time.
    pub async fn instance(&self, parameters: &[(String, DynamicValue)]) -> Result<Function, NimbusError> {
        if parameters.is_empty() {
            let mut cache = self.identity_cache.lock().await;
            if let Some(existing) = &*cache {
                return Ok(Function::from_parts(
                    self.client.clone(),
                    existing.id().to_string(),
                    self.handle.clone(),
                ));
            }
            let bound = self.bind(parameters).await?;
            *cache = Some(Function::from_parts(
                self.client.clone(),
                bound.id().to_string(),
                self.handle.clone(),
            ));
            return Ok(bound);
        }

        self.bind(parameters).await
    }

    async fn bind(&self, parameters: &[(String, DynamicValue)]) -> Result<Function, NimbusError> {
        let request = FunctionBindParamsRequest {
            function_id: self.service_function_id.clone(),
            parameters: parameters
                .iter()
                .map(|(k, v)| dynamic_value_to_generic_param(k, v))
                .collect(),
        };
        let response = rpc::call(
            &self.client,
            self.client.functions(),
            "function_bind_params",
            request,
            |c, r| Box::pin(c.function_bind_params(r)),
        )
        .await?;

        Ok(Function::from_parts(
            self.client.clone(),
            response.bound_function_id,
            response.handle_metadata.unwrap_or_default(),
        ))
    }

    pub async fn update_autoscaler(&self, update: AutoscalerUpdate) -> Result<(), NimbusError> {
        if let Some(window) = update.scaledown_window {
            require_whole_seconds("scaledown_window", window, 1)?;
        }
        let request = FunctionUpdateSchedulingParamsRequest {
            function_id: self.service_function_id.clone(),
            min_containers: update.min_containers,
            max_containers: update.max_containers,
            buffer_containers: update.buffer_containers,
            scaledown_window_secs: update.scaledown_window.map(|d| d.as_secs() as u32),
        };
        rpc::call(
            &self.client,
            self.client.functions(),
            "function_update_scheduling_params",
            request,
            |c, r| Box::pin(c.function_update_scheduling_params(r)),
        )
        .await?;
        Ok(())
    }

    pub async fn get_current_stats(&self) -> Result<FunctionStats, NimbusError> {
        let response = rpc::call(
            &self.client,
            self.client.functions(),
            "function_get_current_stats",
            FunctionGetCurrentStatsRequest {
                function_id: self.service_function_id.clone(),
            },
            |c, r| Box::pin(c.function_get_current_stats(r)),
        )
        .await?;
        Ok(FunctionStats {
            backlog: response.backlog,
            num_total_runners: response.num_total_runners,
        })
    }

    pub fn get_web_url(&self) -> Option<&str> {
        (!self.handle.web_url.is_empty()).then_some(self.handle.web_url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rejects_sub_second_timeout() {
        let options = FunctionOptions {
            timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_limit_below_request() {
        let options = FunctionOptions {
            cpu: Some(2.0),
            cpu_limit: Some(1.0),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn empty_secrets_is_not_a_replace() {
        let options = FunctionOptions::default();
        assert!(!options.replace_secrets());
        let options = FunctionOptions {
            secrets: vec!["s-1".to_string()],
            ..Default::default()
        };
        assert!(options.replace_secrets());
    }
}
