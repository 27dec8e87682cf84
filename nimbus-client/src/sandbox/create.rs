use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use futures::Stream;
use nimbus_common::model::{not_found_for, validate_object_name, App};
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::{
    CloudBucketMountSpec, GpuConfig, NetworkAccess, PtyInfo, SandboxCreateConnectTokenRequest,
    SandboxCreateRequest, SandboxDefinition, SandboxGetByNameRequest, SandboxGetRequest,
    SandboxGetTunnelsRequest, SandboxListRequest, SandboxPollRequest, SandboxSetTagsRequest,
    SandboxTerminateRequest, SandboxWaitRequest, TunnelInfo,
};

use crate::client::Client;
use crate::collaborators::{Proxy, Volume};
use crate::rpc;
use crate::sandbox::{Sandbox, KIND};

const POLL_WAIT_SECS: u32 = 55;

/// Parameters accepted by [`Sandboxes::create`]. Every field is optional;
/// defaults match an unconfigured sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxParams {
    pub command: Vec<String>,
    pub name: Option<String>,
    pub cloud: Option<String>,
    pub regions: Vec<String>,
    pub encrypted_ports: Vec<u32>,
    pub unencrypted_ports: Vec<u32>,
    pub block_network: bool,
    pub cidr_allowlist: Vec<String>,
    pub workdir: Option<String>,
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub secret_ids: Vec<String>,
    /// Mount path -> Volume.
    pub volumes: HashMap<String, Volume>,
    pub cloud_bucket_mounts: Vec<CloudBucketMountSpec>,
    pub proxy: Option<Proxy>,
    pub pty: bool,
    pub cpu: Option<f32>,
    pub cpu_limit: Option<f32>,
    pub memory_mib: Option<u32>,
    pub memory_limit_mib: Option<u32>,
    /// `"<type>[:<count>]"`; count defaults to 1.
    pub gpu: Option<String>,
    pub experimental_options: HashMap<String, bool>,
    pub environment: Option<String>,
}

impl SandboxParams {
    fn into_definition(self, app_id: String, image_id: String) -> Result<SandboxDefinition, NimbusError> {
        if let Some(name) = &self.name {
            validate_object_name(KIND, name)?;
        }

        if self.block_network && !self.cidr_allowlist.is_empty() {
            return Err(NimbusError::invalid_parameter(
                "cidr_allowlist",
                "requires block_network=false",
            ));
        }
        for cidr in &self.cidr_allowlist {
            validate_cidr(cidr)?;
        }

        if let Some(workdir) = &self.workdir {
            if !workdir.starts_with('/') {
                return Err(NimbusError::invalid_parameter("workdir", "must be an absolute path"));
            }
        }

        let timeout_secs = require_positive_whole_seconds("timeout", self.timeout)?;
        let idle_timeout_secs = require_positive_whole_seconds("idle_timeout", self.idle_timeout)?;

        if let Some(cpu) = self.cpu {
            if cpu <= 0.0 {
                return Err(NimbusError::invalid_parameter("cpu", "must be positive"));
            }
        }
        if let Some(memory_mib) = self.memory_mib {
            if memory_mib == 0 {
                return Err(NimbusError::invalid_parameter("memory_mib", "must be positive"));
            }
        }
        if let (Some(cpu), Some(cpu_limit)) = (self.cpu, self.cpu_limit) {
            if cpu_limit < cpu {
                return Err(NimbusError::invalid_parameter("cpu_limit", "must be >= cpu"));
            }
        }
        if let (Some(memory), Some(limit)) = (self.memory_mib, self.memory_limit_mib) {
            if limit < memory {
                return Err(NimbusError::invalid_parameter("memory_limit_mib", "must be >= memory_mib"));
            }
        }

        let gpu_config = self.gpu.as_deref().map(parse_gpu_config).transpose()?;

        let experimental_options = self
            .experimental_options
            .into_iter()
            .map(|(key, value)| nimbus_grpc::proto::control::GenericParam {
                key,
                value: Some(nimbus_grpc::proto::control::generic_param::Value::BoolValue(value)),
            })
            .collect();

        Ok(SandboxDefinition {
            app_id,
            command: self.command,
            name: self.name.unwrap_or_default(),
            cloud: self.cloud.unwrap_or_default(),
            regions: self.regions,
            encrypted_ports: self.encrypted_ports,
            unencrypted_ports: self.unencrypted_ports,
            network_access: Some(NetworkAccess {
                block_network: self.block_network,
                cidr_allowlist: Some(nimbus_grpc::proto::control::CidrAllowlist {
                    cidrs: self.cidr_allowlist,
                }),
            }),
            workdir: self.workdir.unwrap_or_default(),
            timeout_secs,
            idle_timeout_secs,
            secret_ids: self.secret_ids,
            volume_mounts: self
                .volumes
                .into_iter()
                .map(|(path, volume)| (path, volume.id().to_string()))
                .collect(),
            cloud_bucket_mounts: self.cloud_bucket_mounts,
            proxy_id: self.proxy.map(|p| p.id().to_string()).unwrap_or_default(),
            pty_info: self.pty.then(|| PtyInfo {
                rows: 24,
                cols: 80,
                term: "xterm-256color".to_string(),
                color_depth: "truecolor".to_string(),
            }),
            cpu: self.cpu.unwrap_or_default(),
            cpu_limit: self.cpu_limit.unwrap_or_default(),
            memory_mib: self.memory_mib.unwrap_or_default(),
            memory_limit_mib: self.memory_limit_mib.unwrap_or_default(),
            gpu_config,
            experimental_options,
            image_id,
        })
    }
}

fn require_positive_whole_seconds(name: &str, duration: Option<Duration>) -> Result<u32, NimbusError> {
    let Some(duration) = duration else {
        return Ok(0);
    };
    if duration.subsec_nanos() != 0 {
        return Err(NimbusError::invalid_parameter(name, "must be a whole number of seconds"));
    }
    let secs = duration.as_secs();
    if secs == 0 {
        return Err(NimbusError::invalid_parameter(name, "must be positive"));
    }
    Ok(secs as u32)
}

fn parse_gpu_config(spec: &str) -> Result<GpuConfig, NimbusError> {
    let (gpu_type, count) = match spec.split_once(':') {
        Some((t, c)) => (t, c),
        None => (spec, "1"),
    };
    if gpu_type.is_empty() {
        return Err(NimbusError::invalid_parameter("gpu", "type must not be empty"));
    }
    let count: u32 = count
        .parse()
        .ok()
        .filter(|&n: &u32| n > 0)
        .ok_or_else(|| NimbusError::invalid_parameter("gpu", "count must be a positive integer"))?;
    Ok(GpuConfig {
        gpu_type: gpu_type.to_string(),
        count,
    })
}

fn validate_cidr(cidr: &str) -> Result<(), NimbusError> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| NimbusError::invalid_parameter("cidr_allowlist", format!("{cidr:?} is not a CIDR")))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| NimbusError::invalid_parameter("cidr_allowlist", format!("{cidr:?} has an invalid address")))?;
    let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|&p| p <= max_prefix)
        .ok_or_else(|| NimbusError::invalid_parameter("cidr_allowlist", format!("{cidr:?} has an invalid prefix length")))?;
    let _ = prefix;
    Ok(())
}

/// Entry point for creating and looking up sandboxes.
pub struct Sandboxes;

impl Sandboxes {
    /// Ensures `image` is built, then issues `SandboxCreate`.
    pub async fn create(
        client: &Client,
        app: &App,
        image: &crate::collaborators::Image,
        params: SandboxParams,
    ) -> Result<Sandbox, NimbusError> {
        let environment = params.environment.clone();
        let built_image = image.build(app, environment.as_deref()).await?;
        let definition = params.into_definition(app.id.clone(), built_image.id().unwrap_or_default().to_string())?;

        let response = rpc::call(
            client,
            client.sandboxes(),
            "sandbox_create",
            SandboxCreateRequest {
                definition: Some(definition),
            },
            |c, r| Box::pin(c.sandbox_create(r)),
        )
        .await?;

        Ok(Sandbox::new(client.clone(), response.sandbox_id, response.task_id, None))
    }

    pub async fn from_id(client: &Client, sandbox_id: &str) -> Result<Sandbox, NimbusError> {
        let response = rpc::call(
            client,
            client.sandboxes(),
            "sandbox_get",
            SandboxGetRequest {
                sandbox_id: sandbox_id.to_string(),
            },
            |c, r| Box::pin(c.sandbox_get(r)),
        )
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, sandbox_id),
            other => other,
        })?;

        Ok(Sandbox::new(client.clone(), response.sandbox_id, response.task_id, None))
    }

    pub async fn from_name(
        client: &Client,
        app: &App,
        name: &str,
        environment: Option<&str>,
    ) -> Result<Sandbox, NimbusError> {
        validate_object_name(KIND, name)?;
        let environment = client.resolve_environment(environment);
        let response = rpc::call(
            client,
            client.sandboxes(),
            "sandbox_get_by_name",
            SandboxGetByNameRequest {
                app_id: app.id.clone(),
                sandbox_name: name.to_string(),
                environment_name: environment.unwrap_or_default(),
            },
            |c, r| Box::pin(c.sandbox_get_by_name(r)),
        )
        .await
        .map_err(|error| match error {
            NimbusError::NotFound(_) => not_found_for(KIND, name),
            other => other,
        })?;

        Ok(Sandbox::new(
            client.clone(),
            response.sandbox_id,
            response.task_id,
            Some(name.to_string()),
        ))
    }

    /// Lazily paginated listing; no RPC is issued until the stream is polled.
    pub fn list(
        client: &Client,
        app_id: Option<String>,
        tags: Vec<String>,
        before: Option<String>,
    ) -> impl Stream<Item = Result<SandboxSummary, NimbusError>> {
        struct State {
            cursor: String,
            buffer: std::collections::VecDeque<SandboxSummary>,
            done: bool,
        }

        let client = client.clone();
        futures::stream::unfold(
            State {
                cursor: before.unwrap_or_default(),
                buffer: std::collections::VecDeque::new(),
                done: false,
            },
            move |mut state| {
                let client = client.clone();
                let app_id = app_id.clone();
                let tags = tags.clone();
                async move {
                    if let Some(item) = state.buffer.pop_front() {
                        return Some((Ok(item), state));
                    }
                    if state.done {
                        return None;
                    }

                    let request = SandboxListRequest {
                        app_id: app_id.unwrap_or_default(),
                        tags,
                        before_cursor: state.cursor.clone(),
                    };
                    let response = match rpc::call(&client, client.sandboxes(), "sandbox_list", request, |c, r| {
                        Box::pin(c.sandbox_list(r))
                    })
                    .await
                    {
                        Ok(response) => response,
                        Err(error) => {
                            state.done = true;
                            return Some((Err(error), state));
                        }
                    };

                    state.done = response.next_cursor.is_empty();
                    state.cursor = response.next_cursor;
                    state.buffer.extend(response.sandboxes.into_iter().map(|item| SandboxSummary {
                        id: item.sandbox_id,
                        name: item.name,
                        tags: item.tags,
                    }));

                    let item = state.buffer.pop_front()?;
                    Some((Ok(item), state))
                }
            },
        )
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSummary {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
}

impl Sandbox {
    pub async fn terminate(&self) -> Result<(), NimbusError> {
        self.check_attached()?;
        rpc::call(
            &self.client,
            self.client.sandboxes(),
            "sandbox_terminate",
            SandboxTerminateRequest {
                sandbox_id: self.sandbox_id.clone(),
            },
            |c, r| Box::pin(c.sandbox_terminate(r)),
        )
        .await?;
        Ok(())
    }

    /// Blocks until the sandbox's PID 1 exits or `timeout` elapses.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<i32, NimbusError> {
        self.check_attached()?;
        let timeout_secs = timeout.map(|d| d.as_secs() as u32).unwrap_or(POLL_WAIT_SECS);
        let response = rpc::call(
            &self.client,
            self.client.sandboxes(),
            "sandbox_wait",
            SandboxWaitRequest {
                sandbox_id: self.sandbox_id.clone(),
                timeout_secs,
            },
            |c, r| Box::pin(c.sandbox_wait(r)),
        )
        .await?;

        if response.exited {
            Ok(response.exit_code)
        } else {
            Err(NimbusError::SandboxTimeout(format!(
                "sandbox {} did not exit within {timeout_secs}s",
                self.sandbox_id
            )))
        }
    }

    /// Non-blocking exit-code check; `None` means still running.
    pub async fn poll(&self) -> Result<Option<i32>, NimbusError> {
        self.check_attached()?;
        let response = rpc::call(
            &self.client,
            self.client.sandboxes(),
            "sandbox_poll",
            SandboxPollRequest {
                sandbox_id: self.sandbox_id.clone(),
            },
            |c, r| Box::pin(c.sandbox_poll(r)),
        )
        .await?;
        Ok(response.exited.then_some(response.exit_code))
    }

    pub async fn get_tunnels(&self) -> Result<Vec<TunnelInfo>, NimbusError> {
        self.check_attached()?;
        let response = rpc::call(
            &self.client,
            self.client.sandboxes(),
            "sandbox_get_tunnels",
            SandboxGetTunnelsRequest {
                sandbox_id: self.sandbox_id.clone(),
            },
            |c, r| Box::pin(c.sandbox_get_tunnels(r)),
        )
        .await?;
        Ok(response.tunnels)
    }

    pub async fn set_tags(&self, tags: HashMap<String, String>) -> Result<(), NimbusError> {
        self.check_attached()?;
        rpc::call(
            &self.client,
            self.client.sandboxes(),
            "sandbox_set_tags",
            SandboxSetTagsRequest {
                sandbox_id: self.sandbox_id.clone(),
                tags,
            },
            |c, r| Box::pin(c.sandbox_set_tags(r)),
        )
        .await?;
        Ok(())
    }

    pub async fn create_connect_token(&self) -> Result<String, NimbusError> {
        self.check_attached()?;
        let response = rpc::call(
            &self.client,
            self.client.sandboxes(),
            "sandbox_create_connect_token",
            SandboxCreateConnectTokenRequest {
                sandbox_id: self.sandbox_id.clone(),
            },
            |c, r| Box::pin(c.sandbox_create_connect_token(r)),
        )
        .await?;
        Ok(response.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn parses_gpu_with_default_count() {
        let gpu = parse_gpu_config("A100").unwrap();
        assert_eq!(gpu.gpu_type, "A100");
        assert_eq!(gpu.count, 1);
    }

    #[test]
    fn parses_gpu_with_explicit_count() {
        let gpu = parse_gpu_config("A100:4").unwrap();
        assert_eq!(gpu.count, 4);
    }

    #[test]
    fn rejects_zero_gpu_count() {
        assert!(parse_gpu_config("A100:0").is_err());
    }

    #[test]
    fn validates_cidrs() {
        assert!(validate_cidr("10.0.0.0/8").is_ok());
        assert!(validate_cidr("not-a-cidr").is_err());
        assert!(validate_cidr("10.0.0.0/99").is_err());
    }

    #[test]
    fn rejects_relative_workdir() {
        let params = SandboxParams {
            workdir: Some("relative/path".to_string()),
            ..Default::default()
        };
        assert!(params.into_definition("ap-1".to_string(), "im-1".to_string()).is_err());
    }

    #[test]
    fn rejects_allowlist_with_blocked_network() {
        let params = SandboxParams {
            block_network: true,
            cidr_allowlist: vec!["10.0.0.0/8".to_string()],
            ..Default::default()
        };
        assert!(params.into_definition("ap-1".to_string(), "im-1".to_string()).is_err());
    }
}
