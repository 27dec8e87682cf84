use nimbus_common::model::App;
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::image_join_streaming_response::Status as JoinStatus;
use nimbus_grpc::proto::control::{
    DockerfileSpec, GpuConfig, ImageGetOrCreateRequest, ImageJoinStreamingRequest,
};

use crate::client::Client;
use crate::rpc;

/// One unbuilt layer in a dependency-ordered chain; `base_image_id` is filled
/// in from the previous layer's built id at build time.
#[derive(Debug, Clone)]
struct ImageLayer {
    commands: Vec<String>,
    secret_ids: Vec<String>,
    gpu: Option<GpuConfig>,
    force_build: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DockerfileCommandsOptions {
    pub secret_ids: Vec<String>,
    pub gpu: Option<GpuConfig>,
    pub force_build: bool,
}

/// A (possibly unbuilt) image: either an opaque built id, or a chain of
/// dockerfile layers to build in order.
#[derive(Clone)]
pub struct Image {
    client: Client,
    id: Option<String>,
    layers: Vec<ImageLayer>,
}

impl Image {
    /// A fresh, empty image with no layers. Building it without adding any
    /// layers is a no-op that yields an image with no id -- callers should
    /// add at least one layer via [`Image::dockerfile_commands`].
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.clone(),
            id: None,
            layers: Vec::new(),
        }
    }

    /// An already-built image, referenced directly by id.
    pub fn from_id(client: &Client, image_id: impl Into<String>) -> Self {
        Self {
            client: client.clone(),
            id: Some(image_id.into()),
            layers: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_built(&self) -> bool {
        self.id.is_some()
    }

    /// Appends a layer to the chain, rejecting dockerfile lines that `COPY`
    /// from the local build context -- the core has no file upload path, so
    /// only `COPY --from=<stage>` (copying between stages already on the
    /// remote side) is permitted.
    pub fn dockerfile_commands(
        &self,
        lines: &[impl AsRef<str>],
        opts: DockerfileCommandsOptions,
    ) -> Result<Self, NimbusError> {
        for line in lines {
            validate_dockerfile_line(line.as_ref())?;
        }

        let mut layers = self.layers.clone();
        layers.push(ImageLayer {
            commands: lines.iter().map(|l| l.as_ref().to_string()).collect(),
            secret_ids: opts.secret_ids,
            gpu: opts.gpu,
            force_build: opts.force_build,
        });

        Ok(Self {
            client: self.client.clone(),
            id: None,
            layers,
        })
    }

    /// Builds every unbuilt layer in order. Already-built images (or images
    /// with no layers) return immediately.
    pub async fn build(&self, app: &App, environment: Option<&str>) -> Result<Self, NimbusError> {
        if self.id.is_some() || self.layers.is_empty() {
            return Ok(self.clone());
        }

        let mut layers = self.layers.clone();
        propagate_force_build(&mut layers);

        let environment = self.client.resolve_environment(environment).unwrap_or_default();
        let image_builder_version = self
            .client
            .cached_image_builder_version(&environment)
            .await
            .unwrap_or_default();

        let mut base_image_id = String::new();
        for layer in &layers {
            let request = ImageGetOrCreateRequest {
                app_id: app.id.clone(),
                dockerfile_spec: Some(DockerfileSpec {
                    commands: layer.commands.clone(),
                }),
                secret_ids: layer.secret_ids.clone(),
                gpu_config: layer.gpu.clone(),
                force_build: layer.force_build,
                base_image_id: base_image_id.clone(),
                image_builder_version: image_builder_version.clone(),
            };

            let response = rpc::call(
                &self.client,
                self.client.images(),
                "image_get_or_create",
                request,
                |c, r| Box::pin(c.image_get_or_create(r)),
            )
            .await?;

            self.join_streaming(&response.image_id).await?;
            base_image_id = response.image_id;
        }

        Ok(Self {
            client: self.client.clone(),
            id: Some(base_image_id),
            layers: Vec::new(),
        })
    }

    async fn join_streaming(&self, image_id: &str) -> Result<(), NimbusError> {
        let request = ImageJoinStreamingRequest {
            image_id: image_id.to_string(),
        };
        let authorized = self.client.authorize(tonic::Request::new(request)).await?;

        let mut stream = self
            .client
            .images()
            .call(|c| Box::pin(c.image_join_streaming(authorized)))
            .await
            .map_err(NimbusError::from)?
            .into_inner();

        loop {
            let Some(update) = futures_util::StreamExt::next(&mut stream).await else {
                return Err(NimbusError::Internal(
                    "image build stream closed before a terminal status".to_string(),
                ));
            };
            let update = update.map_err(NimbusError::from)?;
            match update.status() {
                JoinStatus::Pending => continue,
                JoinStatus::Success => return Ok(()),
                JoinStatus::Failure => return Err(NimbusError::RemoteError(update.result_diagnostics)),
            }
        }
    }
}

/// If any layer forces a build, every earlier layer in the chain must be
/// forced too: a rebuilt ancestor gets a new id, which invalidates every
/// layer built on top of it.
fn propagate_force_build(layers: &mut [ImageLayer]) {
    if let Some(last_forced) = layers.iter().rposition(|l| l.force_build) {
        for layer in &mut layers[..=last_forced] {
            layer.force_build = true;
        }
    }
}

fn validate_dockerfile_line(line: &str) -> Result<(), NimbusError> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(());
    }
    let Some(token) = trimmed.split_whitespace().next() else {
        return Ok(());
    };
    if !token.eq_ignore_ascii_case("COPY") {
        return Ok(());
    }
    let remainder = &trimmed[token.len()..];
    if remainder.contains("--from=") {
        return Ok(());
    }
    Err(NimbusError::invalid_parameter(
        "lines",
        format!("dockerfile line {line:?} copies from the local build context, which this core cannot upload; use `COPY --from=<stage>` instead"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn rejects_local_copy() {
        assert!(validate_dockerfile_line("COPY . /app").is_err());
        assert!(validate_dockerfile_line("copy requirements.txt /tmp").is_err());
    }

    #[test]
    fn allows_copy_from_stage() {
        assert!(validate_dockerfile_line("COPY --from=builder /app /app").is_ok());
    }

    #[test]
    fn allows_unrelated_lines_and_comments() {
        assert!(validate_dockerfile_line("# a comment").is_ok());
        assert!(validate_dockerfile_line("RUN apt-get update").is_ok());
        assert!(validate_dockerfile_line("").is_ok());
    }

    #[test]
    fn force_build_propagates_to_ancestors() {
        let mut layers = vec![
            ImageLayer {
                commands: vec![],
                secret_ids: vec![],
                gpu: None,
                force_build: false,
            },
            ImageLayer {
                commands: vec![],
                secret_ids: vec![],
                gpu: None,
                force_build: false,
            },
            ImageLayer {
                commands: vec![],
                secret_ids: vec![],
                gpu: None,
                force_build: true,
            },
        ];
        propagate_force_build(&mut layers);
        assert!(layers.iter().all(|l| l.force_build));
    }
}
