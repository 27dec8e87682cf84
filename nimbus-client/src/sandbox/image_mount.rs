use std::time::Duration;

use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::{
    SandboxMountImageRequest, SandboxSnapshotDirectoryRequest, SandboxSnapshotFilesystemRequest,
};

use crate::collaborators::Image;
use crate::rpc;
use crate::sandbox::Sandbox;

impl Sandbox {
    /// Attaches a pre-built image at `path` inside the running sandbox. With
    /// no `image`, mounts an empty writable layer instead.
    pub async fn mount_image(&self, path: &str, image: Option<&Image>) -> Result<(), NimbusError> {
        self.check_attached()?;

        let image_id = match image {
            Some(image) => image
                .id()
                .ok_or_else(|| NimbusError::invalid_argument("Image must be built before mounting"))?
                .to_string(),
            None => String::new(),
        };

        rpc::call(
            &self.client,
            self.client.sandbox_images(),
            "sandbox_mount_image",
            SandboxMountImageRequest {
                sandbox_id: self.sandbox_id.clone(),
                path: path.to_string(),
                image_id,
            },
            |c, r| Box::pin(c.sandbox_mount_image(r)),
        )
        .await?;
        Ok(())
    }

    pub async fn snapshot_filesystem(&self, timeout: Option<Duration>) -> Result<Image, NimbusError> {
        self.check_attached()?;
        let response = rpc::call(
            &self.client,
            self.client.sandbox_images(),
            "sandbox_snapshot_filesystem",
            SandboxSnapshotFilesystemRequest {
                sandbox_id: self.sandbox_id.clone(),
                timeout_secs: timeout.map(|d| d.as_secs() as u32).unwrap_or_default(),
            },
            |c, r| Box::pin(c.sandbox_snapshot_filesystem(r)),
        )
        .await?;
        Ok(Image::from_id(&self.client, response.image_id))
    }

    pub async fn snapshot_directory(&self, path: &str) -> Result<Image, NimbusError> {
        self.check_attached()?;
        let response = rpc::call(
            &self.client,
            self.client.sandbox_images(),
            "sandbox_snapshot_directory",
            SandboxSnapshotDirectoryRequest {
                sandbox_id: self.sandbox_id.clone(),
                path: path.to_string(),
            },
            |c, r| Box::pin(c.sandbox_snapshot_directory(r)),
        )
        .await?;
        Ok(Image::from_id(&self.client, response.image_id))
    }
}
