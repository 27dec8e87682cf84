use base64::Engine;
use nimbus_common::NimbusError;
use nimbus_grpc::proto::control::BlobCreateRequest;

use crate::client::Client;
use crate::rpc;

/// Offloads a payload too large to inline: creates a blob record, then PUTs
/// the bytes straight to the presigned URL the server hands back.
pub(crate) async fn upload(client: &Client, payload: &[u8]) -> Result<String, NimbusError> {
    let digest = md5::compute(payload);
    let content_md5_base64 = base64::engine::general_purpose::STANDARD.encode(digest.0);

    let request = BlobCreateRequest {
        content_length: payload.len() as u64,
        content_md5_base64: content_md5_base64.clone(),
    };
    let response = rpc::call(client, client.blobs(), "blob_create", request, |c, r| {
        Box::pin(c.blob_create(r))
    })
    .await?;

    let http = reqwest::Client::new();
    let put = http
        .put(&response.put_url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .header("Content-MD5", content_md5_base64)
        .body(payload.to_vec())
        .send()
        .await
        .map_err(|error| NimbusError::Internal(format!("blob upload failed: {error}")))?;

    if !put.status().is_success() {
        return Err(NimbusError::Internal(format!(
            "blob upload returned status {}",
            put.status()
        )));
    }

    Ok(response.blob_id)
}

/// Fetches a previously-offloaded output payload. `blob_id` is the
/// server-issued fetch URL for the blob.
pub(crate) async fn download(blob_id: &str) -> Result<Vec<u8>, NimbusError> {
    let response = reqwest::get(blob_id)
        .await
        .map_err(|error| NimbusError::Internal(format!("blob download failed: {error}")))?;

    if !response.status().is_success() {
        return Err(NimbusError::Internal(format!(
            "blob download returned status {}",
            response.status()
        )));
    }

    Ok(response
        .bytes()
        .await
        .map_err(|error| NimbusError::Internal(format!("blob download failed: {error}")))?
        .to_vec())
}
