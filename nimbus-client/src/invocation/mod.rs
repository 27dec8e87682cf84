pub mod blob;
pub mod control;
pub mod input;

use std::time::Duration;

use nimbus_common::NimbusError;

use crate::client::Client;

/// Payloads at or under this size travel inline; larger ones are offloaded
/// to blob storage and referenced by id.
pub(crate) const MAX_INLINE: usize = 2 * 1024 * 1024;

/// Transparent retry budget for `InternalFailure` outcomes in `Function::remote`.
pub(crate) const MAX_SYSTEM_RETRIES: u32 = 8;

/// Longest a single output-polling RPC is allowed to block, independent of
/// the caller's own deadline.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_secs(55);

pub(crate) struct EncodedInput {
    pub inline: Vec<u8>,
    pub blob_id: String,
}

/// Encodes a serialized call payload for the wire: inline if it fits,
/// otherwise uploaded to blob storage first. Multipart upload hints from the
/// server are not supported by this core.
pub(crate) async fn encode_input(client: &Client, payload: &[u8]) -> Result<EncodedInput, NimbusError> {
    if payload.len() <= MAX_INLINE {
        Ok(EncodedInput {
            inline: payload.to_vec(),
            blob_id: String::new(),
        })
    } else {
        let blob_id = blob::upload(client, payload).await?;
        Ok(EncodedInput {
            inline: Vec::new(),
            blob_id,
        })
    }
}

/// Reads a terminal output payload, following `data_blob_id` when the data
/// was too large to inline.
pub(crate) async fn decode_output(data: Vec<u8>, data_blob_id: &str) -> Result<Vec<u8>, NimbusError> {
    if data_blob_id.is_empty() {
        Ok(data)
    } else {
        blob::download(data_blob_id).await
    }
}
