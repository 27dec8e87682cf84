pub mod dict;
pub mod image;
pub mod proxy;
pub mod queue;
pub mod secret;
pub mod volume;

pub use dict::Dict;
pub use image::Image;
pub use proxy::Proxy;
pub use queue::Queue;
pub use secret::Secret;
pub use volume::Volume;

use nimbus_common::NimbusError;

/// Shared shape for `delete(name, {allow_missing})`: absorb `NotFound` from
/// either the lookup or the delete step when the caller opted in.
pub(crate) fn absorb_not_found(
    result: Result<(), NimbusError>,
    allow_missing: bool,
) -> Result<(), NimbusError> {
    match result {
        Err(NimbusError::NotFound(_)) if allow_missing => Ok(()),
        other => other,
    }
}
