pub mod create;
pub mod exec;
pub mod filesystem;
pub mod image_mount;
pub mod streams;

pub use create::{SandboxParams, Sandboxes};
pub use exec::{ExecOptions, SandboxProcess, StreamMode};
pub use filesystem::FileHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nimbus_common::NimbusError;

use crate::client::Client;

const KIND: &str = "Sandbox";

/// A remote execution environment bound to an App. `Created -> Running ->
/// (TerminatedLocal | TerminatedRemote | Detached)`; once detached, every
/// remote-mutating operation fails with [`NimbusError::SandboxDetached`].
#[derive(Clone)]
pub struct Sandbox {
    pub(crate) client: Client,
    pub(crate) sandbox_id: String,
    pub(crate) task_id: String,
    pub(crate) name: Option<String>,
    detached: Arc<AtomicBool>,
}

impl Sandbox {
    pub(crate) fn new(client: Client, sandbox_id: String, task_id: String, name: Option<String>) -> Self {
        Self {
            client,
            sandbox_id,
            task_id,
            name,
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Marks the handle detached. Idempotent -- a second and third call are
    /// no-ops, and no RPC is issued.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub(crate) fn check_attached(&self) -> Result<(), NimbusError> {
        if self.is_detached() {
            Err(NimbusError::SandboxDetached(format!(
                "sandbox {} is detached",
                self.sandbox_id
            )))
        } else {
            Ok(())
        }
    }
}
