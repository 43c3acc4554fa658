use crate::errors::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Directory under the output mount reserved for the bootstrap
pub const RESERVED_OUTPUT_DIR: &str = ".codegen";

/// Host-side directories backing one environment's two mounts.
///
/// ```text
/// <base>/<run-id>/
/// ├── inputs/              mounted read-only
/// │   ├── bootstrap.py
/// │   ├── code.py
/// │   └── vars/            marshaled variables
/// └── outputs/             mounted read-write
///     └── .codegen/        run summary + declared outputs
/// ```
///
/// Removed on drop.
pub struct Workspace {
    run_id: String,
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl Workspace {
    /// Create a fresh workspace under `base`
    pub fn new(base: &Path) -> Result<Self> {
        let run_id = format!("codegen-{}", uuid::Uuid::new_v4().simple());
        let path = base.join(&run_id);
        std::fs::create_dir_all(path.join("inputs").join("vars"))?;
        std::fs::create_dir_all(path.join("outputs"))?;

        info!("[SANDBOX] Created workspace: {:?}", path);

        Ok(Self {
            run_id,
            path,
            cleanup_on_drop: true,
        })
    }

    /// Run-scoped identifier, also used to name the environment
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory mounted read-only at the input mount point
    pub fn input_dir(&self) -> PathBuf {
        self.path.join("inputs")
    }

    /// Directory mounted read-write at the output mount point
    pub fn output_dir(&self) -> PathBuf {
        self.path.join("outputs")
    }

    pub fn vars_dir(&self) -> PathBuf {
        self.input_dir().join("vars")
    }

    pub fn reserved_dir(&self) -> PathBuf {
        self.output_dir().join(RESERVED_OUTPUT_DIR)
    }

    pub fn declared_outputs_dir(&self) -> PathBuf {
        self.reserved_dir().join("vars")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.reserved_dir().join("result.json")
    }

    /// Generated code replaced the reserved directory with a link or a file
    pub fn reserved_dir_replaced(&self) -> bool {
        matches!(std::fs::symlink_metadata(self.reserved_dir()), Ok(meta) if !meta.is_dir())
    }

    /// Keep the workspace on disk for inspection (don't cleanup on drop)
    pub fn keep(&mut self) {
        warn!("[SANDBOX] Keeping workspace {:?}", self.path);
        self.cleanup_on_drop = false;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "[SANDBOX] Failed to cleanup workspace {:?}: {}",
                    self.path, e
                );
            } else {
                info!("[SANDBOX] Cleaned up workspace: {:?}", self.path);
            }
        }
    }
}
