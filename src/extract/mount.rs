use std::fs;
use std::path::Path;

use super::tool::{self, RunOutcome, ToolBox};
use super::{Extractable, Method};
use crate::detect::FsType;
use crate::error::{ImageError, Result};

/// Read-only loop mount through the host's `mount` binary.
///
/// Needs root or a configured privilege helper; the engine never escalates
/// on its own.
pub struct LoopMount {
    fs_type: FsType,
}

impl LoopMount {
    pub fn new(fs_type: FsType) -> Self {
        Self { fs_type }
    }

    /// Detaches the mount at `target`. A target that is not mounted is a no-op.
    pub fn release(fs_type: FsType, target: &Path, tools: &ToolBox) -> Result<()> {
        let mut cmd = tools.privileged_command("umount")?;
        cmd.arg(target);

        match tool::run(cmd, None, tools.uses_privilege_helper())? {
            RunOutcome::Finished(output) if output.status.success() => {
                tracing::info!("Unmounted {}", target.display());
                Ok(())
            }
            RunOutcome::Finished(output) => {
                if output.stderr.contains("not mounted") {
                    tracing::debug!("{} was not mounted", target.display());
                    return Ok(());
                }
                if output.mentions_permission_problem() {
                    return Err(ImageError::PermissionDenied(output.summary()));
                }
                Err(ImageError::MountFailed {
                    fs_type,
                    reason: format!("unmount failed: {}", output.summary()),
                })
            }
            RunOutcome::TimedOut(_) => Err(ImageError::MountFailed {
                fs_type,
                reason: "unmount timed out".to_string(),
            }),
        }
    }
}

impl Extractable for LoopMount {
    fn name(&self) -> &'static str {
        "loop-mount"
    }

    fn method(&self) -> Method {
        Method::Mount
    }

    fn extract(&self, image: &Path, target: &Path, tools: &ToolBox) -> Result<()> {
        let mount_type = self
            .fs_type
            .mount_type()
            .ok_or(ImageError::UnsupportedType(self.fs_type))?;
        fs::create_dir_all(target)?;

        let mut cmd = tools.privileged_command("mount")?;
        cmd.args(["-t", mount_type, "-o", "loop,ro"])
            .arg(image)
            .arg(target);
        tracing::info!(
            "Mounting {} image {} at {}",
            self.fs_type,
            image.display(),
            target.display()
        );

        // No timeout: mount may be waiting on a password prompt
        let output = match tool::run(cmd, None, tools.uses_privilege_helper())? {
            RunOutcome::Finished(output) => output,
            RunOutcome::TimedOut(_) => {
                return Err(ImageError::MountFailed {
                    fs_type: self.fs_type,
                    reason: "mount timed out".to_string(),
                });
            }
        };

        if !output.status.success() {
            if output.mentions_permission_problem() {
                return Err(ImageError::PermissionDenied(format!(
                    "mounting requires elevated privileges ({})",
                    output.summary()
                )));
            }
            return Err(ImageError::MountFailed {
                fs_type: self.fs_type,
                reason: output.summary(),
            });
        }

        if tool::is_mount_point(target) == Some(false) {
            return Err(ImageError::MountFailed {
                fs_type: self.fs_type,
                reason: format!("{} is not in the mount table after mount", target.display()),
            });
        }

        tracing::info!("Mounted {} at {}", self.fs_type, target.display());
        Ok(())
    }
}
