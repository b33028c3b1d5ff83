use std::ffi::OsString;
use std::fs;
use std::path::Path;

use super::tool::{self, RunOutcome, ToolBox};
use super::{Extractable, Method, has_entries};
use crate::detect::FsType;
use crate::error::{ImageError, Result};

/// What the unpacker expects to find at the target path before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// The tool writes into an existing directory.
    Existing,
    /// The tool refuses to run if the directory exists.
    Absent,
    /// The tool creates the directory itself but tolerates an existing one.
    Either,
}

/// Runs a user-space unpacker that writes the image contents as plain files.
pub struct Unpacker {
    fs_type: FsType,
    tool: &'static str,
    target: Target,
    args: fn(&Path, &Path) -> Vec<OsString>,
}

impl Unpacker {
    pub fn for_type(fs_type: FsType) -> Option<Self> {
        let (tool, target, args): (&'static str, Target, fn(&Path, &Path) -> Vec<OsString>) =
            match fs_type {
                FsType::SquashFs => ("unsquashfs", Target::Either, |image, target| {
                    vec!["-f".into(), "-d".into(), target.into(), image.into()]
                }),
                FsType::Jffs2 => ("jefferson", Target::Either, |image, target| {
                    vec!["-f".into(), "-d".into(), target.into(), image.into()]
                }),
                FsType::Yaffs2 => ("unyaffs", Target::Existing, |image, target| {
                    vec![image.into(), target.into()]
                }),
                FsType::Ubifs => ("ubireader_extract_files", Target::Either, |image, target| {
                    vec!["-o".into(), target.into(), image.into()]
                }),
                FsType::CramFs => ("cramfsck", Target::Absent, |image, target| {
                    vec!["-x".into(), target.into(), image.into()]
                }),
                FsType::Ext => ("debugfs", Target::Existing, |image, target| {
                    let request = format!("rdump / \"{}\"", target.display());
                    vec!["-R".into(), request.into(), image.into()]
                }),
                FsType::Unknown => return None,
            };
        Some(Self {
            fs_type,
            tool,
            target,
            args,
        })
    }

    pub fn tool(&self) -> &'static str {
        self.tool
    }

    fn failed(&self, reason: impl Into<String>) -> ImageError {
        ImageError::UnpackFailed {
            fs_type: self.fs_type,
            reason: reason.into(),
        }
    }
}

impl Extractable for Unpacker {
    fn name(&self) -> &'static str {
        self.tool
    }

    fn method(&self) -> Method {
        Method::Unpack
    }

    fn extract(&self, image: &Path, target: &Path, tools: &ToolBox) -> Result<()> {
        let mut cmd = tools.command(self.tool)?;

        match self.target {
            Target::Existing => fs::create_dir_all(target)?,
            Target::Absent if target.exists() => {
                return Err(self.failed(format!("{} already exists", target.display())));
            }
            Target::Absent | Target::Either => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
        }

        cmd.args((self.args)(image, target));
        tracing::info!("Unpacking {} image with {}", self.fs_type, self.tool);

        match tool::run(cmd, tools.timeout(), false)? {
            RunOutcome::TimedOut(limit) => Err(self.failed(format!(
                "{} timed out after {}s",
                self.tool,
                limit.as_secs()
            ))),
            RunOutcome::Finished(output) if !output.status.success() => {
                if output.mentions_permission_problem() {
                    return Err(ImageError::PermissionDenied(output.summary()));
                }
                if has_entries(target) {
                    tracing::warn!(
                        "{} failed after writing partial output to {}",
                        self.tool,
                        target.display()
                    );
                }
                Err(self.failed(format!("{}: {}", self.tool, output.summary())))
            }
            RunOutcome::Finished(_) => {
                if !has_entries(target) {
                    return Err(self.failed(format!("{} produced no files", self.tool)));
                }
                tracing::info!("Unpacked {} into {}", self.fs_type, target.display());
                Ok(())
            }
        }
    }
}
