//! Turning a classified image into a browsable directory.
//!
//! Each filesystem type maps to one [`Extractable`] strategy: a read-only
//! loop mount for formats the kernel can mount, or a user-space unpacker that
//! writes ordinary files.

pub mod mount;
pub mod tool;
pub mod unpack;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::ExtractMode;
use crate::detect::FsType;
use crate::error::{ImageError, Result};

pub use mount::LoopMount;
pub use tool::ToolBox;
pub use unpack::Unpacker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Mount,
    Unpack,
}

/// A way of materializing one filesystem type on disk.
pub trait Extractable: Send + Sync {
    fn name(&self) -> &'static str;

    fn method(&self) -> Method;

    /// Populates `target` from `image`. `target` itself may not exist yet.
    fn extract(&self, image: &Path, target: &Path, tools: &ToolBox) -> Result<()>;
}

/// Picks the strategy for `fs_type` under the configured mode.
pub fn strategy_for(fs_type: FsType, mode: ExtractMode) -> Result<Box<dyn Extractable>> {
    if fs_type == FsType::Unknown {
        return Err(ImageError::UnsupportedType(fs_type));
    }

    let mount = fs_type.is_mountable().then(|| LoopMount::new(fs_type));
    let unpack = Unpacker::for_type(fs_type);

    let strategy: Option<Box<dyn Extractable>> = match mode {
        ExtractMode::Auto => match (mount, unpack) {
            (Some(m), _) => Some(Box::new(m)),
            (None, Some(u)) => Some(Box::new(u)),
            (None, None) => None,
        },
        ExtractMode::Mount => mount.map(|m| Box::new(m) as Box<dyn Extractable>),
        ExtractMode::Unpack => unpack.map(|u| Box::new(u) as Box<dyn Extractable>),
    };

    let strategy = strategy.ok_or(ImageError::UnsupportedType(fs_type))?;
    tracing::debug!("Using {} strategy for {} ({:?} mode)", strategy.name(), fs_type, mode);
    Ok(strategy)
}

/// Per-image session directory; `root` is the working directory handed to the scanners.
#[derive(Debug, Clone)]
pub struct WorkingDir {
    session: PathBuf,
    root: PathBuf,
}

impl WorkingDir {
    /// Creates `<work_root>/<stem>-<id>/`. The `root` child is left to the strategy.
    pub fn allocate(work_root: &Path, image: &Path, id: Uuid) -> Result<Self> {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().replace(char::is_whitespace, "_"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "image".to_string());
        let short_id = id.simple().to_string();
        let session = work_root.join(format!("{}-{}", stem, &short_id[..8]));

        fs::create_dir_all(&session)?;
        tracing::debug!("Allocated session directory {}", session.display());

        Ok(Self {
            root: session.join("root"),
            session,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session(&self) -> &Path {
        &self.session
    }

    /// Deletes the whole session directory; a directory that is already gone is fine.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.session) {
            Ok(()) => {
                tracing::info!("Removed working directory {}", self.session.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `dir` exists and has at least one entry.
pub(crate) fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
