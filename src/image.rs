//! Per-image analysis sessions.
//!
//! An [`ImageSource`] is a firmware file that has not been classified yet.
//! Classifying it yields an [`Image`], which owns the working directory from
//! extraction until release and hands it to the read-only scanners.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{Config, RetentionPolicy};
use crate::detect::{self, DetectionResult, FsType};
use crate::error::{ImageError, Result};
use crate::extract::{self, LoopMount, Method, ToolBox, WorkingDir};
use crate::inject::{InjectionScanner, ScanFinding};
use crate::kernel::{self, KernelVersion, ScanLimits};
use crate::walk::{self, TreeEntry};

/// A firmware file bound to a path, before its type is known.
#[derive(Debug, Clone)]
pub struct ImageSource {
    path: PathBuf,
}

impl ImageSource {
    /// Resolves `path` to an absolute regular file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = fs::canonicalize(path.as_ref())?;
        if !fs::metadata(&path)?.is_file() {
            return Err(ImageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs signature detection once and fixes the filesystem type.
    pub fn classify(self, config: Config) -> Image {
        let detection = detect::detect(&self.path);
        if detection.is_unknown() {
            tracing::warn!(
                "{} was not recognized; extraction will be refused",
                self.path.display()
            );
        }

        Image {
            id: Uuid::new_v4(),
            tools: ToolBox::new(&config),
            path: self.path,
            detection,
            config,
            stage: RwLock::new(Stage::Typed),
        }
    }
}

/// Opens and classifies `path` in one step.
pub fn create_image(path: impl AsRef<Path>, config: Config) -> Result<Image> {
    Ok(ImageSource::open(path)?.classify(config))
}

/// Where an image is in its lifecycle, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageStatus {
    Typed,
    Mounted,
    Extracted,
    /// Unpacked files released but still on disk. A detached mount goes back to `Typed`.
    Released,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ImageStatus::Typed => "not extracted",
            ImageStatus::Mounted => "mounted",
            ImageStatus::Extracted => "extracted",
            ImageStatus::Released => "released",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
enum Stage {
    Typed,
    Mounted(WorkingDir),
    Extracted(WorkingDir),
    Released(WorkingDir),
}

impl Stage {
    fn working_dir(&self) -> Option<&WorkingDir> {
        match self {
            Stage::Typed => None,
            Stage::Mounted(dir) | Stage::Extracted(dir) | Stage::Released(dir) => Some(dir),
        }
    }

    fn status(&self) -> ImageStatus {
        match self {
            Stage::Typed => ImageStatus::Typed,
            Stage::Mounted(_) => ImageStatus::Mounted,
            Stage::Extracted(_) => ImageStatus::Extracted,
            Stage::Released(_) => ImageStatus::Released,
        }
    }
}

/// One analysis session over a classified firmware image.
///
/// Extraction and release take the session exclusively; the scanners share
/// it, so any number of scans may run against the same working directory
/// while no unmount can happen underneath them.
pub struct Image {
    id: Uuid,
    path: PathBuf,
    detection: DetectionResult,
    config: Config,
    tools: ToolBox,
    stage: RwLock<Stage>,
}

impl Image {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fs_type(&self) -> FsType {
        self.detection.fs_type
    }

    pub fn detection(&self) -> &DetectionResult {
        &self.detection
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> ImageStatus {
        self.read_stage().status()
    }

    /// True only while a live loop mount is attached.
    pub fn is_mounted(&self) -> bool {
        matches!(*self.read_stage(), Stage::Mounted(_))
    }

    pub fn working_directory(&self) -> Option<PathBuf> {
        self.read_stage()
            .working_dir()
            .map(|dir| dir.root().to_path_buf())
    }

    /// Mounts or unpacks the image and returns its working directory.
    ///
    /// Calling this on an image that is already mounted or extracted returns
    /// the existing directory without touching the source again. Concurrent
    /// callers are serialized. An image whose type was not recognized fails
    /// with [`ImageError::DetectionInconclusive`] before any tool runs.
    pub fn extract_fs(&self) -> Result<PathBuf> {
        let fs_type = self.fs_type();
        if fs_type == FsType::Unknown {
            return Err(ImageError::DetectionInconclusive(self.path.clone()));
        }

        let mut stage = self.write_stage();
        match &*stage {
            Stage::Mounted(dir) | Stage::Extracted(dir) => {
                tracing::debug!("{} already available at {}", fs_type, dir.root().display());
                return Ok(dir.root().to_path_buf());
            }
            Stage::Typed | Stage::Released(_) => {}
        }

        let strategy = extract::strategy_for(fs_type, self.config.extract_mode)?;
        let dir = WorkingDir::allocate(&self.config.work_root, &self.path, Uuid::new_v4())?;

        if let Err(e) = strategy.extract(&self.path, dir.root(), &self.tools) {
            match self.config.retention {
                RetentionPolicy::Retain => tracing::warn!(
                    "{} failed; partial output kept at {}",
                    strategy.name(),
                    dir.session().display()
                ),
                RetentionPolicy::Remove => {
                    if let Err(cleanup) = dir.remove() {
                        tracing::warn!("Could not remove {}: {}", dir.session().display(), cleanup);
                    }
                }
            }
            return Err(e);
        }

        let root = dir.root().to_path_buf();
        *stage = match strategy.method() {
            Method::Mount => Stage::Mounted(dir),
            Method::Unpack => Stage::Extracted(dir),
        };
        tracing::info!("{} is now {} at {}", self.path.display(), stage.status(), root.display());
        Ok(root)
    }

    /// Runs [`Image::extract_fs`] on the blocking pool of the current tokio runtime.
    pub fn spawn_extraction(self: &Arc<Self>) -> JoinHandle<Result<PathBuf>> {
        let image = Arc::clone(self);
        tokio::task::spawn_blocking(move || image.extract_fs())
    }

    pub async fn extract_in_background(self: &Arc<Self>) -> Result<PathBuf> {
        match self.spawn_extraction().await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(ImageError::Io(io::Error::other(format!(
                "extraction task did not complete: {}",
                e
            )))),
        }
    }

    /// Indented listing of the working directory.
    pub fn print_fs(&self) -> Result<String> {
        self.with_root(walk::list)
    }

    pub fn tree_entries(&self) -> Result<Vec<TreeEntry>> {
        self.with_root(|root| Ok(walk::entries(root).collect()))
    }

    /// The kernel version with the file it came from, or `None` when no marker exists.
    pub fn kernel_version_details(&self) -> Result<Option<KernelVersion>> {
        let limits = ScanLimits::from_config(&self.config);
        self.with_root(|root| Ok(kernel::find_kernel_version(root, limits)))
    }

    pub fn get_kernel_version(&self) -> Result<String> {
        self.with_root(|root| {
            kernel::find_kernel_version(root, ScanLimits::from_config(&self.config))
                .map(|found| found.version)
                .ok_or_else(|| ImageError::NotFound(root.to_path_buf()))
        })
    }

    pub fn injection_findings(&self) -> Result<Vec<ScanFinding>> {
        let scanner = InjectionScanner::from_config(&self.config);
        self.with_root(|root| Ok(scanner.scan(root)))
    }

    /// Findings rendered one per entry, in walk order.
    pub fn get_command_injections(&self) -> Result<Vec<String>> {
        Ok(self
            .injection_findings()?
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    /// Detaches a live mount and deletes its now empty mount point, or applies
    /// the retention policy to unpacked files.
    ///
    /// Safe to call in any state; an image that was never extracted is left alone.
    pub fn unmount(&self) -> Result<()> {
        let mut stage = self.write_stage();
        release_stage(&mut stage, self.fs_type(), &self.tools, self.config.retention)
    }

    /// Ends the session without releasing it, leaving the mount or files in place.
    pub fn persist(mut self) -> Option<PathBuf> {
        let stage = self.stage.get_mut().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(stage, Stage::Typed)
            .working_dir()
            .map(|dir| dir.root().to_path_buf())
    }

    /// Runs `scan` against the working directory under a shared lock.
    fn with_root<T>(&self, scan: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let stage = self.read_stage();
        let dir = stage.working_dir().ok_or(ImageError::NotMounted)?;
        scan(dir.root())
    }

    fn read_stage(&self) -> RwLockReadGuard<'_, Stage> {
        self.stage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_stage(&self) -> RwLockWriteGuard<'_, Stage> {
        self.stage.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("fs_type", &self.detection.fs_type)
            .field("stage", &*self.read_stage())
            .finish()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let stage = self.stage.get_mut().unwrap_or_else(PoisonError::into_inner);
        if matches!(stage, Stage::Typed) {
            return;
        }
        if let Err(e) = release_stage(stage, self.detection.fs_type, &self.tools, self.config.retention)
        {
            tracing::warn!("Failed to release {} on drop: {}", self.path.display(), e);
        }
    }
}

fn release_stage(
    stage: &mut Stage,
    fs_type: FsType,
    tools: &ToolBox,
    retention: RetentionPolicy,
) -> Result<()> {
    let dir = match std::mem::replace(stage, Stage::Typed) {
        Stage::Typed => return Ok(()),
        Stage::Mounted(dir) => {
            if let Err(e) = LoopMount::release(fs_type, dir.root(), tools) {
                *stage = Stage::Mounted(dir);
                return Err(e);
            }
            // The mount point is empty once detached; there is nothing to retain
            if let Err(e) = dir.remove() {
                tracing::warn!("Could not remove mount point {}: {}", dir.session().display(), e);
            }
            return Ok(());
        }
        Stage::Extracted(dir) | Stage::Released(dir) => dir,
    };

    match retention {
        RetentionPolicy::Retain => {
            tracing::info!("Working directory retained at {}", dir.root().display());
            *stage = Stage::Released(dir);
        }
        RetentionPolicy::Remove => {
            if let Err(e) = dir.remove() {
                *stage = Stage::Released(dir);
                return Err(e);
            }
        }
    }
    Ok(())
}
