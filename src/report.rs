use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::detect::DetectionResult;
use crate::error::Result;
use crate::image::{Image, ImageStatus};
use crate::inject::ScanFinding;
use crate::kernel::KernelVersion;

/// Everything learned about one image in a single pass.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub source: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub detection: DetectionResult,
    pub status: ImageStatus,
    pub working_directory: Option<PathBuf>,
    pub tree_entries: usize,
    pub kernel: Option<KernelVersion>,
    pub findings: Vec<ScanFinding>,
}

impl AnalysisReport {
    /// Extracts `image` if needed and runs every scanner over it.
    pub fn collect(image: &Image) -> Result<Self> {
        let (sha256, size) = sha256_file(image.path())?;
        let working_directory = image.extract_fs()?;

        let tree_entries = image.tree_entries()?.len();
        let kernel = image.kernel_version_details()?;
        let findings = image.injection_findings()?;

        Ok(Self {
            id: image.id(),
            generated_at: Utc::now(),
            source: image.path().to_path_buf(),
            sha256,
            size,
            detection: image.detection().clone(),
            status: image.status(),
            working_directory: Some(working_directory),
            tree_entries,
            kernel,
            findings,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Image:      {}", self.source.display());
        let _ = writeln!(out, "SHA-256:    {}", self.sha256);
        let _ = writeln!(out, "Size:       {} bytes", self.size);
        let _ = writeln!(
            out,
            "Filesystem: {} ({:?} confidence{})",
            self.detection.fs_type,
            self.detection.confidence,
            self.detection
                .signature
                .as_deref()
                .map(|s| format!(", {}", s))
                .unwrap_or_default()
        );
        if let Some(dir) = &self.working_directory {
            let _ = writeln!(out, "Contents:   {} ({}, {} entries)", dir.display(), self.status, self.tree_entries);
        }
        match &self.kernel {
            Some(kv) => {
                let _ = writeln!(out, "Kernel:     {} (from {})", kv.version, kv.source.display());
            }
            None => {
                let _ = writeln!(out, "Kernel:     not found");
            }
        }
        let _ = writeln!(out, "Findings:   {}", self.findings.len());
        for finding in &self.findings {
            let _ = writeln!(out, "{}", finding);
        }
        out
    }
}

/// Streams `path` through SHA-256, returning the hex digest and byte count.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}
