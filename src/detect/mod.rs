//! Filesystem signature detection.
//!
//! Classification only looks at a bounded header window of the image, so
//! multi-gigabyte blobs are never loaded into memory.

mod signatures;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use signatures::SIGNATURES;

/// Bytes read from the start of an image for classification.
pub const HEADER_WINDOW: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsType {
    SquashFs,
    Jffs2,
    CramFs,
    Ubifs,
    Yaffs2,
    Ext,
    Unknown,
}

impl FsType {
    /// Whether the host kernel can loop-mount this format directly.
    pub fn is_mountable(&self) -> bool {
        matches!(self, FsType::SquashFs | FsType::CramFs | FsType::Ext)
    }

    /// Type name passed to `mount -t`.
    pub fn mount_type(&self) -> Option<&'static str> {
        match self {
            FsType::SquashFs => Some("squashfs"),
            FsType::CramFs => Some("cramfs"),
            FsType::Ext => Some("ext4"),
            _ => None,
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsType::SquashFs => "SquashFS",
            FsType::Jffs2 => "JFFS2",
            FsType::CramFs => "CramFS",
            FsType::Ubifs => "UBIFS",
            FsType::Yaffs2 => "YAFFS2",
            FsType::Ext => "ext",
            FsType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Outcome of one classification, with the structural checks that backed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub fs_type: FsType,
    pub confidence: Confidence,
    pub signature: Option<String>,
    pub offset: u64,
    pub evidence: Vec<String>,
}

impl DetectionResult {
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            fs_type: FsType::Unknown,
            confidence: Confidence::Low,
            signature: None,
            offset: 0,
            evidence: vec![reason.into()],
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.fs_type == FsType::Unknown
    }
}

/// Classifies the image at `path`. Unreadable or malformed input is `Unknown`.
pub fn detect(path: &Path) -> DetectionResult {
    let (header, file_len) = match read_header(path) {
        Ok(read) => read,
        Err(e) => {
            tracing::warn!("Could not read header of {}: {}", path.display(), e);
            return DetectionResult::unknown(format!("header read failed: {}", e));
        }
    };

    let result = detect_bytes(&header, file_len);
    match result.fs_type {
        FsType::Unknown => tracing::info!("No filesystem signature matched {}", path.display()),
        fs_type => tracing::info!(
            "Detected {} in {} ({:?} confidence, {})",
            fs_type,
            path.display(),
            result.confidence,
            result.signature.as_deref().unwrap_or("-")
        ),
    }
    result
}

/// Classifies a header window taken from a file of `file_len` bytes.
///
/// Signatures are tried in a fixed order and the first one whose structural
/// checks all pass wins.
pub fn detect_bytes(header: &[u8], file_len: u64) -> DetectionResult {
    for signature in SIGNATURES {
        if let Some(found) = (signature.probe)(header, file_len) {
            tracing::debug!(
                "Signature {} matched at offset {:#x}",
                signature.name,
                found.offset
            );
            return DetectionResult {
                fs_type: signature.fs_type,
                confidence: found.confidence,
                signature: Some(found.variant.unwrap_or(signature.name).to_string()),
                offset: found.offset,
                evidence: found.evidence,
            };
        }
    }
    DetectionResult::unknown("no signature matched")
}

fn read_header(path: &Path) -> std::io::Result<(Vec<u8>, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut header = Vec::with_capacity(HEADER_WINDOW.min(file_len) as usize);
    file.take(HEADER_WINDOW).read_to_end(&mut header)?;
    Ok((header, file_len))
}
