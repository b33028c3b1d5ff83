//! Recovering the Linux kernel version from an extracted tree.

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Dotted release token, optionally followed by a local version suffix.
const VERSION: &str = r"\d+\.\d+(?:\.\d+){0,2}(?:-[0-9A-Za-z][0-9A-Za-z._+~-]*)?";

static BANNER: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"Linux version ({})", VERSION)).expect("banner pattern"));
static RELEASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"\A\s*({})\s*\z", VERSION)).expect("release pattern"));
static ANY_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"Linux version ({v})|vermagic=({v})", v = VERSION))
        .expect("marker pattern")
});
static MODULES_DIR: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(&format!(r"\A{}\z", VERSION)).expect("modules dir pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Marker {
    /// `Linux version X` as printed by `/proc/version` and the boot banner.
    Banner,
    /// A file holding nothing but the release, like `/proc/sys/kernel/osrelease`.
    Release,
    /// The `lib/modules/<release>` directory name.
    ModulesDir,
    /// `vermagic=X` embedded in kernel modules.
    Vermagic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelVersion {
    pub version: String,
    /// Path relative to the scanned root.
    pub source: PathBuf,
    pub marker: Marker,
}

/// Well-known locations, checked in order before any full scan.
const CANDIDATES: &[(&str, Marker)] = &[
    ("proc/version", Marker::Banner),
    ("proc/sys/kernel/osrelease", Marker::Release),
    ("etc/banner", Marker::Banner),
    ("etc/issue", Marker::Banner),
    ("etc/motd", Marker::Banner),
    ("etc/version", Marker::Banner),
];

#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub max_file_bytes: u64,
    pub max_files: usize,
}

impl ScanLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_bytes: config.max_scan_file_bytes,
            max_files: config.max_kernel_scan_files,
        }
    }
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 8 * 1024 * 1024,
            max_files: 20_000,
        }
    }
}

/// Finds the kernel version under `root`; the first hit in priority order wins.
pub fn find_kernel_version(root: &Path, limits: ScanLimits) -> Option<KernelVersion> {
    let found = check_candidates(root, limits)
        .or_else(|| check_modules_dir(root))
        .or_else(|| scan_tree(root, limits));

    match &found {
        Some(kv) => tracing::info!(
            "Kernel version {} from {} ({:?})",
            kv.version,
            kv.source.display(),
            kv.marker
        ),
        None => tracing::info!("No kernel version marker under {}", root.display()),
    }
    found
}

fn check_candidates(root: &Path, limits: ScanLimits) -> Option<KernelVersion> {
    CANDIDATES.iter().find_map(|&(relative, marker)| {
        let path = root.join(relative);
        if !path.is_file() {
            return None;
        }
        let contents = read_bounded(&path, limits.max_file_bytes)?;
        let pattern: &Regex = match marker {
            Marker::Release => &*RELEASE,
            _ => &*BANNER,
        };
        let version = first_capture(pattern, &contents)?;
        Some(KernelVersion {
            version,
            source: PathBuf::from(relative),
            marker,
        })
    })
}

fn check_modules_dir(root: &Path) -> Option<KernelVersion> {
    let modules = root.join("lib/modules");
    let mut names: Vec<String> = fs::read_dir(&modules)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let name = names.into_iter().find(|name| MODULES_DIR.is_match(name))?;
    Some(KernelVersion {
        source: PathBuf::from("lib/modules").join(&name),
        version: name,
        marker: Marker::ModulesDir,
    })
}

fn scan_tree(root: &Path, limits: ScanLimits) -> Option<KernelVersion> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .take(limits.max_files)
        .find_map(|entry| {
            let contents = read_bounded(entry.path(), limits.max_file_bytes)?;
            let caps = ANY_MARKER.captures(&contents)?;
            let (group, marker) = match caps.get(1) {
                Some(m) => (m, Marker::Banner),
                None => (caps.get(2)?, Marker::Vermagic),
            };
            Some(KernelVersion {
                version: String::from_utf8_lossy(group.as_bytes()).into_owned(),
                source: entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_path_buf(),
                marker,
            })
        })
}

fn first_capture(pattern: &Regex, contents: &[u8]) -> Option<String> {
    let caps = pattern.captures(contents)?;
    Some(String::from_utf8_lossy(caps.get(1)?.as_bytes()).into_owned())
}

/// Reads at most `limit` bytes, inflating gzip members within the same bound.
fn read_bounded(path: &Path, limit: u64) -> Option<Vec<u8>> {
    let mut raw = Vec::new();
    File::open(path).ok()?.take(limit).read_to_end(&mut raw).ok()?;

    if raw.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::new();
        // Truncated or corrupt streams still yield what was decoded so far
        let _ = GzDecoder::new(raw.as_slice())
            .take(limit)
            .read_to_end(&mut inflated);
        if !inflated.is_empty() {
            return Some(inflated);
        }
    }
    Some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_stops_at_build_info() {
        let banner = b"Linux version 4.14.123 (builder@buildhost) (gcc version 7.3.0) #0 SMP";
        assert_eq!(first_capture(&BANNER, banner).as_deref(), Some("4.14.123"));
    }

    #[test]
    fn test_banner_keeps_local_version() {
        let banner = b"Linux version 3.10.14-rt5+ #1 PREEMPT";
        assert_eq!(first_capture(&BANNER, banner).as_deref(), Some("3.10.14-rt5+"));
    }

    #[test]
    fn test_release_file_must_be_bare() {
        assert_eq!(first_capture(&RELEASE, b"5.4.0\n").as_deref(), Some("5.4.0"));
        assert_eq!(first_capture(&RELEASE, b"firmware 5.4.0\n"), None);
    }

    #[test]
    fn test_modules_dir_names() {
        assert!(MODULES_DIR.is_match("2.6.36"));
        assert!(MODULES_DIR.is_match("4.9.198-openwrt"));
        assert!(!MODULES_DIR.is_match("extra"));
    }
}
