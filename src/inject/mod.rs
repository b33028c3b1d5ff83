//! Heuristic command-injection triage over an extracted tree.
//!
//! Text files are matched line by line against a fixed rule set; ELF binaries
//! are checked for exec-style imports combined with embedded command
//! templates. Expect false positives.

mod rules;

pub use rules::command_templates;

use goblin::elf::Elf;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use rules::{EXEC_IMPORTS, EXEC_OF_VARIABLE, FORMAT_INTO, PREFILTER, TEXT_RULES};

const ELF_MAGIC: &[u8] = b"\x7fELF";
const TEXT_SAMPLE: usize = 1024;
const EXCERPT_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Location {
    /// 1-based line in a text file.
    Line(usize),
    /// Byte offset in a binary.
    Offset(u64),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Line(line) => write!(f, "{}", line),
            Location::Offset(offset) => write!(f, "0x{:x}", offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFinding {
    /// Relative to the scanned root.
    pub path: PathBuf,
    pub location: Location,
    pub rule: &'static str,
    pub rationale: String,
    pub excerpt: String,
}

impl fmt::Display for ScanFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: [{}] {}\n    {}",
            self.path.display(),
            self.location,
            self.rule,
            self.rationale,
            self.excerpt
        )
    }
}

pub struct InjectionScanner {
    max_file_bytes: u64,
}

impl InjectionScanner {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_scan_file_bytes)
    }

    /// Scans every regular file under `root`, in sorted walk order.
    pub fn scan(&self, root: &Path) -> Vec<ScanFinding> {
        let mut findings = Vec::new();
        let mut files_scanned = 0usize;

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let contents = match self.read(entry.path()) {
                Some(contents) => contents,
                None => continue,
            };
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            files_scanned += 1;

            if contents.starts_with(ELF_MAGIC) {
                findings.extend(scan_elf(relative, &contents));
            } else if is_text(&contents) {
                findings.extend(scan_text(relative, &String::from_utf8_lossy(&contents)));
            }
        }

        tracing::info!(
            "Injection scan of {} finished: {} files, {} findings",
            root.display(),
            files_scanned,
            findings.len()
        );
        findings
    }

    fn read(&self, path: &Path) -> Option<Vec<u8>> {
        let mut contents = Vec::new();
        let file = File::open(path)
            .map_err(|e| tracing::debug!("Cannot open {}: {}", path.display(), e))
            .ok()?;
        file.take(self.max_file_bytes)
            .read_to_end(&mut contents)
            .map_err(|e| tracing::debug!("Cannot read {}: {}", path.display(), e))
            .ok()?;
        Some(contents)
    }
}

/// Applies the text rules to `source`, reporting findings in line order.
pub fn scan_text(path: &Path, source: &str) -> Vec<ScanFinding> {
    let mut findings = Vec::new();
    // Buffers filled by a `%s` format, with the line that filled them
    let mut formatted: HashMap<String, usize> = HashMap::new();

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        if rules::is_comment(line) || !PREFILTER.is_match(line) {
            continue;
        }

        for rule in TEXT_RULES.iter() {
            if rule.pattern.is_match(line) {
                findings.push(finding(path, line_no, rule.name, rule.rationale.to_string(), line));
            }
        }

        if let Some(caps) = EXEC_OF_VARIABLE.captures(line) {
            if let Some(&filled_at) = formatted.get(&caps[1]) {
                findings.push(finding(
                    path,
                    line_no,
                    "format-then-exec",
                    format!(
                        "`{}` was filled from a %s format on line {} and is then executed",
                        &caps[1], filled_at
                    ),
                    line,
                ));
            }
        }
        if let Some(caps) = FORMAT_INTO.captures(line) {
            formatted.insert(caps[1].to_string(), line_no);
        }
    }
    findings
}

/// Reports command templates in an ELF that imports an exec-style function.
pub fn scan_elf(path: &Path, contents: &[u8]) -> Vec<ScanFinding> {
    let elf = match Elf::parse(contents) {
        Ok(elf) => elf,
        Err(e) => {
            tracing::debug!("Not a parseable ELF {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut imports: Vec<&str> = elf
        .dynsyms
        .iter()
        .filter(|sym| sym.is_import())
        .filter_map(|sym| elf.dynstrtab.get_at(sym.st_name))
        .filter(|name| EXEC_IMPORTS.contains(name))
        .collect();
    imports.sort_unstable();
    imports.dedup();
    if imports.is_empty() {
        return Vec::new();
    }

    let rationale = format!(
        "binary imports {} and embeds a shell command template with a %s placeholder",
        imports.join("/")
    );
    command_templates(contents)
        .into_iter()
        .map(|(offset, template)| ScanFinding {
            path: path.to_path_buf(),
            location: Location::Offset(offset),
            rule: "binary-command-template",
            rationale: rationale.clone(),
            excerpt: excerpt(&template),
        })
        .collect()
}

fn finding(
    path: &Path,
    line_no: usize,
    rule: &'static str,
    rationale: String,
    line: &str,
) -> ScanFinding {
    ScanFinding {
        path: path.to_path_buf(),
        location: Location::Line(line_no),
        rule,
        rationale,
        excerpt: excerpt(line),
    }
}

fn excerpt(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() <= EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Scripts, configs and other files worth reading line by line.
fn is_text(contents: &[u8]) -> bool {
    if contents.is_empty() {
        return false;
    }
    if contents.starts_with(b"#!") {
        return true;
    }
    if let Some(kind) = infer::get(contents) {
        return kind.matcher_type() == infer::MatcherType::Text;
    }

    let sample = &contents[..contents.len().min(TEXT_SAMPLE)];
    if let Some(text) = utf8_prefix(sample) {
        let total = text.chars().count();
        let printable = text
            .chars()
            .filter(|&c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
            .count();
        return total > 0 && printable * 100 / total > 90;
    }

    let printable = sample
        .iter()
        .filter(|&&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    printable * 100 / sample.len() > 90
}

/// `sample` as UTF-8, tolerating a character cut off by the sample boundary.
fn utf8_prefix(sample: &[u8]) -> Option<&str> {
    match std::str::from_utf8(sample) {
        Ok(text) => Some(text),
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&sample[..e.valid_up_to()]).ok(),
        Err(_) => None,
    }
}

/// Scans `root` with the limits from `config`.
pub fn find_injections(root: &Path, config: &Config) -> Vec<ScanFinding> {
    InjectionScanner::from_config(config).scan(root)
}
