//! Firmware image analysis: filesystem identification, extraction, and
//! read-only scanning of the extracted tree.

pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
pub mod extract;
pub mod image;
pub mod inject;
pub mod kernel;
pub mod report;
pub mod walk;

pub use config::{Config, ExtractMode, RetentionPolicy};
pub use detect::{Confidence, DetectionResult, FsType, detect};
pub use error::{ImageError, Result};
pub use image::{Image, ImageSource, ImageStatus, create_image};
pub use inject::{InjectionScanner, Location, ScanFinding, find_injections};
pub use kernel::{KernelVersion, Marker, find_kernel_version};
pub use report::AnalysisReport;
