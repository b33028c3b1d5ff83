use anyhow::{Result, anyhow};
use std::path::Path;
use std::sync::Arc;

use crate::cli::FwScopeCli;
use crate::image::{Image, create_image};
use crate::report::AnalysisReport;

impl FwScopeCli {
    pub fn handle_identify_command(&mut self, file_path: &str) -> Result<()> {
        let image = self.open_image(file_path)?;
        let detection = image.detection();

        println!("File System Type looks like: {}", detection.fs_type);
        if !detection.is_unknown() {
            println!(
                "  signature: {} at offset {:#x} ({:?} confidence)",
                detection.signature.as_deref().unwrap_or("-"),
                detection.offset,
                detection.confidence
            );
        }
        for check in &detection.evidence {
            println!("  - {}", check);
        }
        Ok(())
    }

    pub async fn handle_extract_command(&mut self, file_path: &str) -> Result<()> {
        let image = self.open_extracted(file_path).await?;
        let mounted = image.is_mounted();
        let fs_type = image.fs_type();

        let image = Arc::try_unwrap(image)
            .map_err(|_| anyhow!("image session is still shared"))?;
        let dir = image
            .persist()
            .ok_or_else(|| anyhow!("extraction produced no working directory"))?;

        println!("Extracted Directory: {}", dir.display());
        if mounted {
            println!("Successfully mounted {} file system!", fs_type);
            println!("Run 'umount {}' when done.", dir.display());
        } else {
            println!("Successfully extracted {} file system!", fs_type);
        }
        Ok(())
    }

    pub async fn handle_tree_command(&mut self, file_path: &str) -> Result<()> {
        let image = self.open_extracted(file_path).await?;
        let listing = image.print_fs();
        image.unmount()?;

        println!("Here are the contents of the {} filesystem:", image.fs_type());
        print!("{}", listing?);
        Ok(())
    }

    pub async fn handle_kernel_command(&mut self, file_path: &str) -> Result<()> {
        let image = self.open_extracted(file_path).await?;
        let found = image.kernel_version_details();
        image.unmount()?;

        match found? {
            Some(kv) => {
                println!("Here is the kernel version of the filesystem: {}", kv.version);
                println!("  found in {} ({:?})", kv.source.display(), kv.marker);
            }
            None => println!("No kernel version string found"),
        }
        Ok(())
    }

    pub async fn handle_injections_command(&mut self, file_path: &str) -> Result<()> {
        let image = self.open_extracted(file_path).await?;
        let findings = image.get_command_injections();
        image.unmount()?;

        let findings = findings?;
        if findings.is_empty() {
            println!("No command injection candidates found");
            return Ok(());
        }
        println!("Here are the command injection possibilities found in the filesystem:");
        for finding in &findings {
            println!("{}", finding);
        }
        println!();
        println!("{} candidate(s)", findings.len());
        Ok(())
    }

    pub async fn handle_analyze_command(&mut self, file_path: &str, json: bool) -> Result<()> {
        let image = Arc::new(self.open_image(file_path)?);
        print_privilege_notice(&image);
        image.extract_in_background().await?;

        let report = AnalysisReport::collect(&image);
        image.unmount()?;
        let report = report?;

        if json {
            println!("{}", report.to_json()?);
        } else {
            print!("{}", report.render_text());
        }
        Ok(())
    }

    fn open_image(&self, file_path: &str) -> Result<Image> {
        // Allow `@path` the way shells paste file references
        let file_path = file_path.strip_prefix('@').unwrap_or(file_path);
        if !Path::new(file_path).exists() {
            return Err(anyhow!("File not found: {}", file_path));
        }
        Ok(create_image(file_path, self.engine_config()?)?)
    }

    async fn open_extracted(&self, file_path: &str) -> Result<Arc<Image>> {
        let image = Arc::new(self.open_image(file_path)?);
        print_privilege_notice(&image);
        image.extract_in_background().await?;
        Ok(image)
    }
}

fn print_privilege_notice(image: &Image) {
    if image.config().privilege_helper.is_some() {
        eprintln!("You may have to enter your password in the terminal.");
    }
}
