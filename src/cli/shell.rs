use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::image::{Image, ImageStatus, create_image};

const PROMPT: &str = "fwscope> ";

/// State of one interactive session: the selected file and its image, if typed.
pub struct Session {
    config: Config,
    selected: Option<PathBuf>,
    image: Option<Arc<Image>>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            selected: None,
            image: None,
        }
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        self.image.as_ref()
    }

    /// Runs one command line, writing its output to `out`. Returns false on quit.
    pub async fn execute(&mut self, line: &str, out: &mut dyn Write) -> Result<bool> {
        let line = line.trim();
        let (command, argument) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "" => {}
            "open" => self.select(argument, out)?,
            "type" => self.identify(out)?,
            "extract" => self.extract(out).await?,
            "tree" => {
                if let Some(image) = self.ready(out)? {
                    match image.print_fs() {
                        Ok(listing) => write!(
                            out,
                            "Here are the contents of the {} filesystem:\n{}",
                            image.fs_type(),
                            listing
                        )?,
                        Err(e) => writeln!(out, "Failed to print filesystem: {}", e)?,
                    }
                }
            }
            "kernel" => {
                if let Some(image) = self.ready(out)? {
                    match image.get_kernel_version() {
                        Ok(version) => writeln!(
                            out,
                            "Here is the kernel version of the filesystem: {}",
                            version
                        )?,
                        Err(e) => writeln!(out, "Failed to find a kernel version: {}", e)?,
                    }
                }
            }
            "injections" => {
                if let Some(image) = self.ready(out)? {
                    match image.get_command_injections() {
                        Ok(findings) => {
                            writeln!(
                                out,
                                "Here are the command injection possibilities found in the filesystem:"
                            )?;
                            for finding in findings {
                                writeln!(out, "{}", finding)?;
                            }
                        }
                        Err(e) => writeln!(out, "Failed to find command injections: {}", e)?,
                    }
                }
            }
            "unmount" => match &self.image {
                Some(image) => match image.unmount() {
                    Ok(()) if image.status() == ImageStatus::Typed => {
                        writeln!(out, "Image unmounted; extract again to scan it")?
                    }
                    Ok(()) => writeln!(out, "Image released ({})", image.status())?,
                    Err(e) => writeln!(out, "Failed to unmount: {}", e)?,
                },
                None => writeln!(out, "No image is open")?,
            },
            "status" => self.status(out)?,
            "help" => print_help(out)?,
            "quit" | "exit" => return Ok(false),
            other => writeln!(out, "Unknown command '{}'; try 'help'", other)?,
        }
        Ok(true)
    }

    fn select(&mut self, argument: &str, out: &mut dyn Write) -> Result<()> {
        if argument.is_empty() {
            writeln!(out, "Usage: open <image>")?;
            return Ok(());
        }
        let path = PathBuf::from(argument);
        if !path.is_file() {
            writeln!(out, "No such file: {}", path.display())?;
            return Ok(());
        }
        writeln!(out, "Selected File: {}", path.display())?;
        self.selected = Some(path);
        Ok(())
    }

    /// Classifies the selected file, reusing the current image if the path is unchanged.
    fn identify(&mut self, out: &mut dyn Write) -> Result<()> {
        let Some(selected) = self.selected.clone() else {
            writeln!(out, "No file selected; use 'open <image>' first")?;
            return Ok(());
        };

        let reuse = match (&self.image, selected.canonicalize()) {
            (Some(image), Ok(path)) => image.path() == path,
            _ => false,
        };
        if !reuse {
            match create_image(&selected, self.config.clone()) {
                Ok(image) => self.image = Some(Arc::new(image)),
                Err(e) => {
                    writeln!(out, "Failed to identify filesystem type: {}", e)?;
                    return Ok(());
                }
            }
        }

        if let Some(image) = &self.image {
            writeln!(out, "File System Type looks like: {}", image.fs_type())?;
        }
        Ok(())
    }

    async fn extract(&mut self, out: &mut dyn Write) -> Result<()> {
        let Some(image) = self.image.clone() else {
            writeln!(out, "Identify the filesystem type first ('type')")?;
            return Ok(());
        };

        writeln!(out, "You may have to enter your password in the terminal.")?;
        out.flush()?;

        match image.extract_in_background().await {
            Ok(dir) => {
                writeln!(out, "Extracted Directory: {}", dir.display())?;
                let verb = if image.is_mounted() { "mounted" } else { "extracted" };
                writeln!(out, "Successfully {} {} file system!", verb, image.fs_type())?;
            }
            Err(e) => writeln!(out, "Failed to extract filesystem: {}", e)?,
        }
        Ok(())
    }

    /// The current image if its contents can be scanned, otherwise explains why not.
    fn ready(&self, out: &mut dyn Write) -> Result<Option<Arc<Image>>> {
        match &self.image {
            Some(image) if image.working_directory().is_some() => Ok(Some(Arc::clone(image))),
            _ => {
                writeln!(out, "Error: File system has not been mounted!")?;
                Ok(None)
            }
        }
    }

    fn status(&self, out: &mut dyn Write) -> Result<()> {
        match (&self.selected, &self.image) {
            (_, Some(image)) => {
                writeln!(out, "Image:   {}", image.path().display())?;
                writeln!(out, "Type:    {}", image.fs_type())?;
                writeln!(out, "Status:  {}", image.status())?;
                if let Some(dir) = image.working_directory() {
                    writeln!(out, "Workdir: {}", dir.display())?;
                }
            }
            (Some(path), None) => writeln!(out, "Selected File: {} (not identified)", path.display())?,
            (None, None) => writeln!(out, "No file selected")?,
        }
        Ok(())
    }
}

fn print_help(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "Commands:")?;
    writeln!(out, "  open <image>  select a firmware image")?;
    writeln!(out, "  type          identify its filesystem type")?;
    writeln!(out, "  extract       mount or unpack it")?;
    writeln!(out, "  tree          print the extracted directory tree")?;
    writeln!(out, "  kernel        print the kernel version")?;
    writeln!(out, "  injections    list command injection candidates")?;
    writeln!(out, "  unmount       release the mount or working directory")?;
    writeln!(out, "  status        show the current session")?;
    writeln!(out, "  quit          leave the shell")?;
    Ok(())
}

/// Reads commands from stdin until `quit` or end of input.
pub async fn run(config: Config) -> Result<()> {
    let mut session = Session::new(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    println!("fwscope interactive shell; 'help' lists commands");
    loop {
        print!("{}", PROMPT);
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if !session.execute(&line, &mut stdout).await? {
            break;
        }
    }

    if let Some(image) = session.image() {
        if let Err(e) = image.unmount() {
            tracing::warn!("Failed to release {}: {}", image.path().display(), e);
        }
    }
    Ok(())
}
