use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use relaycopy::relay::{FixedManualUrl, PromptManualUrl};
use relaycopy::remote::{CommandStatusSource, FileStatusSource, HttpStatusSource, StatusSource};
use relaycopy::{Collaborators, FileTransfer, TransferConfig};

/// Move files to and from remote compute instances.
///
/// Uploads go through a public relay host the instance downloads from, and
/// fall back to scp. Downloads use scp.
#[derive(Parser, Debug)]
#[command(name = "relaycopy", version, about, long_about = None)]
struct Cli {
    /// Instance identifier as known to the provisioning API
    #[arg(long, short = 'i', env = "RELAYCOPY_INSTANCE", global = true)]
    instance: Option<String>,

    #[command(flatten)]
    status: StatusArgs,

    /// Attempts per transfer step
    #[arg(long, default_value_t = 3, global = true)]
    retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Read instance status from a JSON file
    #[arg(long, global = true, env = "RELAYCOPY_STATUS_FILE")]
    status_file: Option<PathBuf>,

    /// Fetch instance status from a URL
    #[arg(long, global = true, env = "RELAYCOPY_STATUS_URL", conflicts_with = "status_file")]
    status_url: Option<String>,

    /// Bearer token sent with --status-url
    #[arg(long, global = true, env = "RELAYCOPY_STATUS_TOKEN", hide_env_values = true)]
    status_token: Option<String>,

    /// Run a shell command whose stdout is the instance status
    #[arg(
        long,
        global = true,
        env = "RELAYCOPY_STATUS_CMD",
        conflicts_with_all = ["status_file", "status_url"]
    )]
    status_cmd: Option<String>,
}

impl StatusArgs {
    fn source(&self) -> Result<Box<dyn StatusSource>> {
        if let Some(path) = &self.status_file {
            return Ok(Box::new(FileStatusSource::new(path)));
        }
        if let Some(url) = &self.status_url {
            let source = HttpStatusSource::new(url, self.status_token.clone())
                .context("building status HTTP client")?;
            return Ok(Box::new(source));
        }
        if let Some(cmd) = &self.status_cmd {
            return Ok(Box::new(CommandStatusSource::new(cmd)));
        }
        anyhow::bail!("no instance status source: pass --status-file, --status-url or --status-cmd")
    }
}

#[derive(Args, Debug, Default)]
struct LargeFileArgs {
    /// Public URL the instance fetches from when a file is too large to relay
    #[arg(long, conflicts_with = "prompt_url")]
    manual_url: Option<String>,

    /// Ask for such a URL on the terminal instead
    #[arg(long)]
    prompt_url: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file to the instance
    Upload {
        local: PathBuf,
        remote: String,
        #[command(flatten)]
        large: LargeFileArgs,
    },
    /// Download a file from the instance
    Download { remote: String, local: PathBuf },
    /// Upload a directory tree to the instance
    UploadDir {
        local: PathBuf,
        remote: String,
        #[command(flatten)]
        large: LargeFileArgs,
    },
    /// Download a directory tree from the instance
    DownloadDir { remote: String, local: PathBuf },
    /// List files under a remote directory
    Ls { remote: String },
    /// Print the instance's SSH endpoint without connecting
    Resolve,
}

fn main() -> Result<()> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let instance = cli
        .instance
        .clone()
        .context("no instance given: pass --instance or set RELAYCOPY_INSTANCE")?;
    let config = TransferConfig::from_env();
    let mut parts = Collaborators::production(&config, cli.status.source()?)
        .context("setting up transfer collaborators")?;

    if let Command::Upload { large, .. } | Command::UploadDir { large, .. } = &cli.command {
        if let Some(url) = &large.manual_url {
            parts = parts.with_manual_url(Box::new(FixedManualUrl(url.clone())));
        } else if large.prompt_url {
            parts = parts.with_manual_url(Box::new(PromptManualUrl));
        }
    }

    let mut transfer = FileTransfer::new(instance.as_str(), config, parts);
    let retries = cli.retries;

    match cli.command {
        Command::Upload { local, remote, .. } => {
            transfer
                .upload_file(&local, &remote, retries)
                .with_context(|| format!("uploading {} to {instance}:{remote}", local.display()))?;
            done(format!("Uploaded {} to {instance}:{remote}", local.display()));
        }
        Command::Download { remote, local } => {
            transfer
                .download_file(&remote, &local, retries)
                .with_context(|| format!("downloading {instance}:{remote}"))?;
            done(format!("Downloaded {instance}:{remote} to {}", local.display()));
        }
        Command::UploadDir { local, remote, .. } => {
            transfer
                .upload_directory(&local, &remote, retries)
                .with_context(|| format!("uploading directory {}", local.display()))?;
            done(format!("Uploaded {} to {instance}:{remote}", local.display()));
        }
        Command::DownloadDir { remote, local } => {
            transfer
                .download_directory(&remote, &local, retries)
                .with_context(|| format!("downloading directory {instance}:{remote}"))?;
            done(format!("Downloaded {instance}:{remote} to {}", local.display()));
        }
        Command::Ls { remote } => {
            let files = transfer
                .list_remote_files(&remote)
                .with_context(|| format!("listing {instance}:{remote}"))?;
            for file in files {
                println!("{file}");
            }
        }
        Command::Resolve => {
            let endpoint = transfer
                .resolve_endpoint()
                .with_context(|| format!("resolving {instance}"))?;
            println!("{endpoint}");
        }
    }
    Ok(())
}

fn done(message: String) {
    println!("{} {message}", "✓".green().bold());
}
