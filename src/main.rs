use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fpga_svc::{Config, FpgaManager, ImageFlags, LoopbackService};
use indicatif::{ProgressBar, ProgressStyle};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Bytes handed to each `write` call
const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4MB

#[derive(Parser)]
#[command(
    name = "fpga-svc",
    version,
    about = "Stream FPGA bitstreams through a secure service channel"
)]
struct Cli {
    /// Configuration file (default: ~/.config/fpga-svc/config.toml)
    #[arg(long, global = true, env = "FPGA_SVC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an image through the loopback service layer (dry run)
    Load {
        /// Bitstream file
        image: PathBuf,

        /// Partial reconfiguration
        #[arg(long, conflicts_with = "authenticate")]
        partial: bool,

        /// Ask the firmware to authenticate the bitstream
        #[arg(long)]
        authenticate: bool,

        /// Bytes per write call
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Print the effective configuration
    Config,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::resolve(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Load {
            image,
            partial,
            authenticate,
            chunk_size,
        } => {
            let mut flags = ImageFlags::empty();
            if partial {
                flags |= ImageFlags::PARTIAL_RECONFIG;
            }
            if authenticate {
                flags |= ImageFlags::BITSTREAM_AUTHENTICATE;
            }
            load(&config, &image, flags, chunk_size)
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load(config: &Config, path: &Path, flags: ImageFlags, chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        anyhow::bail!("--chunk-size must be non-zero");
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if file.metadata()?.len() == 0 {
        anyhow::bail!("{} is empty", path.display());
    }
    // SAFETY: the image is only read, and only for the duration of the load.
    let image = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to map {}", path.display()))?;

    let svc = Arc::new(
        LoopbackService::new(config.loopback.clone())
            .context("Failed to start loopback service layer")?,
    );
    let mut mgr = FpgaManager::attach(Arc::clone(&svc), config.engine.clone())
        .context("Failed to attach to service channel")?;

    let pb = ProgressBar::new(image.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )?
        .progress_chars("=> "),
    );

    let start = Instant::now();
    mgr.begin(image.len(), flags)
        .context("Reconfiguration request failed")?;
    for chunk in image.chunks(chunk_size) {
        mgr.write(chunk).context("Streaming bitstream failed")?;
        pb.inc(chunk.len() as u64);
    }
    let stats = mgr.finish().context("Reconfiguration did not complete")?;
    pb.finish_and_clear();

    let received = svc.image();
    if received[..] != image[..] {
        anyhow::bail!(
            "service layer received {} bytes that differ from the image",
            received.len()
        );
    }

    println!(
        "Loaded {} ({} bytes) in {:.2?}",
        path.display(),
        stats.bytes_sent,
        start.elapsed()
    );
    println!(
        "  submits: {}  claims: {}  status polls: {}  protocol violations: {}",
        stats.submits, stats.claims, stats.status_polls, stats.protocol_violations
    );

    if !mgr.detach() {
        tracing::warn!("not every service buffer could be released");
    }
    Ok(())
}
