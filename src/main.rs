//! stargzfs - mount stargz container image layers
//!
//! Usage:
//!   stargzfs init                          - Write a default configuration
//!   stargzfs mount <layer> <mount_point>   - Mount a layer read-only
//!   stargzfs inspect <layer>               - Print the effective tree
//!   stargzfs verify <layer>                - Read and verify every file
//!   stargzfs cache [--clear]               - Show or clear the cache

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stargzfs::{
    cache::{open_cache, ChunkFetcher},
    config::{CacheBackend, Config},
    crypto::DigestWriter,
    fs::{Layer, LayerFs, Node},
    remote::{BlobSource, FileBlob, RetryingBlob},
    tree::NodeKind,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const VERIFY_READ_SIZE: usize = 1 << 20;

#[derive(Parser)]
#[command(name = "stargzfs")]
#[command(author = "stargzfs Contributors")]
#[command(version)]
#[command(about = "Mount lazily-pulled stargz container image layers")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/stargzfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Mount a layer
    Mount {
        /// Path to the stargz blob
        layer: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Print the effective tree of a layer
    Inspect {
        /// Path to the stargz blob
        layer: PathBuf,
    },

    /// Read every regular file and check its digest
    Verify {
        /// Path to the stargz blob
        layer: PathBuf,
    },

    /// Show cache statistics
    Cache {
        /// Clear the cache
        #[arg(long)]
        clear: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { force } => cmd_init(config_path, force),
        Commands::Mount {
            layer,
            mount_point,
            allow_other,
        } => cmd_mount(config_path, &layer, &mount_point, allow_other),
        Commands::Inspect { layer } => cmd_inspect(config_path, &layer),
        Commands::Verify { layer } => cmd_verify(config_path, &layer),
        Commands::Cache { clear } => cmd_cache(config_path, clear),
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::load_or_default(config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))
}

fn open_layer(config: &Config, path: &Path) -> anyhow::Result<Layer> {
    let blob = FileBlob::open(path).with_context(|| format!("opening {}", path.display()))?;
    let source: Arc<dyn BlobSource> = Arc::new(RetryingBlob::new(blob, &config.fetch));

    let cache = open_cache(&config.cache).context("opening cache")?;
    // Files on disk can change underneath us; memory entries cannot
    let fetcher =
        ChunkFetcher::new(cache).verify_hits(config.cache.backend == CacheBackend::Disk);

    Layer::with_fetcher(source, fetcher, &config.layer)
        .with_context(|| format!("reading layer index of {}", path.display()))
}

fn cmd_init(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let config = Config::default();
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    layer_path: &Path,
    mount_point: &Path,
    allow_other: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    config.mount.mount_point = mount_point.to_path_buf();
    config.mount.allow_other |= allow_other;
    config.ensure_directories()?;

    let layer = open_layer(&config, layer_path)?;
    let fs = LayerFs::new(layer, &config.mount);

    std::fs::create_dir_all(mount_point)?;
    info!("Mounting {:?} at {:?}", layer_path, mount_point);

    let mut options = vec![
        fuser::MountOption::RO,
        fuser::MountOption::FSName(config.mount.fs_name.clone()),
        fuser::MountOption::Subtype("stargz".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
        // fusermount only honours auto_unmount together with allow_other
        options.push(fuser::MountOption::AutoUnmount);
    }

    fuser::mount2(fs, mount_point, &options).context("FUSE session failed")?;
    Ok(())
}

fn cmd_inspect(config_path: &Path, layer_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let layer = open_layer(&config, layer_path)?;

    print_node(&layer.root(), "/", 0);
    println!();
    println!("{} nodes", layer.tree().len());
    Ok(())
}

fn print_node(node: &Node, name: &str, depth: usize) {
    let indent = "  ".repeat(depth);
    let attr = node.attr();

    let detail = match node.kind() {
        NodeKind::Directory { opaque: true } => "dir (opaque)".to_string(),
        NodeKind::Directory { .. } => "dir".to_string(),
        NodeKind::Regular { digest, .. } => match digest {
            Some(d) => format!("file {} bytes {}", attr.size, d),
            None => format!("file {} bytes (no digest)", attr.size),
        },
        NodeKind::Symlink { target } => format!("symlink -> {}", target),
        NodeKind::CharDevice { major, minor } => format!("char {}:{}", major, minor),
        NodeKind::BlockDevice { major, minor } => format!("block {}:{}", major, minor),
        NodeKind::Fifo => "fifo".to_string(),
        NodeKind::Whiteout => "whiteout".to_string(),
    };
    println!("{}{}  [{:o}] {}", indent, name, attr.mode(), detail);

    for xattr in node.list_xattr() {
        println!("{}  @{}", indent, xattr);
    }

    if let Ok(entries) = node.open_dir() {
        for entry in entries {
            if let Some(child) = node.lookup(&entry.name) {
                print_node(&child, &entry.name, depth + 1);
            }
        }
    }
}

fn cmd_verify(config_path: &Path, layer_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let layer = open_layer(&config, layer_path)?;

    let mut checked = 0usize;
    let mut failed = 0usize;

    for tree_node in layer.tree().iter() {
        if !matches!(tree_node.kind, NodeKind::Regular { .. }) {
            continue;
        }
        let Some(node) = layer.node(tree_node.ino) else {
            continue;
        };

        match verify_file(&node) {
            Ok(()) => checked += 1,
            Err(e) => {
                warn!("{}: {:#}", tree_node.path, e);
                failed += 1;
            }
        }
    }

    let stats = layer.fetch_stats();
    println!("Verified: {}", checked);
    println!("Failed:   {}", failed);
    println!(
        "Fetches:  {} ({} cache hits, {} failures)",
        stats.fetches, stats.hits, stats.failures
    );

    if failed > 0 {
        bail!("{} file(s) failed verification", failed);
    }
    Ok(())
}

/// Read a file in slices, then check the whole-file digest as well
fn verify_file(node: &Node) -> anyhow::Result<()> {
    node.open()?;

    let size = node.attr().size;
    let mut hasher = DigestWriter::new();
    let mut offset = 0u64;
    while offset < size {
        let data = node.read(offset, VERIFY_READ_SIZE)?;
        if data.is_empty() {
            bail!("unexpected end of file at {} of {} bytes", offset, size);
        }
        hasher.update(&data);
        offset += data.len() as u64;
    }

    if let Some(expected) = node.digest() {
        let actual = hasher.finish();
        if &actual != expected {
            bail!("file digest mismatch: expected {}, got {}", expected, actual);
        }
    }
    Ok(())
}

fn cmd_cache(config_path: &Path, clear: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cache = open_cache(&config.cache)?;

    if clear {
        info!("Clearing cache...");
        cache.clear()?;
        info!("Cache cleared");
        return Ok(());
    }

    println!("Cache Statistics");
    println!("================");
    match config.cache.backend {
        CacheBackend::Memory => {
            println!("Backend: memory (process-local, empty between runs)");
            println!("Limit:   {} MB", config.cache.max_size / 1024 / 1024);
        }
        CacheBackend::Disk => {
            println!("Backend: disk at {:?}", config.cache.cache_dir);
            println!("Entries: {}", cache.len());
        }
    }
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
