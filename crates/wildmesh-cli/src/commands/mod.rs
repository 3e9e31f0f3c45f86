use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

use wildmesh_config::{ConfigLoader, WarningSeverity, WildmeshConfig};
use wildmesh_core::MeshError;
use wildmesh_link::chunk::{MIN_CHUNK_SIZE, chunk_size_for_frame, frame_overhead};

mod simulate;

/// Wildmesh: control plane for wildlife camera nodes on a lossy radio mesh
#[derive(Parser)]
#[command(name = "wildmesh", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to wildmesh.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh of nodes on a simulated radio and report what happened
    Simulate(simulate::SimulateArgs),
    /// Show the resolved configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit the configuration for values that will misbehave on air
    Doctor,
    /// Show version and build info
    Version,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub async fn run(self) -> wildmesh_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level
                .as_deref()
                .unwrap_or(config.logging.level.as_str())
        };
        init_tracing(&config.logging.format, log_level);

        match self.command {
            Commands::Simulate(args) => simulate::cmd_simulate(config, args).await,
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Doctor => Self::cmd_doctor(config),
            Commands::Version => Self::cmd_version(),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    fn cmd_config(config: WildmeshConfig, json: bool) -> wildmesh_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| MeshError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_doctor(config: WildmeshConfig) -> wildmesh_core::Result<()> {
        println!("wildmesh doctor: configuration audit");
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Ok(());
            }
        };

        let mut warn_count = 0;
        let mut info_count = 0;
        for w in &warnings {
            println!("  {w}");
            match w.severity {
                WarningSeverity::Warning => warn_count += 1,
                WarningSeverity::Info => info_count += 1,
                WarningSeverity::Error => {}
            }
        }

        // Radio checks beyond schema validation
        let max_chunk = chunk_size_for_frame(config.simulation.max_frame_size);
        let chunk = config.link.chunk_size.map_or(max_chunk, |c| c.min(max_chunk));
        println!(
            "  link chunks carry {chunk} payload bytes ({} byte envelope)",
            frame_overhead()
        );
        if chunk < MIN_CHUNK_SIZE {
            println!("  [warning] link.chunk_size: {chunk} bytes per frame makes large payloads slow");
            warn_count += 1;
        }
        let image_chunks = 5_000usize.div_ceil(chunk);
        if image_chunks > config.link.max_payload_chunks {
            println!(
                "  [warning] link.max_payload_chunks: a 5000 byte image needs {image_chunks} chunks"
            );
            warn_count += 1;
        }
        if config.simulation.loss_rate > 0.5 {
            println!(
                "  [info] simulation.loss_rate: {:.0}% loss will keep most transmissions retrying",
                config.simulation.loss_rate * 100.0
            );
            info_count += 1;
        }

        match config.node.capability_set() {
            Ok(caps) => println!("  node {} advertises {}", config.node.id, caps),
            Err(e) => println!("  node {}: {e}", config.node.id),
        }

        println!();
        println!("  {warn_count} warnings, {info_count} suggestions");
        Ok(())
    }

    fn cmd_version() -> wildmesh_core::Result<()> {
        println!("wildmesh v{}", env!("CARGO_PKG_VERSION"));
        println!("   Rust edition: 2024");
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> wildmesh_core::Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "wildmesh", &mut std::io::stdout());
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
fn init_tracing(format: &str, level: &str) {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    match format {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init(),
    }
}
