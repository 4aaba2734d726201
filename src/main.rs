//! CLI Entry Point for behavior-daq
//!
//! Provides command-line interface for:
//! - Running a behavioral session on the rig (mock card by default)
//! - Checking a configuration file without touching hardware
//!
//! # Usage
//!
//! Run a session:
//! ```bash
//! behavior-daq run --config config/default.toml --animal-id M042
//! ```
//!
//! Validate a configuration:
//! ```bash
//! behavior-daq check-config config/default.toml --print
//! ```

use anyhow::{Context, Result};
use behavior_daq::camera::MockCamera;
use behavior_daq::config::{ProtocolKind, RigConfig};
use behavior_daq::hardware::MockDaq;
use behavior_daq::storage::{DirectoryStorage, MemoryStorage, SessionStorage};
use behavior_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use behavior_daq::SessionBuilder;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "behavior-daq")]
#[command(about = "Acquisition synchronized with a behavioral protocol", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one behavioral session
    Run {
        /// Rig configuration file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Override the animal id
        #[arg(long)]
        animal_id: Option<String>,

        /// Override the data root directory
        #[arg(long)]
        data_root: Option<PathBuf>,

        /// Log output format (pretty, compact, json)
        #[arg(long, default_value = "compact")]
        log_format: String,

        /// Keep the session in memory instead of writing it to disk
        #[arg(long)]
        dry_run: bool,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Rig configuration file
        #[arg(default_value = "config/default.toml")]
        config: PathBuf,

        /// Print the effective configuration (defaults, file and environment merged)
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            animal_id,
            data_root,
            log_format,
            dry_run,
        } => run_session(config, animal_id, data_root, &log_format, dry_run).await,
        Commands::CheckConfig { config, print } => check_config(config, print),
    }
}

fn load_config(path: &Path) -> Result<RigConfig> {
    RigConfig::load_from(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn check_config(path: PathBuf, print: bool) -> Result<()> {
    let config = load_config(&path)?;
    config.validate().context("configuration is invalid")?;
    let protocol = behavior_daq::behavior::Protocol::from_config(&config.protocol)
        .context("protocol is invalid")?;

    println!("Configuration OK: {}", path.display());
    println!("  animal:        {}", config.session.animal_id);
    println!("  protocol:      {:?}", config.protocol.kind);
    println!(
        "  block:         {} samples @ {} Hz",
        config.hardware.buffer_size()?,
        config.hardware.sampling_rate_hz
    );
    println!("  camera sync:   {}", config.camera.enabled);
    if config.protocol.kind == ProtocolKind::LickTraining {
        println!(
            "  reward limit:  {} ({:.2} mL)",
            protocol.rewards_allowed(),
            config.rewards.intake_ml(protocol.rewards_allowed())
        );
    }

    if print {
        println!();
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

async fn run_session(
    path: PathBuf,
    animal_id: Option<String>,
    data_root: Option<PathBuf>,
    log_format: &str,
    dry_run: bool,
) -> Result<()> {
    let mut config = load_config(&path)?;
    if let Some(animal_id) = animal_id {
        config.session.animal_id = animal_id;
    }
    if let Some(data_root) = data_root {
        config.session.data_root = data_root;
    }
    config.validate()?;

    let format: OutputFormat = log_format.parse()?;
    tracing_setup::init(TracingConfig::from_rig_config(&config)?.with_format(format))?;

    let storage: Box<dyn SessionStorage> = if dry_run {
        Box::new(MemoryStorage::new())
    } else {
        Box::new(DirectoryStorage::create(
            &config.session.data_root,
            &config.session.animal_id,
        )?)
    };
    info!(location = %storage.location(), "Session storage ready");

    let driver = MockDaq::from_config(&config.hardware);
    let mut builder = SessionBuilder::new(config.clone(), driver, storage);
    if config.camera.enabled {
        builder = builder.with_camera(MockCamera::new("behavior_cam"));
    }
    let session = builder.build()?;

    let cancel = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping session");
            cancel.cancel();
        }
    });

    let mut progress = session.progress();
    tokio::spawn(async move {
        let mut last_phase = None;
        while progress.changed().await.is_ok() {
            let Some(update) = *progress.borrow_and_update() else {
                continue;
            };
            // one line per phase per 10 %
            let bucket = (update.percent / 10.0).floor() as i64;
            if last_phase != Some((update.phase, bucket)) {
                last_phase = Some((update.phase, bucket));
                info!(phase = %update.phase, percent = format_args!("{:.0}", update.percent), "Progress");
            }
        }
    });

    let report = tokio::task::spawn_blocking(move || session.run())
        .await
        .context("session task failed")??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
