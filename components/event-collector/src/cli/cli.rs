// Local crates
use crate::{
    gateway::vijson::ViJsonGateway,
    helpers::{
        load_config::{Settings, SettingsOverrides},
        shutdown::Shutdown,
    },
    runtime::runtime::{self, Outcome},
    sink::sink::{SinkMode, validate_output_path},
};

// External crates
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "vmwarelog",
    long_about = "vmwarelog polls vCenter event history for a time window and appends the events, oldest first, to a local log file.",
    about = "vCenter event history collector",
    version,
    term_width = 100,
    after_help = "\
    EXAMPLES:
        vmwarelog run -t vcenter.lab.local -u administrator@vsphere.local
        vmwarelog watch --config /etc/vmwarelog.toml --interval-minutes 5
        vmwarelog validate --config ./vmwarelog.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect one window of events and exit
    Run(CommonArgs),

    /// Collect a window every interval until interrupted
    Watch {
        #[command(flatten)]
        common: CommonArgs,

        /// Minutes between two collection cycles
        #[arg(long)]
        interval_minutes: Option<u64>,
    },

    /// Validate the configuration and print the effective settings
    Validate(CommonArgs),

    /// Display version information
    Version,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Configuration file; missing files are ignored
    #[arg(short, long, default_value = "vmwarelog.toml")]
    config: PathBuf,

    /// vCenter host name or address
    #[arg(short = 't', long)]
    host: Option<String>,

    /// vCenter HTTPS port
    #[arg(short, long)]
    port: Option<u16>,

    /// User name to log in with; prompted for when unset
    #[arg(short, long)]
    username: Option<String>,

    /// Output file, appended to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output line format
    #[arg(short, long, value_enum)]
    mode: Option<SinkMode>,

    /// Length of the collected window, in minutes
    #[arg(short, long)]
    lookback_minutes: Option<i64>,

    /// Only collect this event type (repeatable)
    #[arg(short, long = "event-type", value_name = "TYPE")]
    event_types: Vec<String>,

    /// Add the built-in audit event types to the filter
    #[arg(long)]
    audit: bool,

    /// Accept invalid TLS certificates
    #[arg(long)]
    insecure: bool,

    /// Do not echo events to the console
    #[arg(short, long)]
    quiet: bool,
}

impl CommonArgs {
    fn overrides(&self, interval_minutes: Option<u64>) -> SettingsOverrides {
        SettingsOverrides {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            output: self.output.clone(),
            mode: self.mode,
            lookback_minutes: self.lookback_minutes,
            interval_minutes,
            event_types: self.event_types.clone(),
            audit: self.audit,
            insecure: self.insecure,
            quiet: self.quiet,
        }
    }
}

/// Parsed command together with the settings it runs with.
#[derive(Debug)]
pub enum Invocation {
    Run(Settings),
    Watch(Settings),
    Validate(PathBuf, Settings),
    Version,
}

/// Parse arguments and load settings. Runs before logging is set up, since
/// the settings decide where logs go.
pub fn parse() -> Result<Invocation> {
    let cli = Cli::parse();

    Ok(match cli.command {
        Commands::Run(common) => Invocation::Run(load(&common, None)?),
        Commands::Watch {
            common,
            interval_minutes,
        } => Invocation::Watch(load(&common, interval_minutes)?),
        Commands::Validate(common) => {
            let settings = load(&common, None)?;
            Invocation::Validate(common.config, settings)
        }
        Commands::Version => Invocation::Version,
    })
}

fn load(common: &CommonArgs, interval_minutes: Option<u64>) -> Result<Settings> {
    Settings::load(&common.config, &common.overrides(interval_minutes))
        .with_context(|| format!("Failed to load settings from {}", common.config.display()))
}

/// Execute a parsed invocation.
pub async fn run(invocation: Invocation) -> Result<Outcome> {
    match invocation {
        Invocation::Run(settings) => collect(settings, false).await,
        Invocation::Watch(settings) => collect(settings, true).await,
        Invocation::Validate(path, settings) => {
            validate_config(&path, &settings)?;
            Ok(Outcome::Completed)
        }
        Invocation::Version => {
            show_version();
            Ok(Outcome::Completed)
        }
    }
}

//
// ------------------------ Command Implementations ------------------------------
//

async fn collect(mut settings: Settings, watch: bool) -> Result<Outcome> {
    settings.validate()?;
    validate_output_path(&settings.sink.path)?;
    settings.prompt_missing_credentials()?;

    let gateway = ViJsonGateway::new(settings.connection_params()?, &settings.vcenter.api_release)
        .context("Failed to build the vCenter client")?;

    let shutdown = Shutdown::new();
    shutdown.listen_for_interrupt();

    let outcome = if watch {
        runtime::run_watch(&gateway, &settings, &shutdown).await?
    } else {
        runtime::run_once(&gateway, &settings, &shutdown).await?
    };

    shutdown.trigger();
    Ok(outcome)
}

/// Validate configuration file
fn validate_config(path: &Path, settings: &Settings) -> Result<()> {
    println!("Validating configuration file: {}", path.display());
    settings.validate()?;
    validate_output_path(&settings.sink.path)?;
    let rendered = settings
        .to_toml()
        .context("Failed to render effective settings")?;
    println!("Configuration valid:\n{rendered}");
    Ok(())
}

/// Show version information
fn show_version() {
    println!("vmwarelog {}", env!("CARGO_PKG_VERSION"));
}
