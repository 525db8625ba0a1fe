mod diag;
mod fuzz;
mod list_commands;
mod replay;

use std::{fs, path::PathBuf};

use anyhow::Context;
use diag::DiagCommand;
use fuzz::FuzzCommand;
use list_commands::ListCommandsCommand;
use replay::ReplayCommand;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        let log_file = match &self.command {
            Command::Fuzz(cmd) => Some(cmd.session_log_path()),
            _ => None,
        };
        let _log_guard =
            setup_logger(&self.global_options, log_file).context("Setting up logger")?;
        match self.command {
            Command::Fuzz(cmd) => cmd.run(self.global_options),
            Command::Diag(cmd) => cmd.run(self.global_options),
            Command::ListCommands(cmd) => cmd.run(),
            Command::Replay(cmd) => cmd.run(self.global_options),
        }
    }
}

#[derive(Debug, clap::Parser)]
struct GlobalOptions {
    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,

    #[clap(long)]
    random_seed: Option<u64>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the coverage-guided fuzzing session.
    Fuzz(Box<FuzzCommand>),
    /// Probe connectivity and PC sampling diagnosis.
    Diag(DiagCommand),
    /// List the known NVMe command templates.
    ListCommands(ListCommandsCommand),
    /// Re-send one saved input with sampling enabled.
    Replay(ReplayCommand),
}

fn setup_logger(
    global_opts: &GlobalOptions,
    log_file: Option<PathBuf>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let stdout_layer =
        fmt::layer().with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned()));
    let filter = EnvFilter::builder()
        .with_default_directive(global_opts.default_log_level.into())
        .from_env()
        .context("Constructing log filter from env.")?;
    let registry = tracing_subscriber::registry().with(stdout_layer).with(filter);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Creating output directory")?;
            }
            let file = fs::File::create(&path)
                .with_context(|| format!("Creating run log {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

/// Accepts both `0x1000_0000`-style hex and plain decimal.
pub fn parse_u32_maybe_hex(s: &str) -> Result<u32, String> {
    let cleaned = s.replace('_', "");
    let parsed = if let Some(digits) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        u32::from_str_radix(digits, 16)
    } else {
        cleaned.parse()
    };
    parsed.map_err(|err| format!("invalid address {s}: {err}"))
}
