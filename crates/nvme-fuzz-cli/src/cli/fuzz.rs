use std::{
    path::PathBuf,
    str::FromStr,
    sync::{Arc, atomic::AtomicBool, atomic::Ordering},
};

use anyhow::Context;
use nvme_fuzz::{
    artifacts,
    config::{FuzzConfig, ProbeInterface},
    fuzzer::{FuzzSession, SessionEnd},
    nvme::NvmeCliTransport,
    probe::ProbeSession,
};
use tracing::{info, warn};

use super::{GlobalOptions, parse_u32_maybe_hex};

/// Fuzz an NVMe controller's firmware through its host command interface,
/// steering mutation with JTAG PC-sampling coverage.
#[derive(Debug, clap::Parser)]
pub(super) struct FuzzCommand {
    /// JSON configuration file. Flags below override its values.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Debug probe target name, e.g. Cortex-R8.
    #[clap(long)]
    device_name: Option<String>,

    /// Probe wire protocol: jtag or swd.
    #[clap(long)]
    interface: Option<String>,

    /// Probe clock in kHz.
    #[clap(long)]
    jtag_speed: Option<u32>,

    /// NVMe character device, e.g. /dev/nvme0.
    #[clap(long)]
    nvme_device: Option<PathBuf>,

    #[clap(long)]
    nvme_namespace: Option<u32>,

    /// Command templates to fuzz (default: the non-destructive set).
    #[clap(long)]
    commands: Vec<String>,

    /// Opt into every template, destructive ones included.
    #[clap(long)]
    all_commands: bool,

    /// Total runtime in seconds.
    #[clap(long)]
    runtime: Option<u64>,

    #[clap(long)]
    output_dir: Option<PathBuf>,

    #[clap(long)]
    seed_dir: Option<PathBuf>,

    /// Prior session's coverage.txt to resume from.
    #[clap(long)]
    resume_coverage: Option<PathBuf>,

    /// Maximum PC samples per command execution.
    #[clap(long)]
    samples: Option<u32>,

    /// Inter-sample interval in microseconds.
    #[clap(long)]
    interval: Option<u64>,

    /// Firmware code window start (hex or decimal).
    #[clap(long, value_parser = parse_u32_maybe_hex)]
    addr_range_start: Option<u32>,

    /// Firmware code window end (hex or decimal).
    #[clap(long, value_parser = parse_u32_maybe_hex)]
    addr_range_end: Option<u32>,

    /// Hard cap on corpus size after culling.
    #[clap(long)]
    max_corpus: Option<usize>,
}

impl FuzzCommand {
    pub(super) fn session_log_path(&self) -> PathBuf {
        let output_dir = self
            .output_dir
            .clone()
            .or_else(|| {
                let config = self.config.as_ref()?;
                Some(FuzzConfig::load(config).ok()?.output_dir)
            })
            .unwrap_or_else(|| FuzzConfig::default().output_dir);
        artifacts::session_log_path(&output_dir)
    }

    pub(super) fn run(self, global_options: GlobalOptions) -> anyhow::Result<()> {
        let config = self
            .resolve_config(&global_options)
            .context("Resolving configuration")?;
        config.validate().context("Validating configuration")?;

        let probe =
            Arc::new(ProbeSession::connect(&config).context("Connecting to debug probe")?);
        let transport = NvmeCliTransport::new(&config);

        let stop_flag = Arc::new(AtomicBool::new(false));
        {
            let stop_flag = Arc::clone(&stop_flag);
            ctrlc::set_handler(move || {
                stop_flag.store(true, Ordering::SeqCst);
            })
            .context("Installing Ctrl-C handler")?;
        }

        let mut session = FuzzSession::new(config, probe, transport, stop_flag)
            .context("Creating fuzz session")?;
        let summary = session.run().context("Running fuzz session")?;

        info!(
            executions = summary.executions,
            corpus = summary.corpus_len,
            edges = summary.confirmed_edges,
            pcs = summary.unique_pcs,
            crashes = summary.crashes,
            "fuzzing finished"
        );
        if summary.end == SessionEnd::TimeoutCrash {
            // Deliberately no reconnect and no device rescan: the failing
            // state is preserved for external inspection.
            warn!("device timed out and is left in its post-fault state");
        }
        Ok(())
    }

    fn resolve_config(self, global_options: &GlobalOptions) -> anyhow::Result<FuzzConfig> {
        let mut config = match &self.config {
            Some(path) => FuzzConfig::load(path)?,
            None => FuzzConfig::default(),
        };
        if let Some(device_name) = self.device_name {
            config.device_name = device_name;
        }
        if let Some(interface) = self.interface {
            config.interface = ProbeInterface::from_str(&interface)
                .map_err(anyhow::Error::msg)
                .context("Parsing --interface")?;
        }
        if let Some(jtag_speed) = self.jtag_speed {
            config.jtag_speed = jtag_speed;
        }
        if let Some(nvme_device) = self.nvme_device {
            config.nvme_device = nvme_device;
        }
        if let Some(nvme_namespace) = self.nvme_namespace {
            config.nvme_namespace = nvme_namespace;
        }
        if !self.commands.is_empty() {
            config.enabled_commands = self.commands;
        }
        if self.all_commands {
            config.all_commands = true;
        }
        if let Some(runtime) = self.runtime {
            config.total_runtime_sec = runtime;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if self.seed_dir.is_some() {
            config.seed_dir = self.seed_dir;
        }
        if self.resume_coverage.is_some() {
            config.resume_coverage = self.resume_coverage;
        }
        if let Some(samples) = self.samples {
            config.max_samples_per_run = samples;
        }
        if let Some(interval) = self.interval {
            config.sample_interval_us = interval;
        }
        if let Some(addr_range_start) = self.addr_range_start {
            config.addr_range_start = addr_range_start;
        }
        if let Some(addr_range_end) = self.addr_range_end {
            config.addr_range_end = addr_range_end;
        }
        if let Some(max_corpus) = self.max_corpus {
            config.max_corpus_hard_limit = max_corpus;
        }
        if config.random_seed.is_none() {
            config.random_seed = global_options.random_seed;
        }
        Ok(config)
    }
}
