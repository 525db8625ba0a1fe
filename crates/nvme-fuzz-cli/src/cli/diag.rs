use std::{collections::BTreeMap, path::PathBuf, str::FromStr, sync::Arc};

use anyhow::Context;
use itertools::Itertools;
use nvme_fuzz::{
    config::{FuzzConfig, ProbeInterface},
    probe::{ProbeControl, ProbeSession},
    sampler::{PcSampler, SamplerSettings},
};

use super::{GlobalOptions, parse_u32_maybe_hex};

/// Connect to the probe, resolve the PC register, and take a burst of
/// samples to check that sampling yields plausible firmware addresses.
#[derive(Debug, clap::Parser)]
pub(super) struct DiagCommand {
    /// JSON configuration file for the probe parameters.
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(long)]
    device_name: Option<String>,

    /// Probe wire protocol: jtag or swd.
    #[clap(long)]
    interface: Option<String>,

    #[clap(long)]
    jtag_speed: Option<u32>,

    /// Number of diagnostic samples.
    #[clap(long, default_value_t = 200)]
    probes: u32,

    /// Dump this many 32-bit words from the firmware window start.
    #[clap(long, default_value_t = 0)]
    dump_words: usize,

    #[clap(long, value_parser = parse_u32_maybe_hex)]
    addr_range_start: Option<u32>,

    #[clap(long, value_parser = parse_u32_maybe_hex)]
    addr_range_end: Option<u32>,
}

impl DiagCommand {
    pub(super) fn run(self, _global_options: GlobalOptions) -> anyhow::Result<()> {
        let mut config = match &self.config {
            Some(path) => FuzzConfig::load(path)?,
            None => FuzzConfig::default(),
        };
        if let Some(device_name) = self.device_name {
            config.device_name = device_name;
        }
        if let Some(interface) = &self.interface {
            config.interface = ProbeInterface::from_str(interface)
                .map_err(anyhow::Error::msg)
                .context("Parsing --interface")?;
        }
        if let Some(jtag_speed) = self.jtag_speed {
            config.jtag_speed = jtag_speed;
        }
        if let Some(start) = self.addr_range_start {
            config.addr_range_start = start;
        }
        if let Some(end) = self.addr_range_end {
            config.addr_range_end = end;
        }

        let probe = Arc::new(ProbeSession::connect(&config).context("Connecting to debug probe")?);
        println!(
            "Connected: {} @ {} kHz, PC register ordinal {}",
            config.device_name,
            config.jtag_speed,
            probe.pc_register_index()
        );

        let mut histogram: BTreeMap<u32, u32> = BTreeMap::new();
        let mut failures = 0u32;
        for _ in 0..self.probes {
            match probe.sample_pc() {
                Ok(pc) => *histogram.entry(pc).or_insert(0) += 1,
                Err(_) => failures += 1,
            }
        }
        let successes = self.probes - failures;
        println!("{successes}/{} samples succeeded", self.probes);

        let in_range = histogram
            .iter()
            .filter(|&(&pc, _)| config.in_firmware_range(pc))
            .map(|(_, &hits)| hits)
            .sum::<u32>();
        println!(
            "{in_range} samples inside the firmware window {:#x}..={:#x}",
            config.addr_range_start, config.addr_range_end
        );

        println!("Top PCs:");
        for (&pc, &hits) in histogram
            .iter()
            .sorted_by_key(|&(&pc, &hits)| (std::cmp::Reverse(hits), pc))
            .take(10)
        {
            let share = if successes > 0 {
                f64::from(hits) / f64::from(successes) * 100.0
            } else {
                0.0
            };
            println!("  {pc:#010x}  {hits:>6}  {share:>5.1}%");
        }

        let mut sampler = PcSampler::new(Arc::clone(&probe), SamplerSettings::from_config(&config));
        match sampler.diagnose(50).context("Idle-PC diagnosis")? {
            Some(idle_pc) => println!("Idle PC: {idle_pc:#010x}"),
            None => println!("No dominant idle PC"),
        }

        if self.dump_words > 0 {
            let words = probe
                .read_memory32(config.addr_range_start, self.dump_words)
                .context("Reading firmware memory")?;
            println!("Memory at {:#010x}:", config.addr_range_start);
            for (offset, chunk) in words.chunks(4).enumerate() {
                let line = chunk.iter().map(|word| format!("{word:08x}")).join(" ");
                println!("  {:#010x}: {line}", config.addr_range_start + 16 * offset as u32);
            }
        }
        Ok(())
    }
}
