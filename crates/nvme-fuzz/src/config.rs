use std::{
    fs,
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nvme::TimeoutGroup;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Wire protocol used to talk to the debug probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeInterface {
    Jtag,
    Swd,
}

impl FromStr for ProbeInterface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jtag" => Ok(Self::Jtag),
            "swd" => Ok(Self::Swd),
            other => Err(format!("unknown probe interface: {other}")),
        }
    }
}

/// Worst-case command execution time per command family, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeoutTable {
    pub command: u64,
    pub format: u64,
    pub sanitize: u64,
    pub fw_commit: u64,
    pub telemetry: u64,
    pub dsm: u64,
    pub flush: u64,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            command: 8_000,
            format: 600_000,
            sanitize: 600_000,
            fw_commit: 120_000,
            telemetry: 30_000,
            dsm: 30_000,
            flush: 30_000,
        }
    }
}

impl TimeoutTable {
    pub fn for_group(&self, group: TimeoutGroup) -> u64 {
        match group {
            TimeoutGroup::Command => self.command,
            TimeoutGroup::Format => self.format,
            TimeoutGroup::Sanitize => self.sanitize,
            TimeoutGroup::FwCommit => self.fw_commit,
            TimeoutGroup::Telemetry => self.telemetry,
            TimeoutGroup::Dsm => self.dsm,
            TimeoutGroup::Flush => self.flush,
        }
    }
}

/// The full set of recognized fuzzer options. Unknown keys in a config
/// file are rejected rather than silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FuzzConfig {
    // Probe connection
    pub device_name: String,
    pub interface: ProbeInterface,
    /// JTAG/SWD clock in kHz.
    pub jtag_speed: u32,

    // Target
    pub nvme_device: PathBuf,
    pub nvme_namespace: u32,
    pub nvme_timeouts: TimeoutTable,
    /// Template names to fuzz. Empty means the non-destructive default set.
    pub enabled_commands: Vec<String>,
    /// Opt into every known template, destructive ones included.
    pub all_commands: bool,

    // Sampling
    pub sample_interval_us: u64,
    pub max_samples_per_run: u32,
    /// Consecutive idle-PC samples before early stop. 0 disables.
    pub saturation_limit: u32,
    /// Consecutive samples without a globally new edge before early stop.
    /// 0 disables.
    pub global_saturation_limit: u32,
    /// Keep sampling this long after a command returns successfully.
    pub post_cmd_delay_ms: u64,
    pub addr_range_start: u32,
    pub addr_range_end: u32,

    // Fuzzing
    pub max_input_len: usize,
    pub total_runtime_sec: u64,
    pub seed_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Path to a prior session's `coverage.txt`; the edge and edge-count
    /// files are loaded from the same directory.
    pub resume_coverage: Option<PathBuf>,
    pub max_energy: u64,
    /// Probability of skipping the corpus for a fully random input.
    pub random_gen_ratio: f64,
    pub excluded_opcodes: Vec<u8>,
    pub opcode_mut_prob: f64,
    pub nsid_mut_prob: f64,
    pub admin_swap_prob: f64,
    pub datalen_mut_prob: f64,
    pub calibration_runs: u32,
    pub deterministic_enabled: bool,
    pub deterministic_arith_max: u32,
    pub mopt_enabled: bool,
    pub mopt_pilot_period: u64,
    pub mopt_core_period: u64,
    pub edge_confirm_threshold: u32,
    /// Hard cap on corpus size after culling. 0 disables.
    pub max_corpus_hard_limit: usize,
    pub random_seed: Option<u64>,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            device_name: "Cortex-R8".to_owned(),
            interface: ProbeInterface::Jtag,
            jtag_speed: 4000,
            nvme_device: PathBuf::from("/dev/nvme0"),
            nvme_namespace: 1,
            nvme_timeouts: TimeoutTable::default(),
            enabled_commands: Vec::new(),
            all_commands: false,
            sample_interval_us: 100,
            max_samples_per_run: 500,
            saturation_limit: 10,
            global_saturation_limit: 20,
            post_cmd_delay_ms: 50,
            addr_range_start: 0,
            addr_range_end: u32::MAX,
            max_input_len: 4096,
            total_runtime_sec: 3600,
            seed_dir: None,
            output_dir: PathBuf::from("./output/pc_sampling"),
            resume_coverage: None,
            max_energy: 64,
            random_gen_ratio: 0.2,
            excluded_opcodes: Vec::new(),
            opcode_mut_prob: 0.10,
            nsid_mut_prob: 0.10,
            admin_swap_prob: 0.05,
            datalen_mut_prob: 0.08,
            calibration_runs: 3,
            deterministic_enabled: true,
            deterministic_arith_max: 10,
            mopt_enabled: true,
            mopt_pilot_period: 1000,
            mopt_core_period: 2000,
            edge_confirm_threshold: 2,
            max_corpus_hard_limit: 0,
            random_seed: None,
        }
    }
}

impl FuzzConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        Ok(config)
    }

    /// Checks for the misconfigurations that must abort the run before
    /// any hardware is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr_range_start > self.addr_range_end {
            return Err(ConfigError::Invalid(format!(
                "addr_range_start {:#x} is above addr_range_end {:#x}",
                self.addr_range_start, self.addr_range_end
            )));
        }
        for (name, p) in [
            ("random_gen_ratio", self.random_gen_ratio),
            ("opcode_mut_prob", self.opcode_mut_prob),
            ("nsid_mut_prob", self.nsid_mut_prob),
            ("admin_swap_prob", self.admin_swap_prob),
            ("datalen_mut_prob", self.datalen_mut_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {p}")));
            }
        }
        if self.max_input_len == 0 {
            return Err(ConfigError::Invalid("max_input_len must be non-zero".into()));
        }
        if self.edge_confirm_threshold == 0 {
            return Err(ConfigError::Invalid(
                "edge_confirm_threshold must be at least 1".into(),
            ));
        }
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.nvme_device)
            .map_err(|err| {
                ConfigError::Invalid(format!(
                    "cannot open {} read-write: {err}",
                    self.nvme_device.display()
                ))
            })?;
        Ok(())
    }

    pub fn in_firmware_range(&self, pc: u32) -> bool {
        (self.addr_range_start..=self.addr_range_end).contains(&pc)
    }
}
