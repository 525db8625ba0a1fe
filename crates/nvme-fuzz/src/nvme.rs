use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::{ConfigError, FuzzConfig},
    corpus::{CommandDwords, Seed},
};

/// Smallest and largest transfer the block-count and log-page length
/// calculations may produce.
const MIN_BLOCK_TRANSFER: usize = 512;
const MAX_TRANSFER: usize = 2 * 1024 * 1024;
const MIN_LOG_TRANSFER: usize = 4;

/// Grace added on top of the device-level timeout before the external CLI
/// process itself is considered hung.
const PROCESS_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Bounded second wait after killing a timed-out process. The kernel's
/// NVMe error recovery can hold it in uninterruptible sleep while the
/// controller resets.
const POST_KILL_WAIT: Duration = Duration::from_secs(5);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandClass {
    Admin,
    Io,
}

impl CommandClass {
    pub fn passthru_subcommand(self) -> &'static str {
        match self {
            Self::Admin => "admin-passthru",
            Self::Io => "io-passthru",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeoutGroup {
    Command,
    Format,
    Sanitize,
    FwCommit,
    Telemetry,
    Dsm,
    Flush,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandTemplate {
    pub name: &'static str,
    pub opcode: u8,
    pub class: CommandClass,
    pub needs_namespace: bool,
    pub needs_data: bool,
    pub timeout_group: TimeoutGroup,
    /// Destructive templates are only fuzzed under explicit opt-in.
    pub destructive: bool,
}

pub const TEMPLATES: [CommandTemplate; 13] = [
    CommandTemplate {
        name: "Identify",
        opcode: 0x06,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: false,
        timeout_group: TimeoutGroup::Command,
        destructive: false,
    },
    CommandTemplate {
        name: "GetLogPage",
        opcode: 0x02,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: false,
        timeout_group: TimeoutGroup::Command,
        destructive: false,
    },
    CommandTemplate {
        name: "GetFeatures",
        opcode: 0x0A,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: false,
        timeout_group: TimeoutGroup::Command,
        destructive: false,
    },
    CommandTemplate {
        name: "Read",
        opcode: 0x02,
        class: CommandClass::Io,
        needs_namespace: true,
        needs_data: false,
        timeout_group: TimeoutGroup::Command,
        destructive: false,
    },
    CommandTemplate {
        name: "Write",
        opcode: 0x01,
        class: CommandClass::Io,
        needs_namespace: true,
        needs_data: true,
        timeout_group: TimeoutGroup::Command,
        destructive: true,
    },
    CommandTemplate {
        name: "SetFeatures",
        opcode: 0x09,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: true,
        timeout_group: TimeoutGroup::Command,
        destructive: true,
    },
    CommandTemplate {
        name: "FWDownload",
        opcode: 0x11,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: true,
        timeout_group: TimeoutGroup::Command,
        destructive: true,
    },
    CommandTemplate {
        name: "FWCommit",
        opcode: 0x10,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: true,
        timeout_group: TimeoutGroup::FwCommit,
        destructive: true,
    },
    CommandTemplate {
        name: "FormatNVM",
        opcode: 0x80,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: true,
        timeout_group: TimeoutGroup::Format,
        destructive: true,
    },
    CommandTemplate {
        name: "Sanitize",
        opcode: 0x84,
        class: CommandClass::Admin,
        needs_namespace: false,
        needs_data: true,
        timeout_group: TimeoutGroup::Sanitize,
        destructive: true,
    },
    CommandTemplate {
        name: "TelemetryHostInitiated",
        opcode: 0x02,
        class: CommandClass::Admin,
        needs_namespace: true,
        needs_data: false,
        timeout_group: TimeoutGroup::Telemetry,
        destructive: false,
    },
    CommandTemplate {
        name: "Flush",
        opcode: 0x00,
        class: CommandClass::Io,
        needs_namespace: true,
        needs_data: false,
        timeout_group: TimeoutGroup::Flush,
        destructive: false,
    },
    CommandTemplate {
        name: "DatasetManagement",
        opcode: 0x09,
        class: CommandClass::Io,
        needs_namespace: true,
        needs_data: true,
        timeout_group: TimeoutGroup::Dsm,
        destructive: true,
    },
];

pub fn find_template(name: &str) -> Option<&'static CommandTemplate> {
    TEMPLATES.iter().find(|template| template.name == name)
}

/// Resolves the active template set: the explicit list if one is
/// configured, every template under `all_commands`, the non-destructive
/// defaults otherwise.
pub fn enabled_templates(config: &FuzzConfig) -> Result<Vec<Arc<CommandTemplate>>, ConfigError> {
    if !config.enabled_commands.is_empty() {
        return config
            .enabled_commands
            .iter()
            .map(|name| {
                find_template(name)
                    .map(|template| Arc::new(template.clone()))
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown command template: {name}")))
            })
            .collect();
    }
    let templates = TEMPLATES
        .iter()
        .filter(|template| config.all_commands || !template.destructive)
        .map(|template| Arc::new(template.clone()))
        .collect();
    Ok(templates)
}

/// Protocol-plausible dwords for a template's well-formed initial seed:
/// a command the firmware should accept, so calibration exercises the
/// ordinary handling path first.
pub fn protocol_sane_dwords(name: &str) -> CommandDwords {
    let mut cdws = CommandDwords::default();
    match name {
        // CNS 1: identify controller.
        "Identify" => cdws.set_cdw10(0x01),
        // Error log, 64 dwords.
        "GetLogPage" => cdws.set_cdw10((63 << 16) | 0x01),
        // FID 1: arbitration.
        "GetFeatures" | "SetFeatures" => cdws.set_cdw10(0x01),
        // SLBA 64, eight blocks.
        "Read" | "Write" => {
            cdws.set_cdw10(0x40);
            cdws.set_cdw12(7);
        }
        // 16 dwords from offset 0.
        "FWDownload" => cdws.set_cdw10(15),
        // Commit to slot 1.
        "FWCommit" => cdws.set_cdw10(0x01),
        // LBA format 0.
        "FormatNVM" => cdws.set_cdw10(0),
        // Block erase.
        "Sanitize" => cdws.set_cdw10(0x02),
        // Telemetry host-initiated log, 128 dwords.
        "TelemetryHostInitiated" => cdws.set_cdw10((127 << 16) | 0x07),
        // One range, attribute deallocate.
        "DatasetManagement" => cdws.set_cdw11(0x04),
        _ => {}
    }
    cdws
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataDirection {
    None,
    ToDevice,
    FromDevice,
}

/// A fully resolved passthru invocation. The builder is the single site
/// where seed overrides become effective values.
#[derive(Debug, Clone, Serialize)]
pub struct PassthruRequest {
    pub command: String,
    pub class: CommandClass,
    pub opcode: u8,
    pub namespace: u32,
    pub data_len: usize,
    pub direction: DataDirection,
    pub cdws: CommandDwords,
    pub timeout_ms: u64,
}

pub fn build_request(seed: &Seed, config: &FuzzConfig) -> PassthruRequest {
    let template = &seed.template;
    let overrides = &seed.overrides;

    let opcode = overrides.opcode.unwrap_or(template.opcode);
    let class = match overrides.force_admin {
        Some(true) => CommandClass::Admin,
        Some(false) => CommandClass::Io,
        None => template.class,
    };
    let namespace = overrides.nsid.unwrap_or(if template.needs_namespace {
        config.nvme_namespace
    } else {
        0
    });

    let data_len = if let Some(len) = overrides.data_len {
        len
    } else if template.needs_data {
        seed.payload.len()
    } else if class == CommandClass::Io && template.name == "Read" {
        let nlb = seed.cdws.cdw12() & 0xFFFF;
        ((nlb as usize + 1) * 512).clamp(MIN_BLOCK_TRANSFER, MAX_TRANSFER)
    } else if template.name == "GetLogPage" {
        let numdl = (seed.cdws.cdw10() >> 16) & 0xFFFF;
        ((numdl as usize + 1) * 4).clamp(MIN_LOG_TRANSFER, MAX_TRANSFER)
    } else {
        admin_response_len(template.name)
    };

    let direction = if data_len == 0 {
        DataDirection::None
    } else if template.needs_data {
        DataDirection::ToDevice
    } else {
        DataDirection::FromDevice
    };

    PassthruRequest {
        command: template.name.to_owned(),
        class,
        opcode,
        namespace,
        data_len,
        direction,
        cdws: seed.cdws,
        timeout_ms: config.nvme_timeouts.for_group(template.timeout_group),
    }
}

/// Fixed response sizes for Admin commands that return data without an
/// explicit length field.
fn admin_response_len(name: &str) -> usize {
    match name {
        "Identify" | "GetFeatures" => 4096,
        "TelemetryHostInitiated" => 512,
        _ => 0,
    }
}

/// Outcome of one dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Exit status of the external CLI: 0 success, positive a device-level
    /// error status.
    Exit(i32),
    /// The process-level timeout fired; the device likely stopped
    /// answering.
    Timeout,
    /// Launch or I/O failure on the host side.
    Error(String),
}

/// Seam between the orchestrator and the external CLI.
pub trait PassthruTransport {
    fn execute(&mut self, request: &PassthruRequest, payload: &[u8]) -> DispatchOutcome;
}

/// Dispatches requests through the `nvme` command-line tool.
#[derive(Debug)]
pub struct NvmeCliTransport {
    device: PathBuf,
    /// Write-path payload file, reused across runs.
    scratch_input: PathBuf,
}

impl NvmeCliTransport {
    pub fn new(config: &FuzzConfig) -> Self {
        Self {
            device: config.nvme_device.clone(),
            scratch_input: config.output_dir.join("scratch_input.bin"),
        }
    }

    fn write_scratch(&self, request: &PassthruRequest, payload: &[u8]) -> io::Result<()> {
        // nvme-cli reads exactly data_len bytes: truncate or zero-pad the
        // payload to match.
        let mut data = vec![0u8; request.data_len];
        let copied = payload.len().min(request.data_len);
        data[..copied].copy_from_slice(&payload[..copied]);
        fs::write(&self.scratch_input, data)
    }
}

/// The argument vector for one request, separated out so the assembly
/// rules are testable without a device.
pub fn cli_args(device: &Path, request: &PassthruRequest, scratch_input: &Path) -> Vec<String> {
    let [cdw2, cdw3, cdw10, cdw11, cdw12, cdw13, cdw14, cdw15] = request.cdws.0;
    let mut args = vec![
        request.class.passthru_subcommand().to_owned(),
        device.display().to_string(),
        format!("--opcode={:#04x}", request.opcode),
        format!("--namespace-id={}", request.namespace),
        format!("--timeout={}", request.timeout_ms),
        format!("--cdw2={cdw2}"),
        format!("--cdw3={cdw3}"),
        format!("--cdw10={cdw10}"),
        format!("--cdw11={cdw11}"),
        format!("--cdw12={cdw12}"),
        format!("--cdw13={cdw13}"),
        format!("--cdw14={cdw14}"),
        format!("--cdw15={cdw15}"),
    ];
    if request.data_len > 0 {
        args.push(format!("--data-len={}", request.data_len));
    }
    match request.direction {
        DataDirection::None => {}
        DataDirection::ToDevice => {
            args.push(format!("--input-file={}", scratch_input.display()));
            args.push("--write".to_owned());
        }
        DataDirection::FromDevice => args.push("--read".to_owned()),
    }
    args
}

impl PassthruTransport for NvmeCliTransport {
    fn execute(&mut self, request: &PassthruRequest, payload: &[u8]) -> DispatchOutcome {
        if request.direction == DataDirection::ToDevice {
            if let Err(err) = self.write_scratch(request, payload) {
                return DispatchOutcome::Error(format!("writing scratch input: {err}"));
            }
        }

        let mut command = Command::new("nvme");
        command
            .args(cli_args(&self.device, request, &self.scratch_input))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        debug!(command = ?command, "dispatching passthru");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return DispatchOutcome::Error(format!("spawning nvme CLI: {err}")),
        };

        let limit = Duration::from_secs(request.timeout_ms / 1000) + PROCESS_TIMEOUT_GRACE;
        match wait_with_deadline(&mut child, limit) {
            Ok(Some(status)) => classify_exit(status),
            Ok(None) => {
                let _ = child.kill();
                match wait_with_deadline(&mut child, POST_KILL_WAIT) {
                    Ok(Some(_)) => {}
                    Ok(None) => warn!(
                        command = %request.command,
                        "killed nvme CLI still not reaped; kernel error recovery in progress"
                    ),
                    Err(err) => warn!(%err, "waiting for killed nvme CLI"),
                }
                DispatchOutcome::Timeout
            }
            Err(err) => DispatchOutcome::Error(format!("waiting for nvme CLI: {err}")),
        }
    }
}

fn classify_exit(status: ExitStatus) -> DispatchOutcome {
    match status.code() {
        Some(code) => DispatchOutcome::Exit(code),
        None => DispatchOutcome::Error("nvme CLI terminated by signal".to_owned()),
    }
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::VecDeque, thread, time::Duration};

    use super::{DispatchOutcome, PassthruRequest, PassthruTransport};

    /// Returns scripted outcomes in order, then repeats the last one. Each
    /// execution takes a short simulated device latency so a concurrently
    /// running sampler observes the "command in flight" window.
    #[derive(Debug)]
    pub struct ScriptedTransport {
        outcomes: VecDeque<DispatchOutcome>,
        last: DispatchOutcome,
        latency: Duration,
        pub requests: Vec<PassthruRequest>,
    }

    impl ScriptedTransport {
        pub fn new(outcomes: Vec<DispatchOutcome>) -> Self {
            Self {
                outcomes: outcomes.into(),
                last: DispatchOutcome::Exit(0),
                latency: Duration::from_millis(10),
                requests: Vec::new(),
            }
        }

        pub fn always(outcome: DispatchOutcome) -> Self {
            Self::new(vec![outcome])
        }
    }

    impl PassthruTransport for ScriptedTransport {
        fn execute(&mut self, request: &PassthruRequest, _payload: &[u8]) -> DispatchOutcome {
            self.requests.push(request.clone());
            thread::sleep(self.latency);
            if let Some(outcome) = self.outcomes.pop_front() {
                self.last = outcome;
            }
            self.last.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{config::FuzzConfig, corpus::Seed};

    fn seed_for(name: &str) -> Seed {
        let template = Arc::new(find_template(name).unwrap().clone());
        Seed::new(vec![0xAA; 64], template, CommandDwords::default())
    }

    #[test]
    fn template_table_matches_wire_defaults() {
        assert_eq!(TEMPLATES.len(), 13);
        let identify = find_template("Identify").unwrap();
        assert_eq!(identify.opcode, 0x06);
        assert_eq!(identify.class, CommandClass::Admin);
        let read = find_template("Read").unwrap();
        assert_eq!(read.opcode, 0x02);
        assert_eq!(read.class, CommandClass::Io);
        let sanitize = find_template("Sanitize").unwrap();
        assert!(!sanitize.needs_namespace);
        assert_eq!(sanitize.timeout_group, TimeoutGroup::Sanitize);
    }

    #[test]
    fn default_template_set_is_non_destructive() {
        let config = FuzzConfig::default();
        let templates = enabled_templates(&config).unwrap();
        assert!(templates.iter().all(|template| !template.destructive));
        assert!(templates.iter().any(|template| template.name == "Identify"));
        assert!(templates.iter().all(|template| template.name != "FormatNVM"));
    }

    #[test]
    fn all_commands_opts_into_destructive_templates() {
        let config = FuzzConfig {
            all_commands: true,
            ..FuzzConfig::default()
        };
        let templates = enabled_templates(&config).unwrap();
        assert_eq!(templates.len(), TEMPLATES.len());
    }

    #[test]
    fn unknown_enabled_command_is_rejected() {
        let config = FuzzConfig {
            enabled_commands: vec!["NoSuchCommand".to_owned()],
            ..FuzzConfig::default()
        };
        assert!(enabled_templates(&config).is_err());
    }

    #[test]
    fn sane_dwords_carry_protocol_plausible_values() {
        assert_eq!(protocol_sane_dwords("Identify").cdw10(), 0x01);
        let log_page = protocol_sane_dwords("GetLogPage");
        assert_eq!(log_page.cdw10() & 0xFF, 0x01);
        assert_ne!(log_page.cdw10() >> 16, 0);
        // IO block commands address a real range, not LBA 0 with zero
        // blocks.
        let read = protocol_sane_dwords("Read");
        assert_ne!(read.cdw10(), 0);
        assert_ne!(read.cdw12() & 0xFFFF, 0);
        assert_eq!(read.0, protocol_sane_dwords("Write").0);
    }

    #[test]
    fn overrides_take_precedence() {
        let config = FuzzConfig::default();
        let mut seed = seed_for("Identify");
        seed.overrides.opcode = Some(0xC7);
        seed.overrides.nsid = Some(0xFFFF_FFFF);
        seed.overrides.force_admin = Some(false);
        seed.overrides.data_len = Some(8192);
        let request = build_request(&seed, &config);
        assert_eq!(request.opcode, 0xC7);
        assert_eq!(request.namespace, 0xFFFF_FFFF);
        assert_eq!(request.class, CommandClass::Io);
        assert_eq!(request.data_len, 8192);
    }

    #[test]
    fn data_commands_take_payload_length() {
        let config = FuzzConfig {
            all_commands: true,
            ..FuzzConfig::default()
        };
        let seed = seed_for("Write");
        let request = build_request(&seed, &config);
        assert_eq!(request.data_len, 64);
        assert_eq!(request.direction, DataDirection::ToDevice);
        assert_eq!(request.namespace, config.nvme_namespace);
    }

    #[test]
    fn read_length_follows_block_count() {
        let config = FuzzConfig::default();
        let mut seed = seed_for("Read");
        seed.cdws.set_cdw12(7); // NLB 7 -> 8 blocks
        let request = build_request(&seed, &config);
        assert_eq!(request.data_len, 8 * 512);
        assert_eq!(request.direction, DataDirection::FromDevice);

        seed.cdws.set_cdw12(0xFFFF);
        let request = build_request(&seed, &config);
        assert_eq!(request.data_len, MAX_TRANSFER);
    }

    #[test]
    fn get_log_page_length_follows_numdl() {
        let config = FuzzConfig::default();
        let mut seed = seed_for("GetLogPage");
        seed.cdws.set_cdw10(0x000F_0002); // NUMDL 15, LID 2
        let request = build_request(&seed, &config);
        assert_eq!(request.data_len, 16 * 4);
    }

    #[test]
    fn admin_response_sizes_are_fixed() {
        let config = FuzzConfig::default();
        let request = build_request(&seed_for("Identify"), &config);
        assert_eq!(request.data_len, 4096);
        assert_eq!(request.direction, DataDirection::FromDevice);

        let request = build_request(&seed_for("Flush"), &config);
        assert_eq!(request.data_len, 0);
        assert_eq!(request.direction, DataDirection::None);
    }

    #[test]
    fn timeout_groups_resolve_configured_values() {
        let config = FuzzConfig {
            all_commands: true,
            ..FuzzConfig::default()
        };
        assert_eq!(build_request(&seed_for("Identify"), &config).timeout_ms, 8_000);
        assert_eq!(build_request(&seed_for("FormatNVM"), &config).timeout_ms, 600_000);
        assert_eq!(build_request(&seed_for("FWCommit"), &config).timeout_ms, 120_000);
        assert_eq!(
            build_request(&seed_for("DatasetManagement"), &config).timeout_ms,
            30_000
        );
    }

    #[test]
    fn cli_args_carry_all_dwords_and_direction() {
        let config = FuzzConfig {
            all_commands: true,
            ..FuzzConfig::default()
        };
        let mut seed = seed_for("Write");
        seed.cdws.set_cdw10(0x1234);
        let request = build_request(&seed, &config);
        let args = cli_args(Path::new("/dev/nvme0"), &request, Path::new("/tmp/scratch"));
        assert_eq!(args[0], "io-passthru");
        assert_eq!(args[1], "/dev/nvme0");
        assert!(args.contains(&"--opcode=0x01".to_owned()));
        assert!(args.contains(&format!("--cdw10={}", 0x1234)));
        assert!(args.contains(&"--data-len=64".to_owned()));
        assert!(args.contains(&"--input-file=/tmp/scratch".to_owned()));
        assert!(args.contains(&"--write".to_owned()));

        let request = build_request(&seed_for("Identify"), &config);
        let args = cli_args(Path::new("/dev/nvme0"), &request, Path::new("/tmp/scratch"));
        assert_eq!(args[0], "admin-passthru");
        assert!(args.contains(&"--read".to_owned()));
    }
}
