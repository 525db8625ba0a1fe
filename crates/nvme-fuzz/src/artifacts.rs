use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::Local;
use serde::Serialize;
use tracing::info;

use crate::{corpus::Seed, crash::StuckPcReport, nvme::PassthruRequest};

/// Directory layout under `output_dir`.
#[derive(Debug)]
pub struct OutputLayout {
    root: PathBuf,
    corpus_dir: PathBuf,
    crashes_dir: PathBuf,
}

/// Stable payload hash used in artifact file names.
pub fn payload_hash(payload: &[u8]) -> String {
    let hash = ahash::RandomState::with_seeds(0x6e766d65, 0x66757a7a, 0x70632d73, 0x616d706c)
        .hash_one(payload);
    format!("{hash:016x}")[..12].to_owned()
}

/// `fuzzer_<timestamp>.log` path for a session starting now.
pub fn session_log_path(output_dir: &Path) -> PathBuf {
    output_dir.join(format!("fuzzer_{}.log", Local::now().format("%Y%m%d_%H%M%S")))
}

#[derive(Debug, Serialize)]
struct DwordMap {
    cdw2: u32,
    cdw3: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
}

impl DwordMap {
    fn from_array(values: [u32; 8]) -> Self {
        let [cdw2, cdw3, cdw10, cdw11, cdw12, cdw13, cdw14, cdw15] = values;
        Self {
            cdw2,
            cdw3,
            cdw10,
            cdw11,
            cdw12,
            cdw13,
            cdw14,
            cdw15,
        }
    }
}

#[derive(Debug, Serialize)]
struct OverrideMap {
    opcode: Option<String>,
    nsid: Option<u32>,
    force_admin: Option<bool>,
    data_len: Option<usize>,
}

#[derive(Debug, Serialize)]
struct InputMetadata {
    command: String,
    opcode: String,
    cmd_type: String,
    dwords: DwordMap,
    overrides: OverrideMap,
    payload_len: usize,
    found_at: u64,
    new_edges: usize,
    saved_at: String,
}

#[derive(Debug, Serialize)]
struct CrashMetadata<'a> {
    command: String,
    opcode: String,
    cmd_type: String,
    namespace: u32,
    data_len: usize,
    timeout_ms: u64,
    dwords: DwordMap,
    overrides: OverrideMap,
    stuck_pcs: &'a StuckPcReport,
    kernel_log_file: String,
    saved_at: String,
}

impl OutputLayout {
    pub fn create(root: &Path) -> io::Result<Self> {
        let corpus_dir = root.join("corpus");
        let crashes_dir = root.join("crashes");
        fs::create_dir_all(&corpus_dir)?;
        fs::create_dir_all(&crashes_dir)?;
        Ok(Self {
            root: root.to_owned(),
            corpus_dir,
            crashes_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists an interesting input as
    /// `corpus/input_<cmd>_<opcode>_<hash>` plus a `.json` sidecar.
    pub fn save_corpus_input(&self, seed: &Seed) -> io::Result<PathBuf> {
        let file_name = format!(
            "input_{}_{:#04x}_{}",
            seed.template.name,
            seed.template.opcode,
            payload_hash(&seed.payload)
        );
        let path = self.corpus_dir.join(&file_name);
        fs::write(&path, &seed.payload)?;

        let metadata = InputMetadata {
            command: seed.template.name.to_owned(),
            opcode: format!("{:#04x}", seed.template.opcode),
            cmd_type: seed.template.class.passthru_subcommand().to_owned(),
            dwords: DwordMap::from_array(seed.cdws.0),
            overrides: override_map(seed),
            payload_len: seed.payload.len(),
            found_at: seed.found_at,
            new_edges: seed.new_edges,
            saved_at: Local::now().to_rfc3339(),
        };
        write_json(&path.with_extension("json"), &metadata)?;
        Ok(path)
    }

    /// Persists a timeout crash: the payload, a structured metadata file
    /// and the kernel log snapshot.
    pub fn save_crash(
        &self,
        seed: &Seed,
        request: &PassthruRequest,
        stuck_pcs: &StuckPcReport,
        kernel_log: &str,
    ) -> io::Result<PathBuf> {
        let file_name = format!(
            "crash_{}_{:#04x}_{}",
            request.command,
            request.opcode,
            payload_hash(&seed.payload)
        );
        let path = self.crashes_dir.join(&file_name);
        fs::write(&path, &seed.payload)?;

        let dmesg_name = format!("{file_name}.dmesg.txt");
        fs::write(self.crashes_dir.join(&dmesg_name), kernel_log)?;

        let metadata = CrashMetadata {
            command: request.command.clone(),
            opcode: format!("{:#04x}", request.opcode),
            cmd_type: request.class.passthru_subcommand().to_owned(),
            namespace: request.namespace,
            data_len: request.data_len,
            timeout_ms: request.timeout_ms,
            dwords: DwordMap::from_array(request.cdws.0),
            overrides: override_map(seed),
            stuck_pcs,
            kernel_log_file: dmesg_name,
            saved_at: Local::now().to_rfc3339(),
        };
        write_json(&path.with_extension("json"), &metadata)?;
        info!(path = %path.display(), "crash artifact saved");
        Ok(path)
    }
}

fn override_map(seed: &Seed) -> OverrideMap {
    OverrideMap {
        opcode: seed.overrides.opcode.map(|opcode| format!("{opcode:#04x}")),
        nsid: seed.overrides.nsid,
        force_admin: seed.overrides.force_admin,
        data_len: seed.overrides.data_len,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(file, value).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        corpus::CommandDwords,
        crash::{StuckClassification, StuckPcEntry},
        nvme::{build_request, find_template},
    };

    fn sample_seed() -> Seed {
        let template = Arc::new(find_template("Identify").unwrap().clone());
        let mut seed = Seed::new(vec![1, 2, 3, 4], template, CommandDwords::default());
        seed.found_at = 42;
        seed.new_edges = 3;
        seed.overrides.nsid = Some(7);
        seed
    }

    #[test]
    fn corpus_input_round_trips_payload_and_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = OutputLayout::create(dir.path()).unwrap();
        let seed = sample_seed();
        let path = layout.save_corpus_input(&seed).unwrap();

        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("input_Identify_0x06_"));
        assert_eq!(fs::read(&path).unwrap(), vec![1, 2, 3, 4]);

        let metadata: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(metadata["command"], "Identify");
        assert_eq!(metadata["opcode"], "0x06");
        assert_eq!(metadata["found_at"], 42);
        assert_eq!(metadata["overrides"]["nsid"], 7);
    }

    #[test]
    fn crash_artifact_includes_stuck_pcs_and_kernel_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = OutputLayout::create(dir.path()).unwrap();
        let seed = sample_seed();
        let request = build_request(&seed, &crate::config::FuzzConfig::default());
        let report = StuckPcReport {
            samples: 20,
            failed_reads: 0,
            distribution: vec![StuckPcEntry {
                pc: "0xdeadbeef".to_owned(),
                hits: 20,
                ratio: 1.0,
            }],
            classification: StuckClassification::HangDeadlock,
        };
        let path = layout
            .save_crash(&seed, &request, &report, "[1.0] nvme nvme0: controller is down")
            .unwrap();

        let metadata: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(metadata["stuck_pcs"]["classification"], "hang/deadlock");
        assert_eq!(metadata["stuck_pcs"]["distribution"][0]["ratio"], 1.0);
        let dmesg: String = metadata["kernel_log_file"].as_str().unwrap().to_owned();
        let dmesg_content = fs::read_to_string(dir.path().join("crashes").join(dmesg)).unwrap();
        assert!(dmesg_content.contains("controller is down"));
    }

    #[test]
    fn payload_hash_is_stable_and_short() {
        let first = payload_hash(b"hello");
        let second = payload_hash(b"hello");
        assert_eq!(first, second);
        assert_eq!(first.len(), 12);
        assert_ne!(first, payload_hash(b"world"));
    }
}
