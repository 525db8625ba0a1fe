use std::{process::Command, thread, time::Duration};

use ahash::AHashMap;
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, warn};

use crate::probe::ProbeControl;

/// How many stuck-PC reads are taken after a timeout.
pub const STUCK_PC_READS: usize = 20;

/// Kernel log lines kept in a crash artifact.
const KERNEL_LOG_LINES: usize = 100;

const STUCK_READ_SPACING: Duration = Duration::from_millis(5);

/// Shape of the PC distribution read from a hung target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StuckClassification {
    /// A single repeated PC.
    #[serde(rename = "hang/deadlock")]
    HangDeadlock,
    /// Two or three distinct PCs.
    #[serde(rename = "error loop")]
    ErrorLoop,
    /// More distinct PCs: the firmware is walking a recovery path.
    #[serde(rename = "walking recovery path")]
    RecoveryWalk,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckPcEntry {
    pub pc: String,
    pub hits: usize,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckPcReport {
    pub samples: usize,
    pub failed_reads: usize,
    /// Top five PCs by frequency.
    pub distribution: Vec<StuckPcEntry>,
    pub classification: StuckClassification,
}

/// Reads a burst of PCs from the timed-out target. Each read is the same
/// halt-read-resume unit the sampler uses, so the firmware is disturbed no
/// further than a register read requires.
pub fn read_stuck_pcs(probe: &impl ProbeControl, reads: usize) -> StuckPcReport {
    let mut histogram: AHashMap<u32, usize> = AHashMap::new();
    let mut samples = 0usize;
    let mut failed_reads = 0usize;
    for _ in 0..reads {
        match probe.sample_pc() {
            Ok(pc) => {
                samples += 1;
                *histogram.entry(pc).or_insert(0) += 1;
            }
            Err(err) => {
                failed_reads += 1;
                debug!(%err, "stuck PC read failed");
            }
        }
        thread::sleep(STUCK_READ_SPACING);
    }

    let distribution: Vec<StuckPcEntry> = histogram
        .iter()
        .sorted_by_key(|&(&pc, &hits)| (std::cmp::Reverse(hits), pc))
        .take(5)
        .map(|(&pc, &hits)| StuckPcEntry {
            pc: format!("{pc:#x}"),
            hits,
            ratio: hits as f64 / samples as f64,
        })
        .collect();

    let classification = match histogram.len() {
        1 => StuckClassification::HangDeadlock,
        2 | 3 => StuckClassification::ErrorLoop,
        _ => StuckClassification::RecoveryWalk,
    };

    StuckPcReport {
        samples,
        failed_reads,
        distribution,
        classification,
    }
}

/// Captures the most recent kernel log lines, ISO-timestamped when the
/// installed dmesg supports it.
pub fn capture_kernel_log() -> String {
    let iso = Command::new("dmesg").arg("--time-format=iso").output();
    let output = match iso {
        Ok(output) if output.status.success() => output,
        _ => match Command::new("dmesg").output() {
            Ok(output) => output,
            Err(err) => {
                warn!(%err, "kernel log capture failed");
                return format!("kernel log unavailable: {err}");
            }
        },
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(KERNEL_LOG_LINES);
    lines[start..].join("\n")
}
