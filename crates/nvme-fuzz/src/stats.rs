use std::{fs, io, path::Path};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::info;

use crate::{
    mutation::MutationRecord,
    nvme::{CommandClass, DispatchOutcome},
    sampler::StopReason,
};

#[derive(Debug, Default, Serialize)]
pub struct CommandStats {
    pub executions: u64,
    pub interesting: u64,
    pub timeouts: u64,
    pub errors: u64,
    /// Exit-code histogram for non-timeout, non-error results.
    pub exit_codes: IndexMap<i32, u64>,
}

#[derive(Debug, Default, Serialize)]
pub struct MutationStats {
    pub opcode_overrides: u64,
    pub nsid_overrides: u64,
    pub class_swaps: u64,
    pub datalen_overrides: u64,
    pub cdw_mutations: u64,
    pub splices: u64,
    pub corpus_inputs: u64,
    pub random_inputs: u64,
    pub deterministic_inputs: u64,
    pub admin_dispatches: u64,
    pub io_dispatches: u64,
    /// Opcodes actually sent on the wire, hex-keyed.
    pub sent_opcodes: IndexMap<String, u64>,
}

/// Write-only aggregates owned by the orchestrator.
#[derive(Debug, Default, Serialize)]
pub struct SessionStats {
    pub executions: u64,
    pub interesting_inputs: u64,
    pub crashes: u64,
    pub internal_errors: u64,
    pub total_samples: u64,
    pub stop_reasons: IndexMap<String, u64>,
    pub per_command: IndexMap<String, CommandStats>,
    pub mutation: MutationStats,
}

#[derive(Debug, Serialize)]
struct StatsSnapshot<'a> {
    elapsed_seconds: f64,
    execs_per_sec: f64,
    corpus_size: usize,
    confirmed_edges: usize,
    unique_pcs: usize,
    #[serde(flatten)]
    stats: &'a SessionStats,
}

impl SessionStats {
    pub fn record_dispatch(
        &mut self,
        command: &str,
        class: CommandClass,
        opcode: u8,
        outcome: &DispatchOutcome,
    ) {
        self.executions += 1;
        let per_command = self.per_command.entry(command.to_owned()).or_default();
        per_command.executions += 1;
        match outcome {
            DispatchOutcome::Exit(code) => {
                *per_command.exit_codes.entry(*code).or_insert(0) += 1;
            }
            DispatchOutcome::Timeout => per_command.timeouts += 1,
            DispatchOutcome::Error(_) => {
                per_command.errors += 1;
                self.internal_errors += 1;
            }
        }
        match class {
            CommandClass::Admin => self.mutation.admin_dispatches += 1,
            CommandClass::Io => self.mutation.io_dispatches += 1,
        }
        *self
            .mutation
            .sent_opcodes
            .entry(format!("{opcode:#04x}"))
            .or_insert(0) += 1;
    }

    pub fn record_mutation(&mut self, record: &MutationRecord) {
        let mutation = &mut self.mutation;
        mutation.corpus_inputs += 1;
        if record.spliced {
            mutation.splices += 1;
        }
        if record.cdw_mutated {
            mutation.cdw_mutations += 1;
        }
        if record.opcode_override {
            mutation.opcode_overrides += 1;
        }
        if record.nsid_override {
            mutation.nsid_overrides += 1;
        }
        if record.class_swap {
            mutation.class_swaps += 1;
        }
        if record.datalen_override {
            mutation.datalen_overrides += 1;
        }
    }

    pub fn record_stop_reason(&mut self, reason: Option<StopReason>) {
        if let Some(reason) = reason {
            *self.stop_reasons.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_interesting(&mut self, command: &str) {
        self.interesting_inputs += 1;
        self.per_command.entry(command.to_owned()).or_default().interesting += 1;
    }

    pub fn write_json(
        &self,
        path: &Path,
        elapsed_seconds: f64,
        corpus_size: usize,
        confirmed_edges: usize,
        unique_pcs: usize,
    ) -> io::Result<()> {
        let snapshot = StatsSnapshot {
            elapsed_seconds,
            execs_per_sec: if elapsed_seconds > 0.0 {
                self.executions as f64 / elapsed_seconds
            } else {
                0.0
            },
            corpus_size,
            confirmed_edges,
            unique_pcs,
            stats: self,
        };
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &snapshot).map_err(io::Error::other)
    }

    /// Final session summary, one log line per concern.
    pub fn log_summary(&self, elapsed_seconds: f64) {
        info!(
            executions = self.executions,
            interesting = self.interesting_inputs,
            crashes = self.crashes,
            internal_errors = self.internal_errors,
            samples = self.total_samples,
            execs_per_sec = format_args!(
                "{:.1}",
                if elapsed_seconds > 0.0 {
                    self.executions as f64 / elapsed_seconds
                } else {
                    0.0
                }
            ),
            "session finished"
        );
        for (command, stats) in &self.per_command {
            info!(
                command = %command,
                executions = stats.executions,
                interesting = stats.interesting,
                timeouts = stats.timeouts,
                errors = stats.errors,
                "per-command totals"
            );
        }
        let mutation = &self.mutation;
        info!(
            corpus = mutation.corpus_inputs,
            random = mutation.random_inputs,
            deterministic = mutation.deterministic_inputs,
            opcode_overrides = mutation.opcode_overrides,
            nsid_overrides = mutation.nsid_overrides,
            class_swaps = mutation.class_swaps,
            datalen_overrides = mutation.datalen_overrides,
            admin = mutation.admin_dispatches,
            io = mutation.io_dispatches,
            "mutation totals"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_build_a_histogram_per_command() {
        let mut stats = SessionStats::default();
        stats.record_dispatch("Identify", CommandClass::Admin, 0x06, &DispatchOutcome::Exit(0));
        stats.record_dispatch("Identify", CommandClass::Admin, 0x06, &DispatchOutcome::Exit(0));
        stats.record_dispatch("Identify", CommandClass::Admin, 0x06, &DispatchOutcome::Exit(2));
        stats.record_dispatch("Read", CommandClass::Io, 0x02, &DispatchOutcome::Timeout);

        let identify = &stats.per_command["Identify"];
        assert_eq!(identify.executions, 3);
        assert_eq!(identify.exit_codes[&0], 2);
        assert_eq!(identify.exit_codes[&2], 1);
        assert_eq!(stats.per_command["Read"].timeouts, 1);
        assert_eq!(stats.mutation.admin_dispatches, 3);
        assert_eq!(stats.mutation.io_dispatches, 1);
        assert_eq!(stats.mutation.sent_opcodes["0x06"], 3);
    }

    #[test]
    fn errors_count_as_internal() {
        let mut stats = SessionStats::default();
        stats.record_dispatch(
            "Flush",
            CommandClass::Io,
            0x00,
            &DispatchOutcome::Error("spawn failed".into()),
        );
        assert_eq!(stats.internal_errors, 1);
        assert_eq!(stats.per_command["Flush"].errors, 1);
    }

    #[test]
    fn snapshot_serializes_with_derived_rates() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut stats = SessionStats::default();
        stats.record_dispatch("Identify", CommandClass::Admin, 0x06, &DispatchOutcome::Exit(0));
        let path = dir.path().join("stats.json");
        stats.write_json(&path, 10.0, 3, 17, 99).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["executions"], 1);
        assert_eq!(value["corpus_size"], 3);
        assert_eq!(value["confirmed_edges"], 17);
        assert!((value["execs_per_sec"].as_f64().unwrap() - 0.1).abs() < 1e-9);
    }
}
