use std::{
    collections::VecDeque,
    fs, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use ahash::AHashSet;
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    artifacts::OutputLayout,
    config::{ConfigError, FuzzConfig},
    corpus::{Corpus, Seed, random_payload},
    coverage::{CoverageFileError, CoverageStore, Edge},
    crash::{self, STUCK_PC_READS},
    mutation::{DeterministicCursor, MutationRecord, Mutator},
    nvme::{
        self, CommandTemplate, DispatchOutcome, PassthruRequest, PassthruTransport, build_request,
    },
    probe::{ProbeControl, ProbeError},
    sampler::{PcSampler, RunCoverage, SamplerSettings},
    stats::SessionStats,
};

/// Probe liveness check and corpus maintenance cadence, in executions.
const MAINTENANCE_INTERVAL: u64 = 1000;

/// Coverage files are rewritten this often, in executions.
const COVERAGE_PERSIST_INTERVAL: u64 = 500;

const STATS_LOG_INTERVAL: u64 = 100;

const DIAGNOSE_PROBES: u32 = 50;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Coverage(#[from] CoverageFileError),
    #[error("calibration of {command} aborted: {reason}")]
    Calibration { command: String, reason: String },
    #[error("session I/O")]
    Io(#[from] io::Error),
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    RuntimeLimit,
    Interrupted,
    /// A command timed out. The device is left in its post-fault state:
    /// no probe close, no reconnect, no rescan.
    TimeoutCrash,
}

#[derive(Debug)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub executions: u64,
    pub corpus_len: usize,
    pub confirmed_edges: usize,
    pub unique_pcs: usize,
    pub crashes: u64,
}

#[derive(Debug)]
enum CandidateOrigin {
    Deterministic { seed_id: u64 },
    Havoc { seed_id: u64, record: MutationRecord },
    Random,
}

#[derive(Debug)]
struct Candidate {
    seed: Seed,
    origin: CandidateOrigin,
}

/// The fuzzing session: owns the corpus, the coverage store, the sampler
/// and all statistics. Single-threaded apart from the sampler worker.
#[derive(Debug)]
pub struct FuzzSession<P, T> {
    config: FuzzConfig,
    templates: Vec<Arc<CommandTemplate>>,
    probe: Arc<P>,
    transport: T,
    sampler: PcSampler<P>,
    coverage: CoverageStore,
    confirmed_snapshot: Arc<AHashSet<Edge>>,
    corpus: Corpus,
    mutator: Mutator,
    det_queue: VecDeque<DeterministicCursor>,
    stats: SessionStats,
    artifacts: OutputLayout,
    rng: StdRng,
    stop_flag: Arc<AtomicBool>,
    total_execs: u64,
    started: Instant,
}

impl<P, T> FuzzSession<P, T>
where
    P: ProbeControl + 'static,
    T: PassthruTransport,
{
    pub fn new(
        config: FuzzConfig,
        probe: Arc<P>,
        transport: T,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<Self, SessionError> {
        let templates = nvme::enabled_templates(&config)?;
        info!(
            templates = ?templates.iter().map(|template| template.name).collect::<Vec<_>>(),
            "command templates enabled"
        );

        let artifacts = OutputLayout::create(&config.output_dir)?;
        let mut coverage = CoverageStore::new(config.edge_confirm_threshold);
        if let Some(prior) = &config.resume_coverage {
            coverage.load(prior)?;
        }
        let confirmed_snapshot = coverage.confirmed_snapshot();

        let sampler = PcSampler::new(Arc::clone(&probe), SamplerSettings::from_config(&config));
        let mutator = Mutator::from_config(&config);
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            templates,
            probe,
            transport,
            sampler,
            coverage,
            confirmed_snapshot,
            corpus: Corpus::new(),
            mutator,
            det_queue: VecDeque::new(),
            stats: SessionStats::default(),
            artifacts,
            rng,
            stop_flag,
            total_execs: 0,
            started: Instant::now(),
        })
    }

    pub fn run(&mut self) -> Result<SessionSummary, SessionError> {
        self.started = Instant::now();
        self.load_initial_seeds()?;

        match self.sampler.diagnose(DIAGNOSE_PROBES) {
            Ok(Some(idle_pc)) => info!(idle_pc = format_args!("{idle_pc:#x}"), "sampler ready"),
            Ok(None) => info!("sampler ready, no idle PC"),
            Err(err) => return Err(err.into()),
        }

        self.calibrate_initial_seeds()?;

        let end = self.fuzz_loop()?;
        self.finalize(end)
    }

    fn fuzz_loop(&mut self) -> Result<SessionEnd, SessionError> {
        let deadline = Duration::from_secs(self.config.total_runtime_sec);
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                info!("interrupted, shutting down cleanly");
                return Ok(SessionEnd::Interrupted);
            }
            if self.started.elapsed() >= deadline {
                info!("runtime limit reached");
                return Ok(SessionEnd::RuntimeLimit);
            }

            let candidate = match self.next_deterministic_candidate() {
                Some(candidate) => candidate,
                None => self.havoc_candidate(),
            };

            let (request, outcome, run) = self.dispatch_sampled(&candidate.seed)?;
            self.total_execs += 1;
            self.account_run(&candidate, &request, &outcome, &run);

            match outcome {
                DispatchOutcome::Timeout => {
                    self.handle_timeout_crash(&candidate.seed, &request)?;
                    return Ok(SessionEnd::TimeoutCrash);
                }
                DispatchOutcome::Error(reason) => {
                    warn!(%reason, command = %request.command, "internal dispatch error");
                }
                DispatchOutcome::Exit(_) => {}
            }

            self.evaluate_run(candidate, run)?;
            self.periodic_maintenance()?;
        }
    }

    /// Default seeds plus files from `seed_dir`, attached to every enabled
    /// template. Initial seeds are newly added too: each one enters the
    /// deterministic queue just like a discovery.
    fn load_initial_seeds(&mut self) -> Result<(), SessionError> {
        let mut new_ids = Vec::new();
        for template in &self.templates {
            let cdws = nvme::protocol_sane_dwords(template.name);
            let well_formed = Seed::new(vec![0u8; 64], Arc::clone(template), cdws);
            new_ids.push(self.corpus.push(well_formed));

            let mut random = random_payload(&mut self.rng);
            random.truncate(self.config.max_input_len.min(64));
            new_ids.push(self.corpus.push(Seed::new(random, Arc::clone(template), cdws)));
        }

        if let Some(seed_dir) = self.config.seed_dir.clone() {
            let mut loaded = 0usize;
            for entry in fs::read_dir(&seed_dir)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let mut payload = fs::read(&path)?;
                payload.truncate(self.config.max_input_len);
                for template in &self.templates {
                    let cdws = nvme::protocol_sane_dwords(template.name);
                    new_ids.push(
                        self.corpus
                            .push(Seed::new(payload.clone(), Arc::clone(template), cdws)),
                    );
                }
                loaded += 1;
            }
            info!(files = loaded, seeds = self.corpus.len(), "seed files imported");
        }

        for seed_id in new_ids {
            self.enqueue_deterministic(seed_id);
        }
        info!(seeds = self.corpus.len(), "initial corpus loaded");
        Ok(())
    }

    fn enqueue_deterministic(&mut self, seed_id: u64) {
        if !self.config.deterministic_enabled {
            return;
        }
        if let Some(seed) = self.corpus.by_id(seed_id) {
            self.det_queue
                .push_back(DeterministicCursor::new(seed, self.config.deterministic_arith_max));
        }
    }

    /// Executes every initial seed `calibration_runs` times. The observed
    /// union enters the confirmed set directly; a timeout or internal
    /// error here is fatal.
    fn calibrate_initial_seeds(&mut self) -> Result<(), SessionError> {
        let runs_per_seed = self.config.calibration_runs;
        if runs_per_seed == 0 {
            return Ok(());
        }
        let seed_ids: Vec<u64> = self.corpus.iter().map(|seed| seed.id).collect();
        for seed_id in seed_ids {
            let mut runs: Vec<AHashSet<Edge>> = Vec::with_capacity(runs_per_seed as usize);
            let mut run_coverages: Vec<RunCoverage> = Vec::with_capacity(runs_per_seed as usize);
            for _ in 0..runs_per_seed {
                let Some(seed) = self.corpus.by_id(seed_id) else {
                    break;
                };
                let candidate = seed.clone();
                let (request, outcome, run) = self.dispatch_sampled(&candidate)?;
                self.total_execs += 1;
                self.stats.total_samples = self.sampler.total_samples();
                self.stats.record_dispatch(
                    &request.command,
                    request.class,
                    request.opcode,
                    &outcome,
                );
                match outcome {
                    DispatchOutcome::Exit(_) => {}
                    DispatchOutcome::Timeout => {
                        self.handle_timeout_crash(&candidate, &request)?;
                        return Err(SessionError::Calibration {
                            command: request.command,
                            reason: "command timed out".to_owned(),
                        });
                    }
                    DispatchOutcome::Error(reason) => {
                        return Err(SessionError::Calibration {
                            command: request.command,
                            reason,
                        });
                    }
                }
                runs.push(run.edges.clone());
                run_coverages.push(run);
            }

            if let Some(seed) = self.corpus.by_id_mut(seed_id) {
                let union = seed.apply_calibration(&runs);
                seed.exec_count += runs.len() as u64;
                let stability = seed.stability;
                self.coverage.confirm_directly(union);
                for run in &run_coverages {
                    self.coverage.evaluate(&run.edges, &run.edge_counts);
                    self.coverage.record_pcs(&run.pcs);
                }
                if stability < 1.0 {
                    info!(seed_id, stability, "seed calibrated with unstable edges");
                }
            }
        }
        self.refresh_snapshot();
        info!(
            confirmed = self.coverage.confirmed_len(),
            "calibration complete"
        );
        Ok(())
    }

    /// One deterministic-stage candidate, at most one per loop iteration.
    fn next_deterministic_candidate(&mut self) -> Option<Candidate> {
        if !self.config.deterministic_enabled {
            return None;
        }
        loop {
            let cursor = self.det_queue.front_mut()?;
            let seed_id = cursor.seed_id();
            let Some(seed) = self.corpus.by_id(seed_id) else {
                // Culled while queued.
                self.det_queue.pop_front();
                continue;
            };
            match cursor.next_variant() {
                Some((field, value)) => {
                    let cdws = cursor.dwords_with(field, value);
                    let mut variant =
                        Seed::new(seed.payload.clone(), Arc::clone(&seed.template), cdws);
                    variant.overrides = seed.overrides;
                    return Some(Candidate {
                        seed: variant,
                        origin: CandidateOrigin::Deterministic { seed_id },
                    });
                }
                None => {
                    self.det_queue.pop_front();
                    if let Some(seed) = self.corpus.by_id_mut(seed_id) {
                        seed.det_done = true;
                    }
                }
            }
        }
    }

    fn havoc_candidate(&mut self) -> Candidate {
        self.corpus
            .refresh_energy(self.total_execs, self.config.max_energy);

        let go_random =
            self.corpus.is_empty() || self.rng.gen_bool(self.config.random_gen_ratio);
        if go_random {
            let template = &self.templates[self.rng.gen_range(0..self.templates.len())];
            let cdws = nvme::protocol_sane_dwords(template.name);
            let seed = Seed::new(random_payload(&mut self.rng), Arc::clone(template), cdws);
            return Candidate {
                seed,
                origin: CandidateOrigin::Random,
            };
        }

        let index = self
            .corpus
            .select_weighted(&mut self.rng)
            .unwrap_or_default();
        let source = self.corpus.get(index).cloned().unwrap_or_else(|| {
            Seed::new(
                random_payload(&mut self.rng),
                Arc::clone(&self.templates[0]),
                nvme::protocol_sane_dwords(self.templates[0].name),
            )
        });
        let mutated = self
            .mutator
            .mutate(&source, &self.corpus, &self.templates, &mut self.rng);

        let mut seed = Seed::new(mutated.payload, Arc::clone(&source.template), mutated.cdws);
        seed.overrides = mutated.overrides;
        Candidate {
            seed,
            origin: CandidateOrigin::Havoc {
                seed_id: source.id,
                record: mutated.record,
            },
        }
    }

    /// Starts sampling, dispatches through the transport, keeps sampling
    /// for the post-command tail on success, then joins the worker.
    fn dispatch_sampled(
        &mut self,
        seed: &Seed,
    ) -> Result<(PassthruRequest, DispatchOutcome, RunCoverage), SessionError> {
        let request = build_request(seed, &self.config);
        self.sampler.start(Arc::clone(&self.confirmed_snapshot))?;
        let outcome = self.transport.execute(&request, &seed.payload);
        if matches!(outcome, DispatchOutcome::Exit(_)) && self.config.post_cmd_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.post_cmd_delay_ms));
        }
        let run = self.sampler.stop();
        Ok((request, outcome, run))
    }

    fn account_run(
        &mut self,
        candidate: &Candidate,
        request: &PassthruRequest,
        outcome: &DispatchOutcome,
        run: &RunCoverage,
    ) {
        self.stats
            .record_dispatch(&request.command, request.class, request.opcode, outcome);
        self.stats.record_stop_reason(run.stop_reason);
        self.stats.total_samples = self.sampler.total_samples();
        match &candidate.origin {
            CandidateOrigin::Havoc { seed_id, record } => {
                self.stats.record_mutation(record);
                if let Some(source) = self.corpus.by_id_mut(*seed_id) {
                    source.exec_count += 1;
                }
            }
            CandidateOrigin::Deterministic { seed_id } => {
                self.stats.mutation.deterministic_inputs += 1;
                if let Some(source) = self.corpus.by_id_mut(*seed_id) {
                    source.exec_count += 1;
                }
            }
            CandidateOrigin::Random => self.stats.mutation.random_inputs += 1,
        }
    }

    /// Promotion, bucket accounting, and corpus growth for one finished
    /// run. Runs strictly after the sampler joined.
    fn evaluate_run(&mut self, candidate: Candidate, run: RunCoverage) -> Result<(), SessionError> {
        let evaluation = self.coverage.evaluate(&run.edges, &run.edge_counts);
        let new_pcs = self.coverage.record_pcs(&run.pcs);
        self.coverage.record_command_run(
            &candidate.seed.template.name,
            &run.edges,
            &run.pcs,
            &run.raw_trace,
        );
        if !evaluation.promoted.is_empty() {
            self.refresh_snapshot();
        }

        let interesting = evaluation.is_interesting();
        if let CandidateOrigin::Havoc { record, .. } = &candidate.origin {
            self.mutator.mopt.record_run(record.ops_used, interesting);
        }
        if !interesting {
            return Ok(());
        }

        self.stats.record_interesting(candidate.seed.template.name);
        let mut discovered = candidate.seed;
        discovered.found_at = self.total_execs;
        discovered.new_edges = evaluation.promoted.len();
        discovered.energy = self.config.max_energy;
        discovered.covered_edges = run
            .edges
            .iter()
            .filter(|edge| self.coverage.contains(edge))
            .copied()
            .collect();
        info!(
            command = discovered.template.name,
            new_edges = evaluation.promoted.len(),
            bucket_changes = evaluation.bucket_changes,
            new_pcs,
            score = evaluation.score(),
            total_edges = self.coverage.confirmed_len(),
            "new coverage"
        );
        self.artifacts.save_corpus_input(&discovered)?;
        let id = self.corpus.push(discovered);
        self.enqueue_deterministic(id);
        Ok(())
    }

    /// Forensics over uptime: read the stuck PCs, capture the kernel log,
    /// persist the artifact, and leave the probe and device untouched.
    fn handle_timeout_crash(
        &mut self,
        seed: &Seed,
        request: &PassthruRequest,
    ) -> Result<(), SessionError> {
        warn!(
            command = %request.command,
            opcode = format_args!("{:#04x}", request.opcode),
            "command timed out; preserving device state for inspection"
        );
        let report = crash::read_stuck_pcs(self.probe.as_ref(), STUCK_PC_READS);
        info!(
            classification = ?report.classification,
            distinct_pcs = report.distribution.len(),
            "stuck PC distribution read"
        );
        let kernel_log = crash::capture_kernel_log();
        self.artifacts.save_crash(seed, request, &report, &kernel_log)?;
        self.stats.crashes += 1;
        Ok(())
    }

    fn periodic_maintenance(&mut self) -> Result<(), SessionError> {
        if self.total_execs % MAINTENANCE_INTERVAL == 0 {
            // Probe heartbeat: a dead debug link invalidates all further
            // coverage, so abort rather than fuzz blind.
            self.probe.sample_pc()?;
            self.corpus
                .cull(self.coverage.confirmed_edges(), self.config.max_corpus_hard_limit);
        }
        if self.total_execs % COVERAGE_PERSIST_INTERVAL == 0 {
            self.coverage.save(self.artifacts.root())?;
            self.write_stats()?;
        }
        if self.total_execs % STATS_LOG_INTERVAL == 0 {
            info!(
                executions = self.total_execs,
                corpus = self.corpus.len(),
                edges = self.coverage.confirmed_len(),
                pcs = self.coverage.pcs_len(),
                interesting = self.stats.interesting_inputs,
                "progress"
            );
        }
        Ok(())
    }

    fn finalize(&mut self, end: SessionEnd) -> Result<SessionSummary, SessionError> {
        self.coverage.save(self.artifacts.root())?;
        self.write_stats()?;
        self.stats.log_summary(self.started.elapsed().as_secs_f64());

        let summary = SessionSummary {
            end,
            executions: self.total_execs,
            corpus_len: self.corpus.len(),
            confirmed_edges: self.coverage.confirmed_len(),
            unique_pcs: self.coverage.pcs_len(),
            crashes: self.stats.crashes,
        };
        info!(?summary, "session summary");
        Ok(summary)
    }

    fn write_stats(&self) -> io::Result<()> {
        self.stats.write_json(
            &self.artifacts.root().join("stats.json"),
            self.started.elapsed().as_secs_f64(),
            self.corpus.len(),
            self.coverage.confirmed_len(),
            self.coverage.pcs_len(),
        )
    }

    fn refresh_snapshot(&mut self) {
        self.confirmed_snapshot = self.coverage.confirmed_snapshot();
    }
}
