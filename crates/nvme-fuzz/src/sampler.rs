use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use derive_more::Display;
use tracing::{debug, info, warn};

use crate::{
    config::FuzzConfig,
    coverage::Edge,
    probe::{ProbeControl, ProbeError},
};

/// An idle PC must account for at least this share of diagnostic samples.
const IDLE_SHARE_THRESHOLD: f64 = 0.30;

const DIAGNOSE_SPACING: Duration = Duration::from_millis(2);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    #[display("global_saturated")]
    GlobalSaturated,
    #[display("idle_saturated")]
    IdleSaturated,
    #[display("max_samples")]
    MaxSamples,
    #[display("stop_event")]
    StopEvent,
}

/// Everything one sampling run produced. Owned by the worker while it
/// runs and handed back whole when the worker joins.
#[derive(Debug, Default, Clone)]
pub struct RunCoverage {
    pub edges: AHashSet<Edge>,
    pub edge_counts: AHashMap<Edge, u64>,
    pub pcs: AHashSet<u32>,
    pub raw_trace: Vec<u32>,
    pub samples: u32,
    pub failed_reads: u32,
    pub out_of_range: u32,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub sample_interval_us: u64,
    pub max_samples_per_run: u32,
    pub saturation_limit: u32,
    pub global_saturation_limit: u32,
    pub addr_range_start: u32,
    pub addr_range_end: u32,
}

impl SamplerSettings {
    pub fn from_config(config: &FuzzConfig) -> Self {
        Self {
            sample_interval_us: config.sample_interval_us,
            max_samples_per_run: config.max_samples_per_run,
            saturation_limit: config.saturation_limit,
            global_saturation_limit: config.global_saturation_limit,
            addr_range_start: config.addr_range_start,
            addr_range_end: config.addr_range_end,
        }
    }

    fn in_range(&self, pc: u32) -> bool {
        (self.addr_range_start..=self.addr_range_end).contains(&pc)
    }
}

/// Halt-read-resume PC sampler. One worker thread per dispatched command;
/// per-run state lives in the worker and is returned on join, so the main
/// thread never observes a run in flight.
#[derive(Debug)]
pub struct PcSampler<P> {
    probe: Arc<P>,
    settings: SamplerSettings,
    idle_pc: Option<u32>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<RunCoverage>>,
    total_samples: u64,
}

impl<P: ProbeControl + 'static> PcSampler<P> {
    pub fn new(probe: Arc<P>, settings: SamplerSettings) -> Self {
        Self {
            probe,
            settings,
            idle_pc: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            total_samples: 0,
        }
    }

    pub fn idle_pc(&self) -> Option<u32> {
        self.idle_pc
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Probes the idle target `probes` times and estimates the firmware's
    /// dominant idle loop: the single most frequent PC, if it accounts for
    /// at least 30% of the successful samples. Fails only if every probe
    /// fails.
    pub fn diagnose(&mut self, probes: u32) -> Result<Option<u32>, ProbeError> {
        let mut histogram: AHashMap<u32, u32> = AHashMap::new();
        let mut successes = 0u32;
        for _ in 0..probes {
            match self.probe.sample_pc() {
                Ok(pc) => {
                    successes += 1;
                    *histogram.entry(pc).or_insert(0) += 1;
                }
                Err(err) => debug!(%err, "diagnostic probe failed"),
            }
            thread::sleep(DIAGNOSE_SPACING);
        }
        if successes == 0 {
            return Err(ProbeError::Fault(format!(
                "all {probes} diagnostic probes failed"
            )));
        }

        let mut top: Option<(u32, u32)> = None;
        for (&pc, &hits) in &histogram {
            if top.is_none_or(|(_, best)| hits > best) {
                top = Some((pc, hits));
            }
        }
        self.idle_pc = top.and_then(|(pc, hits)| {
            let share = f64::from(hits) / f64::from(successes);
            if share >= IDLE_SHARE_THRESHOLD {
                info!(idle_pc = format_args!("{pc:#x}"), share, "idle PC identified");
                Some(pc)
            } else {
                info!(share, "no dominant idle PC");
                None
            }
        });
        Ok(self.idle_pc)
    }

    /// Spawns the worker with a fresh per-run state and a snapshot of the
    /// confirmed-edge set. The global set cannot change while the run is in
    /// flight, so the snapshot is exact for saturation judgments.
    pub fn start(&mut self, confirmed: Arc<AHashSet<Edge>>) -> io::Result<()> {
        self.stop.store(false, Ordering::SeqCst);
        let worker = SamplerWorker {
            probe: Arc::clone(&self.probe),
            settings: self.settings.clone(),
            idle_pc: self.idle_pc,
            confirmed,
            stop: Arc::clone(&self.stop),
        };
        let handle = thread::Builder::new()
            .name("pc-sampler".to_owned())
            .spawn(move || worker.run())?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Signals the worker and joins it. The join is bounded: the worker
    /// re-checks the stop flag after every sample, so it exits within one
    /// probe transaction plus one inter-sample interval.
    pub fn stop(&mut self) -> RunCoverage {
        self.stop.store(true, Ordering::SeqCst);
        match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(run) => {
                    self.total_samples += u64::from(run.samples);
                    run
                }
                Err(_) => {
                    warn!("sampler worker panicked; run discarded");
                    RunCoverage::default()
                }
            },
            None => RunCoverage::default(),
        }
    }
}

struct SamplerWorker<P> {
    probe: Arc<P>,
    settings: SamplerSettings,
    idle_pc: Option<u32>,
    confirmed: Arc<AHashSet<Edge>>,
    stop: Arc<AtomicBool>,
}

impl<P: ProbeControl> SamplerWorker<P> {
    fn run(self) -> RunCoverage {
        let mut run = RunCoverage::default();
        // Sentinel per run: the first in-range sample never yields an edge
        // and no edge ever spans two runs.
        let mut prev_pc: Option<u32> = None;
        let mut since_last_global_new = 0u32;
        let mut consecutive_idle = 0u32;
        let interval = Duration::from_micros(self.settings.sample_interval_us);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                run.stop_reason = Some(StopReason::StopEvent);
                break;
            }

            match self.probe.sample_pc() {
                Err(err) => {
                    // Individual failed reads are recovered locally; the
                    // orchestrator's heartbeat catches a dead probe.
                    run.failed_reads += 1;
                    debug!(%err, "pc sample failed");
                }
                Ok(pc) => {
                    run.samples += 1;
                    if !self.settings.in_range(pc) {
                        run.out_of_range += 1;
                        consecutive_idle = 0;
                    } else {
                        match prev_pc {
                            None => prev_pc = Some(pc),
                            Some(prev) => {
                                let edge = Edge::new(prev, pc);
                                run.edges.insert(edge);
                                *run.edge_counts.entry(edge).or_insert(0) += 1;
                                prev_pc = Some(pc);
                                if self.confirmed.contains(&edge) {
                                    since_last_global_new += 1;
                                } else {
                                    since_last_global_new = 0;
                                }
                            }
                        }
                        if self.idle_pc == Some(pc) {
                            consecutive_idle += 1;
                        } else {
                            consecutive_idle = 0;
                        }
                        run.pcs.insert(pc);
                        run.raw_trace.push(pc);
                    }

                    if self.settings.global_saturation_limit > 0
                        && since_last_global_new >= self.settings.global_saturation_limit
                    {
                        run.stop_reason = Some(StopReason::GlobalSaturated);
                        break;
                    }
                    if self.settings.saturation_limit > 0
                        && self.idle_pc.is_some()
                        && consecutive_idle >= self.settings.saturation_limit
                    {
                        run.stop_reason = Some(StopReason::IdleSaturated);
                        break;
                    }
                    if run.samples >= self.settings.max_samples_per_run {
                        run.stop_reason = Some(StopReason::MaxSamples);
                        break;
                    }
                }
            }

            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        run
    }
}
