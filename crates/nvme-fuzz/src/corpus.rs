use std::{mem, sync::Arc};

use ahash::AHashSet;
use rand::{Rng, rngs::StdRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::{coverage::Edge, nvme::CommandTemplate};

/// The eight 32-bit command dword fields carried by a seed:
/// cdw2, cdw3, cdw10..cdw15.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandDwords(pub [u32; 8]);

macro_rules! dword_accessors {
    ($($get:ident, $set:ident => $idx:expr;)*) => {
        $(
            pub fn $get(&self) -> u32 {
                self.0[$idx]
            }

            pub fn $set(&mut self, value: u32) {
                self.0[$idx] = value;
            }
        )*
    };
}

impl CommandDwords {
    dword_accessors! {
        cdw2, set_cdw2 => 0;
        cdw3, set_cdw3 => 1;
        cdw10, set_cdw10 => 2;
        cdw11, set_cdw11 => 3;
        cdw12, set_cdw12 => 4;
        cdw13, set_cdw13 => 5;
        cdw14, set_cdw14 => 6;
        cdw15, set_cdw15 => 7;
    }
}

/// Optional structured overrides resolved by the dispatcher.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeedOverrides {
    pub opcode: Option<u8>,
    pub nsid: Option<u32>,
    /// `Some(true)` forces the Admin passthru path, `Some(false)` the IO
    /// path, regardless of the template's class.
    pub force_admin: Option<bool>,
    pub data_len: Option<usize>,
}

/// One scheduled fuzz input. The template is fixed for the seed's
/// lifetime.
#[derive(Debug, Clone)]
pub struct Seed {
    pub id: u64,
    pub payload: Vec<u8>,
    pub template: Arc<CommandTemplate>,
    pub cdws: CommandDwords,
    pub overrides: SeedOverrides,
    pub exec_count: u64,
    /// Execution number at discovery; 0 for initial seeds.
    pub found_at: u64,
    /// Edges attributed to this seed at discovery.
    pub new_edges: usize,
    /// Cached power-schedule weight.
    pub energy: u64,
    pub covered_edges: AHashSet<Edge>,
    pub is_favored: bool,
    pub is_calibrated: bool,
    pub stability: f64,
    pub stable_edges: AHashSet<Edge>,
    pub det_done: bool,
}

impl Seed {
    pub fn new(payload: Vec<u8>, template: Arc<CommandTemplate>, cdws: CommandDwords) -> Self {
        Self {
            id: 0,
            payload,
            template,
            cdws,
            overrides: SeedOverrides::default(),
            exec_count: 0,
            found_at: 0,
            new_edges: 0,
            energy: 0,
            covered_edges: AHashSet::new(),
            is_favored: false,
            is_calibrated: false,
            stability: 0.0,
            stable_edges: AHashSet::new(),
            det_done: false,
        }
    }

    /// Folds calibration runs into the seed: stable edges are those seen in
    /// strictly more than half the runs (demanding full reproduction would
    /// empty the set under statistical sampling). Returns the union of all
    /// observed edges.
    pub fn apply_calibration(&mut self, runs: &[AHashSet<Edge>]) -> AHashSet<Edge> {
        let mut union: AHashSet<Edge> = AHashSet::new();
        for run in runs {
            union.extend(run);
        }
        let actual_runs = runs.len();
        let stable: AHashSet<Edge> = union
            .iter()
            .filter(|edge| {
                let observed = runs.iter().filter(|run| run.contains(edge)).count();
                observed * 2 > actual_runs
            })
            .copied()
            .collect();
        self.stability = if union.is_empty() {
            1.0
        } else {
            stable.len() as f64 / union.len() as f64
        };
        self.stable_edges = stable;
        self.covered_edges.extend(&union);
        self.is_calibrated = true;
        union
    }
}

/// AFLfast "explore" energy: `min(max_energy, 2^⌊log2(total/k)⌋)` for a
/// seed executed `k` times; unexecuted seeds get the maximum.
pub fn seed_energy(exec_count: u64, total_execs: u64, max_energy: u64) -> u64 {
    let max_energy = max_energy.max(1);
    if exec_count == 0 {
        return max_energy;
    }
    let ratio = total_execs / exec_count;
    if ratio == 0 {
        1
    } else {
        (1u64 << ratio.ilog2()).min(max_energy)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CullOutcome {
    pub favored: usize,
    pub removed: usize,
}

/// The live corpus, owned by the orchestrator.
#[derive(Debug, Default)]
pub struct Corpus {
    seeds: Vec<Seed>,
    next_id: u64,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut seed: Seed) -> u64 {
        self.next_id += 1;
        seed.id = self.next_id;
        let id = seed.id;
        self.seeds.push(seed);
        id
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Seed> {
        self.seeds.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Seed> {
        self.seeds.get_mut(index)
    }

    pub fn by_id(&self, id: u64) -> Option<&Seed> {
        self.seeds.iter().find(|seed| seed.id == id)
    }

    pub fn by_id_mut(&mut self, id: u64) -> Option<&mut Seed> {
        self.seeds.iter_mut().find(|seed| seed.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.iter()
    }

    /// Recomputes every seed's cached energy for the current execution
    /// count. `O(n)`, dominated by probe I/O in practice.
    pub fn refresh_energy(&mut self, total_execs: u64, max_energy: u64) {
        for seed in &mut self.seeds {
            seed.energy = seed_energy(seed.exec_count, total_execs, max_energy);
        }
    }

    /// One-pass prefix-sum weighted pick over cached energies.
    pub fn select_weighted(&self, rng: &mut StdRng) -> Option<usize> {
        if self.seeds.is_empty() {
            return None;
        }
        let total: u64 = self.seeds.iter().map(|seed| seed.energy.max(1)).sum();
        let mut ticket = rng.gen_range(0..total);
        for (index, seed) in self.seeds.iter().enumerate() {
            let weight = seed.energy.max(1);
            if ticket < weight {
                return Some(index);
            }
            ticket -= weight;
        }
        Some(self.seeds.len() - 1)
    }

    /// Corpus culling. Favors the minimum-payload-length seed per confirmed
    /// edge (first-come on ties), removes unfavored non-initial seeds that
    /// already ran at least twice, then enforces the optional hard limit
    /// while protecting favored and initial seeds.
    pub fn cull(&mut self, confirmed: &AHashSet<Edge>, hard_limit: usize) -> CullOutcome {
        for seed in &mut self.seeds {
            seed.is_favored = false;
        }
        let mut favored_indices: AHashSet<usize> = AHashSet::new();
        for edge in confirmed {
            let best = self
                .seeds
                .iter()
                .enumerate()
                .filter(|(_, seed)| seed.covered_edges.contains(edge))
                .min_by_key(|&(index, seed)| (seed.payload.len(), index));
            if let Some((index, _)) = best {
                favored_indices.insert(index);
            }
        }
        for &index in &favored_indices {
            self.seeds[index].is_favored = true;
        }

        let before = self.seeds.len();
        self.seeds
            .retain(|seed| seed.is_favored || seed.found_at == 0 || seed.exec_count < 2);

        if hard_limit > 0 && self.seeds.len() > hard_limit {
            let seeds = mem::take(&mut self.seeds);
            let (protected, expendable): (Vec<_>, Vec<_>) = seeds
                .into_iter()
                .partition(|seed| seed.is_favored || seed.found_at == 0);
            let slots = hard_limit.saturating_sub(protected.len());
            let mut expendable = expendable;
            expendable.sort_by_key(|seed| seed.exec_count);
            expendable.truncate(slots);
            self.seeds = protected;
            self.seeds.extend(expendable);
        }

        let outcome = CullOutcome {
            favored: favored_indices.len(),
            removed: before - self.seeds.len(),
        };
        if outcome.removed > 0 {
            info!(
                removed = outcome.removed,
                favored = outcome.favored,
                remaining = self.seeds.len(),
                "corpus culled"
            );
        } else {
            debug!(favored = outcome.favored, "corpus cull: nothing removed");
        }
        outcome
    }
}

/// A fully random generated input: 64–512 uniform bytes.
pub fn random_payload(rng: &mut StdRng) -> Vec<u8> {
    let len = rng.gen_range(64..=512);
    (0..len).map(|_| rng.r#gen::<u8>()).collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::nvme::find_template;

    fn template() -> Arc<CommandTemplate> {
        Arc::new(find_template("Identify").unwrap().clone())
    }

    fn seed_with(payload_len: usize, edges: &[(u32, u32)]) -> Seed {
        let mut seed = Seed::new(vec![0; payload_len], template(), CommandDwords::default());
        seed.covered_edges = edges.iter().map(|&(p, c)| Edge::new(p, c)).collect();
        seed
    }

    #[test]
    fn energy_follows_explore_schedule() {
        assert_eq!(seed_energy(0, 100, 64), 64);
        assert_eq!(seed_energy(100, 100, 64), 1);
        assert_eq!(seed_energy(10, 100, 64), 8);
        assert_eq!(seed_energy(1, 100, 64), 64); // capped
        assert_eq!(seed_energy(200, 100, 64), 1); // ratio rounds to zero
        assert_eq!(seed_energy(3, 100, 64), 32); // 100/3 = 33 -> 2^5
    }

    #[test]
    fn weighted_selection_respects_energy() {
        let mut corpus = Corpus::new();
        for _ in 0..3 {
            corpus.push(seed_with(8, &[]));
        }
        corpus.get_mut(0).unwrap().energy = 0;
        corpus.get_mut(1).unwrap().energy = 1000;
        corpus.get_mut(2).unwrap().energy = 0;

        let mut rng = StdRng::seed_from_u64(7);
        let mut hits = [0usize; 3];
        for _ in 0..200 {
            hits[corpus.select_weighted(&mut rng).unwrap()] += 1;
        }
        assert!(hits[1] > 180, "energy-dominant seed rarely picked: {hits:?}");
    }

    #[test]
    fn culling_protects_favored_and_initial_seeds() {
        let mut corpus = Corpus::new();
        // Three initial seeds: only A covers e1.
        corpus.push(seed_with(16, &[(0x10, 0x14)])); // A
        corpus.push(seed_with(16, &[])); // B
        corpus.push(seed_with(16, &[])); // C
        // Five discovered seeds, exec_count 5: only D covers e2.
        for i in 0..5 {
            let mut seed = seed_with(32, if i == 0 { &[(0x20, 0x24)] } else { &[] });
            seed.found_at = 100 + i as u64;
            seed.exec_count = 5;
            corpus.push(seed);
        }
        let confirmed: AHashSet<Edge> =
            [Edge::new(0x10, 0x14), Edge::new(0x20, 0x24)].into_iter().collect();

        let outcome = corpus.cull(&confirmed, 0);
        assert_eq!(corpus.len(), 4);
        assert_eq!(outcome.removed, 4);
        assert_eq!(outcome.favored, 2);
        assert!(corpus.iter().any(|seed| seed.covered_edges.contains(&Edge::new(0x20, 0x24))
            && seed.is_favored));
        // Every confirmed edge still has a favored seed covering it.
        for edge in &confirmed {
            assert!(corpus
                .iter()
                .any(|seed| seed.is_favored && seed.covered_edges.contains(edge)));
        }
    }

    #[test]
    fn favored_prefers_minimum_payload_with_first_come_ties() {
        let mut corpus = Corpus::new();
        corpus.push(seed_with(64, &[(0x1, 0x2)]));
        corpus.push(seed_with(8, &[(0x1, 0x2)]));
        corpus.push(seed_with(8, &[(0x1, 0x2)]));
        let confirmed: AHashSet<Edge> = [Edge::new(0x1, 0x2)].into_iter().collect();
        corpus.cull(&confirmed, 0);
        assert!(!corpus.get(0).unwrap().is_favored);
        assert!(corpus.get(1).unwrap().is_favored);
        assert!(!corpus.get(2).unwrap().is_favored);
    }

    #[test]
    fn hard_limit_keeps_lowest_exec_count_expendables() {
        let mut corpus = Corpus::new();
        let mut favored = seed_with(4, &[(0x1, 0x2)]);
        favored.found_at = 1;
        favored.exec_count = 9;
        corpus.push(favored);
        for i in 0..6u64 {
            let mut seed = seed_with(8, &[]);
            seed.found_at = 10 + i;
            seed.exec_count = i % 2; // all survive the base removal rule
            corpus.push(seed);
        }
        let confirmed: AHashSet<Edge> = [Edge::new(0x1, 0x2)].into_iter().collect();
        corpus.cull(&confirmed, 3);
        assert_eq!(corpus.len(), 3);
        assert!(corpus.iter().any(|seed| seed.is_favored));
        assert!(
            corpus
                .iter()
                .filter(|seed| !seed.is_favored)
                .all(|seed| seed.exec_count == 0),
            "kept a high-exec expendable seed"
        );
    }

    #[test]
    fn calibration_marks_majority_edges_stable() {
        let mut seed = seed_with(8, &[]);
        let e1 = Edge::new(0x1, 0x2);
        let e2 = Edge::new(0x3, 0x4);
        let runs = vec![
            [e1, e2].into_iter().collect::<AHashSet<_>>(),
            [e1].into_iter().collect(),
            [e1].into_iter().collect(),
        ];
        let union = seed.apply_calibration(&runs);
        assert_eq!(union.len(), 2);
        assert!(seed.is_calibrated);
        assert!(seed.stable_edges.contains(&e1));
        assert!(!seed.stable_edges.contains(&e2));
        assert!((seed.stability - 0.5).abs() < f64::EPSILON);
        assert!(seed.covered_edges.contains(&e2));
    }

    #[test]
    fn even_run_calibration_requires_strict_majority() {
        let mut seed = seed_with(8, &[]);
        let edge = Edge::new(0x1, 0x2);
        let runs = vec![
            [edge].into_iter().collect::<AHashSet<_>>(),
            AHashSet::new(),
        ];
        seed.apply_calibration(&runs);
        // 1 of 2 runs is not strictly more than half.
        assert!(seed.stable_edges.is_empty());
    }
}
