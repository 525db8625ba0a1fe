use std::{
    collections::VecDeque,
    fmt, fs,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const PCS_FILE: &str = "coverage.txt";
pub const EDGES_FILE: &str = "coverage_edges.txt";
pub const EDGE_COUNTS_FILE: &str = "coverage_edge_counts.txt";

/// How many raw per-run PC traces are retained per command for external
/// graph tooling.
const RECENT_TRACES_KEPT: usize = 8;

/// Ordered pair of consecutive in-range sampled program counters within
/// one command execution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Edge {
    pub prev: u32,
    pub cur: u32,
}

impl Edge {
    pub fn new(prev: u32, cur: u32) -> Self {
        Self { prev, cur }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x},{:#x}", self.prev, self.cur)
    }
}

impl FromStr for Edge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prev, cur) = s
            .split_once(',')
            .ok_or_else(|| format!("malformed edge record: {s}"))?;
        Ok(Self {
            prev: parse_hex_u32(prev.trim())?,
            cur: parse_hex_u32(cur.trim())?,
        })
    }
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|err| format!("bad hex value {s}: {err}"))
}

/// AFL++-style logarithmic hit-count class. Monotone non-decreasing and
/// stable under any split of runs summing to the same total.
pub fn bucket(count: u64) -> u8 {
    match count {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 4,
        4..=7 => 8,
        8..=15 => 16,
        16..=31 => 32,
        32..=127 => 64,
        _ => 128,
    }
}

#[derive(Debug, Error)]
pub enum CoverageFileError {
    #[error("reading coverage file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("coverage file {} line {line}: {message}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Result of folding one run's edges into the global store.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Edges promoted from pending to confirmed by this run.
    pub promoted: Vec<Edge>,
    /// Confirmed edges whose cumulative hit count crossed into a new bucket.
    pub bucket_changes: u32,
}

impl Evaluation {
    pub fn is_interesting(&self) -> bool {
        !self.promoted.is_empty() || self.bucket_changes > 0
    }

    pub fn score(&self) -> usize {
        self.promoted.len() + self.bucket_changes as usize
    }
}

/// Per-command coverage slice.
#[derive(Debug, Default)]
pub struct CommandCoverage {
    pub edges: AHashSet<Edge>,
    pub pcs: AHashSet<u32>,
    pub recent_traces: VecDeque<Vec<u32>>,
}

/// Session-global coverage: the confirmed-edge set, the pending
/// confirmation filter, cumulative hit counts with their buckets, and the
/// lower-signal all-PCs set.
///
/// PC sampling is statistical: a single observation of an edge is often a
/// timing artifact. Edges therefore graduate to the confirmed set only
/// after `confirm_threshold` distinct runs observed them.
#[derive(Debug)]
pub struct CoverageStore {
    confirm_threshold: u32,
    confirmed: AHashSet<Edge>,
    pending: AHashMap<Edge, u32>,
    counts: AHashMap<Edge, u64>,
    buckets: AHashMap<Edge, u8>,
    pcs: AHashSet<u32>,
    per_command: AHashMap<String, CommandCoverage>,
}

impl CoverageStore {
    pub fn new(confirm_threshold: u32) -> Self {
        Self {
            confirm_threshold: confirm_threshold.max(1),
            confirmed: AHashSet::new(),
            pending: AHashMap::new(),
            counts: AHashMap::new(),
            buckets: AHashMap::new(),
            pcs: AHashSet::new(),
            per_command: AHashMap::new(),
        }
    }

    /// Folds one finished run into the store. Promotion and bucket updates
    /// happen here, on the main thread, strictly after the sampler joined.
    pub fn evaluate(
        &mut self,
        run_edges: &AHashSet<Edge>,
        run_counts: &AHashMap<Edge, u64>,
    ) -> Evaluation {
        let mut eval = Evaluation::default();

        for &edge in run_edges {
            if self.confirmed.contains(&edge) {
                continue;
            }
            let observations = self.pending.entry(edge).or_insert(0);
            *observations += 1;
            if *observations >= self.confirm_threshold {
                self.pending.remove(&edge);
                self.confirmed.insert(edge);
                eval.promoted.push(edge);
            }
        }

        // Hit counts accumulate for confirmed edges only. Letting pending
        // edges trigger bucket changes would reintroduce the timing-artifact
        // noise the confirmation filter removes.
        for (&edge, &count) in run_counts {
            if !self.confirmed.contains(&edge) {
                continue;
            }
            let total = self.counts.entry(edge).or_insert(0);
            *total += count;
            let new_bucket = bucket(*total);
            match self.buckets.insert(edge, new_bucket) {
                Some(old_bucket) if old_bucket != new_bucket => eval.bucket_changes += 1,
                // A freshly promoted edge gets its initial bucket; the
                // promotion itself already drives interestingness.
                _ => {}
            }
        }

        eval
    }

    /// Adds a run's in-range PCs to the session-wide PC set, returning how
    /// many were new.
    pub fn record_pcs(&mut self, run_pcs: &AHashSet<u32>) -> usize {
        let before = self.pcs.len();
        self.pcs.extend(run_pcs);
        self.pcs.len() - before
    }

    /// Updates the per-command slice with a finished run.
    pub fn record_command_run(
        &mut self,
        command: &str,
        run_edges: &AHashSet<Edge>,
        run_pcs: &AHashSet<u32>,
        raw_trace: &[u32],
    ) {
        let slice = self.per_command.entry(command.to_owned()).or_default();
        slice.edges.extend(run_edges);
        slice.pcs.extend(run_pcs);
        if slice.recent_traces.len() == RECENT_TRACES_KEPT {
            slice.recent_traces.pop_front();
        }
        slice.recent_traces.push_back(raw_trace.to_vec());
    }

    /// Inserts edges into the confirmed set directly, bypassing the
    /// confirmation filter. Used for calibration, where the seed set is
    /// curated.
    pub fn confirm_directly(&mut self, edges: impl IntoIterator<Item = Edge>) {
        for edge in edges {
            self.pending.remove(&edge);
            self.confirmed.insert(edge);
        }
    }

    pub fn contains(&self, edge: &Edge) -> bool {
        self.confirmed.contains(edge)
    }

    pub fn confirmed_edges(&self) -> &AHashSet<Edge> {
        &self.confirmed
    }

    /// Snapshot of the confirmed set for the sampler worker. The global set
    /// cannot change while a run is in flight, so a snapshot taken at
    /// `start()` is exact.
    pub fn confirmed_snapshot(&self) -> Arc<AHashSet<Edge>> {
        Arc::new(self.confirmed.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_observations(&self, edge: &Edge) -> Option<u32> {
        self.pending.get(edge).copied()
    }

    pub fn edge_count(&self, edge: &Edge) -> u64 {
        self.counts.get(edge).copied().unwrap_or(0)
    }

    pub fn edge_bucket(&self, edge: &Edge) -> u8 {
        self.buckets.get(edge).copied().unwrap_or(0)
    }

    pub fn pcs_len(&self) -> usize {
        self.pcs.len()
    }

    pub fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn command_slice(&self, command: &str) -> Option<&CommandCoverage> {
        self.per_command.get(command)
    }

    /// Writes the three coverage files under `dir`, one record per line,
    /// sorted for reproducible diffs.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let mut pcs_out = BufWriter::new(fs::File::create(dir.join(PCS_FILE))?);
        for pc in self.pcs.iter().sorted() {
            writeln!(pcs_out, "{pc:#x}")?;
        }
        pcs_out.flush()?;

        let mut edges_out = BufWriter::new(fs::File::create(dir.join(EDGES_FILE))?);
        for edge in self.confirmed.iter().sorted() {
            writeln!(edges_out, "{edge}")?;
        }
        edges_out.flush()?;

        let mut counts_out = BufWriter::new(fs::File::create(dir.join(EDGE_COUNTS_FILE))?);
        for (edge, count) in self.counts.iter().sorted_by_key(|(edge, _)| **edge) {
            writeln!(counts_out, "{edge},{count}")?;
        }
        counts_out.flush()?;

        info!(
            pcs = self.pcs.len(),
            edges = self.confirmed.len(),
            "coverage persisted"
        );
        Ok(())
    }

    /// Loads a prior session's coverage. `pcs_file` is the prior
    /// `coverage.txt`; the edge and edge-count files are read from the same
    /// directory. Buckets are recomputed from the loaded counts; the
    /// pending filter always starts empty.
    pub fn load(&mut self, pcs_file: &Path) -> Result<(), CoverageFileError> {
        let dir = pcs_file.parent().unwrap_or_else(|| Path::new("."));
        for (line_no, line) in read_lines(pcs_file)? {
            let pc = parse_hex_u32(line.trim()).map_err(|message| {
                CoverageFileError::Malformed {
                    path: pcs_file.to_owned(),
                    line: line_no,
                    message,
                }
            })?;
            self.pcs.insert(pc);
        }

        let edges_path = dir.join(EDGES_FILE);
        for (line_no, line) in read_lines(&edges_path)? {
            let edge: Edge = line.trim().parse().map_err(|message| {
                CoverageFileError::Malformed {
                    path: edges_path.clone(),
                    line: line_no,
                    message,
                }
            })?;
            self.confirmed.insert(edge);
        }

        let counts_path = dir.join(EDGE_COUNTS_FILE);
        for (line_no, line) in read_lines(&counts_path)? {
            let malformed = |message: String| CoverageFileError::Malformed {
                path: counts_path.clone(),
                line: line_no,
                message,
            };
            let (edge_part, count_part) = line
                .trim()
                .rsplit_once(',')
                .ok_or_else(|| malformed(format!("malformed count record: {line}")))?;
            let edge: Edge = edge_part.parse().map_err(&malformed)?;
            let count: u64 = count_part
                .trim()
                .parse()
                .map_err(|err| malformed(format!("bad count: {err}")))?;
            self.counts.insert(edge, count);
            self.buckets.insert(edge, bucket(count));
        }

        info!(
            pcs = self.pcs.len(),
            edges = self.confirmed.len(),
            from = %pcs_file.display(),
            "coverage resumed"
        );
        Ok(())
    }
}

fn read_lines(path: &Path) -> Result<impl Iterator<Item = (usize, String)>, CoverageFileError> {
    let file = fs::File::open(path).map_err(|source| CoverageFileError::Io {
        path: path.to_owned(),
        source,
    })?;
    let lines = BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| (idx + 1, line));
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_set(edges: &[(u32, u32)]) -> AHashSet<Edge> {
        edges.iter().map(|&(p, c)| Edge::new(p, c)).collect()
    }

    fn count_map(counts: &[(u32, u32, u64)]) -> AHashMap<Edge, u64> {
        counts
            .iter()
            .map(|&(p, c, n)| (Edge::new(p, c), n))
            .collect()
    }

    #[test]
    fn bucket_table_matches_hitcount_classes() {
        let expected = [
            (1, 1),
            (2, 2),
            (3, 4),
            (4, 8),
            (7, 8),
            (8, 16),
            (15, 16),
            (16, 32),
            (31, 32),
            (32, 64),
            (127, 64),
            (128, 128),
            (1_000_000, 128),
        ];
        for (count, class) in expected {
            assert_eq!(bucket(count), class, "count {count}");
        }
    }

    #[test]
    fn bucket_is_monotone() {
        let mut last = 0;
        for count in 0..4096u64 {
            let b = bucket(count);
            assert!(b >= last, "bucket regressed at count {count}");
            last = b;
        }
    }

    #[test]
    fn confirmation_filters_one_shot_edges() {
        let mut store = CoverageStore::new(2);

        // Run A observes two edges for the first time.
        let run_a = edge_set(&[(0x100, 0x104), (0x104, 0x108)]);
        let counts_a = count_map(&[(0x100, 0x104, 1), (0x104, 0x108, 1)]);
        let eval_a = store.evaluate(&run_a, &counts_a);
        assert!(!eval_a.is_interesting());
        assert_eq!(store.confirmed_len(), 0);
        assert_eq!(store.pending_len(), 2);

        // Run B reproduces only one of them.
        let run_b = edge_set(&[(0x100, 0x104)]);
        let counts_b = count_map(&[(0x100, 0x104, 1)]);
        let eval_b = store.evaluate(&run_b, &counts_b);
        assert!(eval_b.is_interesting());
        assert_eq!(eval_b.promoted, vec![Edge::new(0x100, 0x104)]);
        assert!(store.contains(&Edge::new(0x100, 0x104)));
        assert_eq!(store.pending_len(), 1);
        assert_eq!(store.pending_observations(&Edge::new(0x104, 0x108)), Some(1));
    }

    #[test]
    fn pending_and_confirmed_stay_disjoint() {
        let mut store = CoverageStore::new(3);
        let run = edge_set(&[(0x10, 0x14)]);
        let counts = count_map(&[(0x10, 0x14, 1)]);
        for _ in 0..5 {
            store.evaluate(&run, &counts);
            for edge in store.confirmed_edges() {
                assert!(store.pending_observations(edge).is_none());
            }
            if let Some(observations) = store.pending_observations(&Edge::new(0x10, 0x14)) {
                assert!(observations < 3);
            }
        }
        assert!(store.contains(&Edge::new(0x10, 0x14)));
    }

    #[test]
    fn bucket_change_drives_interestingness() {
        let mut store = CoverageStore::new(1);
        let edge = Edge::new(0x200, 0x204);
        let run = edge_set(&[(0x200, 0x204)]);
        let once = count_map(&[(0x200, 0x204, 1)]);

        // Run A: promotion, bucket 1.
        let eval = store.evaluate(&run, &once);
        assert!(eval.is_interesting());
        assert_eq!(store.edge_bucket(&edge), 1);

        // Run B: total 2, bucket 2.
        let eval = store.evaluate(&run, &once);
        assert!(eval.is_interesting());
        assert_eq!(eval.bucket_changes, 1);
        assert_eq!(store.edge_bucket(&edge), 2);

        // Run C: total 3, bucket 4.
        assert!(store.evaluate(&run, &once).is_interesting());
        assert_eq!(store.edge_bucket(&edge), 4);

        // Run D: total 4, bucket 8.
        assert!(store.evaluate(&run, &once).is_interesting());
        assert_eq!(store.edge_bucket(&edge), 8);

        // Run E: three more, total 7, still bucket 8.
        let three = count_map(&[(0x200, 0x204, 3)]);
        let eval = store.evaluate(&run, &three);
        assert!(!eval.is_interesting());
        assert_eq!(store.edge_count(&edge), 7);
        assert_eq!(store.edge_bucket(&edge), 8);
    }

    #[test]
    fn pending_edges_never_change_buckets() {
        let mut store = CoverageStore::new(3);
        let run = edge_set(&[(0x40, 0x44)]);
        let heavy = count_map(&[(0x40, 0x44, 100)]);
        let eval = store.evaluate(&run, &heavy);
        assert!(!eval.is_interesting());
        assert_eq!(store.edge_count(&Edge::new(0x40, 0x44)), 0);
    }

    #[test]
    fn immediate_promotion_with_threshold_one() {
        let mut store = CoverageStore::new(1);
        let run = edge_set(&[(0x1, 0x2), (0x2, 0x3)]);
        let counts = count_map(&[(0x1, 0x2, 1), (0x2, 0x3, 1)]);
        let eval = store.evaluate(&run, &counts);
        assert_eq!(eval.promoted.len(), 2);
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn re_evaluating_same_run_is_idempotent_for_promotion() {
        let mut store = CoverageStore::new(1);
        let run = edge_set(&[(0x8, 0xc)]);
        let empty_counts = AHashMap::new();
        let first = store.evaluate(&run, &empty_counts);
        assert_eq!(first.promoted.len(), 1);
        let second = store.evaluate(&run, &empty_counts);
        assert!(second.promoted.is_empty());
        assert_eq!(second.bucket_changes, 0);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = CoverageStore::new(1);
        let run = edge_set(&[(0x10, 0x14), (0x14, 0x18)]);
        let counts = count_map(&[(0x10, 0x14, 5), (0x14, 0x18, 3)]);
        store.evaluate(&run, &counts);
        let pcs: AHashSet<u32> = [0x10, 0x14, 0x18].into_iter().collect();
        store.record_pcs(&pcs);
        store.save(dir.path()).unwrap();

        let mut restored = CoverageStore::new(2);
        restored.load(&dir.path().join(PCS_FILE)).unwrap();
        assert_eq!(restored.confirmed_len(), 2);
        assert!(restored.contains(&Edge::new(0x10, 0x14)));
        assert!(restored.contains(&Edge::new(0x14, 0x18)));
        assert_eq!(restored.pcs_len(), 3);
        assert_eq!(restored.edge_count(&Edge::new(0x10, 0x14)), 5);
        assert_eq!(restored.edge_count(&Edge::new(0x14, 0x18)), 3);
        assert_eq!(restored.edge_bucket(&Edge::new(0x10, 0x14)), 8);
        assert_eq!(restored.pending_len(), 0);

        // A new edge in the resumed session goes through the filter.
        let novel = edge_set(&[(0x18, 0x1c)]);
        let novel_counts = count_map(&[(0x18, 0x1c, 1)]);
        let eval = restored.evaluate(&novel, &novel_counts);
        assert!(!eval.is_interesting());
        assert_eq!(restored.pending_observations(&Edge::new(0x18, 0x1c)), Some(1));
    }

    #[test]
    fn edge_display_round_trips() {
        let edge = Edge::new(0xdead_0000, 0xbeef_0004);
        let text = edge.to_string();
        assert_eq!(text, "0xdead0000,0xbeef0004");
        assert_eq!(text.parse::<Edge>().unwrap(), edge);
    }

    #[test]
    fn command_slice_keeps_bounded_trace_history() {
        let mut store = CoverageStore::new(1);
        let edges = edge_set(&[(0x1, 0x2)]);
        let pcs: AHashSet<u32> = [0x1, 0x2].into_iter().collect();
        for i in 0..20u32 {
            store.record_command_run("Identify", &edges, &pcs, &[i, i + 1]);
        }
        let slice = store.command_slice("Identify").unwrap();
        assert_eq!(slice.recent_traces.len(), RECENT_TRACES_KEPT);
        assert_eq!(slice.recent_traces.back().unwrap(), &vec![19, 20]);
    }
}
