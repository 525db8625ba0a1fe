use std::sync::Arc;

use ahash::AHashSet;
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use tracing::debug;

use crate::{
    config::FuzzConfig,
    corpus::{CommandDwords, Corpus, Seed, SeedOverrides},
    nvme::{CommandClass, CommandTemplate},
};

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

pub const INTERESTING_16: [i16; 19] = [
    -128, -1, 0, 1, 16, 32, 64, 100, 127, // the 8-bit set
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];

pub const INTERESTING_32: [i32; 27] = [
    -128, -1, 0, 1, 16, 32, 64, 100, 127, // the 8-bit set
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767, // the 16-bit set
    -2147483648, -100663046, -32769, 32768, 65535, 65536, 100663045, 2147483647,
];

/// Maximum delta for the arithmetic havoc operators.
pub const ARITH_MAX: u32 = 35;

const ASCII_INT_EXTREMES: [i64; 8] = [
    0,
    1,
    -1,
    65_535,
    100_663_045,
    2_147_483_647,
    -2_147_483_648,
    4_294_967_295,
];

const BLOCK_FILL_VALUES: [u8; 4] = [0x00, 0xFF, 0x41, 0x20];

const SPLICE_PROB: f64 = 0.15;
const CDW_MUT_PROB: f64 = 0.3;
const LOG_PAGE_OVERSIZE_PROB: f64 = 0.15;

/// The sixteen havoc operators, in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HavocOp {
    BitFlip,
    Interesting8,
    Interesting16,
    Interesting32,
    Arith8,
    Arith16,
    Arith32,
    RandomByte,
    ByteSwap,
    Delete,
    Insert,
    Overwrite,
    Splice,
    Shuffle,
    BlockFill,
    AsciiInt,
}

impl HavocOp {
    pub const ALL: [HavocOp; 16] = [
        HavocOp::BitFlip,
        HavocOp::Interesting8,
        HavocOp::Interesting16,
        HavocOp::Interesting32,
        HavocOp::Arith8,
        HavocOp::Arith16,
        HavocOp::Arith32,
        HavocOp::RandomByte,
        HavocOp::ByteSwap,
        HavocOp::Delete,
        HavocOp::Insert,
        HavocOp::Overwrite,
        HavocOp::Splice,
        HavocOp::Shuffle,
        HavocOp::BlockFill,
        HavocOp::AsciiInt,
    ];

    pub fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|&op| op == self)
            .unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BitFlip => "bit_flip",
            Self::Interesting8 => "interesting8",
            Self::Interesting16 => "interesting16",
            Self::Interesting32 => "interesting32",
            Self::Arith8 => "arith8",
            Self::Arith16 => "arith16",
            Self::Arith32 => "arith32",
            Self::RandomByte => "random_byte",
            Self::ByteSwap => "byte_swap",
            Self::Delete => "delete",
            Self::Insert => "insert",
            Self::Overwrite => "overwrite",
            Self::Splice => "splice",
            Self::Shuffle => "shuffle",
            Self::BlockFill => "block_fill",
            Self::AsciiInt => "ascii_int",
        }
    }
}

/// Which mutations shaped one candidate input.
#[derive(Debug, Default, Clone, Copy)]
pub struct MutationRecord {
    /// Bitmask over `HavocOp::ALL` indices.
    pub ops_used: u16,
    pub spliced: bool,
    pub cdw_mutated: bool,
    pub opcode_override: bool,
    pub nsid_override: bool,
    pub class_swap: bool,
    pub datalen_override: bool,
}

/// One mutated candidate ready for dispatch.
#[derive(Debug, Clone)]
pub struct MutatedInput {
    pub payload: Vec<u8>,
    pub cdws: CommandDwords,
    pub overrides: SeedOverrides,
    pub record: MutationRecord,
}

/// The stacked havoc mutator with MOpt operator scheduling and the
/// structured NVMe-aware overrides.
#[derive(Debug)]
pub struct Mutator {
    max_input_len: usize,
    excluded_opcodes: Vec<u8>,
    opcode_mut_prob: f64,
    nsid_mut_prob: f64,
    admin_swap_prob: f64,
    datalen_mut_prob: f64,
    pub mopt: MoptScheduler,
}

impl Mutator {
    pub fn from_config(config: &FuzzConfig) -> Self {
        Self {
            max_input_len: config.max_input_len,
            excluded_opcodes: config.excluded_opcodes.clone(),
            opcode_mut_prob: config.opcode_mut_prob,
            nsid_mut_prob: config.nsid_mut_prob,
            admin_swap_prob: config.admin_swap_prob,
            datalen_mut_prob: config.datalen_mut_prob,
            mopt: MoptScheduler::new(
                config.mopt_enabled,
                config.mopt_pilot_period,
                config.mopt_core_period,
            ),
        }
    }

    pub fn mutate(
        &mut self,
        seed: &Seed,
        corpus: &Corpus,
        templates: &[Arc<CommandTemplate>],
        rng: &mut StdRng,
    ) -> MutatedInput {
        let mut record = MutationRecord::default();
        let mut payload = seed.payload.clone();

        // Splice before havoc: join two corpus payloads at a random point.
        if corpus.len() > 1 && rng.gen_bool(SPLICE_PROB) {
            if let Some(other) = pick_other_payload(corpus, seed.id, rng) {
                payload = splice_payloads(&payload, other, rng);
                record.spliced = true;
            }
        }

        let stack = 1usize << rng.gen_range(1..=7u32);
        for _ in 0..stack {
            let op = self.mopt.pick(rng);
            if apply_havoc(op, &mut payload, corpus, rng) {
                record.ops_used |= 1 << op.index();
            }
            payload.truncate(self.max_input_len);
        }

        let mut cdws = seed.cdws;
        if rng.gen_bool(CDW_MUT_PROB) {
            mutate_cdws(&mut cdws, rng);
            record.cdw_mutated = true;
        }

        let mut overrides = seed.overrides;
        self.mutate_overrides(seed, templates, &mut overrides, &mut cdws, &mut record, rng);

        debug_assert!(payload.len() <= self.max_input_len);
        MutatedInput {
            payload,
            cdws,
            overrides,
            record,
        }
    }

    fn mutate_overrides(
        &self,
        seed: &Seed,
        templates: &[Arc<CommandTemplate>],
        overrides: &mut SeedOverrides,
        cdws: &mut CommandDwords,
        record: &mut MutationRecord,
        rng: &mut StdRng,
    ) {
        let template = &seed.template;

        if rng.gen_bool(self.opcode_mut_prob) {
            let drawn = draw_opcode(template, templates, rng);
            // Excluded draws are discarded, not retried.
            if !self.excluded_opcodes.contains(&drawn) {
                overrides.opcode = Some(drawn);
                record.opcode_override = true;
            }
        }

        if rng.gen_bool(self.nsid_mut_prob) {
            overrides.nsid = Some(draw_nsid(rng));
            record.nsid_override = true;
        }

        if rng.gen_bool(self.admin_swap_prob) {
            overrides.force_admin = Some(template.class == CommandClass::Io);
            record.class_swap = true;
        }

        if rng.gen_bool(self.datalen_mut_prob) {
            overrides.data_len = Some(draw_data_len(rng));
            record.datalen_override = true;
        }

        // GetLogPage: oversize the NUMDL field and keep the transfer length
        // aligned with it.
        if template.name == "GetLogPage" && rng.gen_bool(LOG_PAGE_OVERSIZE_PROB) {
            let numdl: u32 = rng.gen_range(0x0400..=0xFFFF);
            cdws.set_cdw10((cdws.cdw10() & 0x0000_FFFF) | (numdl << 16));
            overrides.data_len = Some((numdl as usize + 1) * 4);
            record.datalen_override = true;
        }
    }
}

fn pick_other_payload<'c>(corpus: &'c Corpus, own_id: u64, rng: &mut StdRng) -> Option<&'c [u8]> {
    for _ in 0..4 {
        let index = rng.gen_range(0..corpus.len());
        if let Some(seed) = corpus.get(index) {
            if seed.id != own_id && !seed.payload.is_empty() {
                return Some(&seed.payload);
            }
        }
    }
    None
}

fn splice_payloads(a: &[u8], b: &[u8], rng: &mut StdRng) -> Vec<u8> {
    if a.is_empty() || b.is_empty() {
        return a.to_vec();
    }
    let split_a = rng.gen_range(0..=a.len());
    let split_b = rng.gen_range(0..b.len());
    let mut joined = Vec::with_capacity(split_a + b.len() - split_b);
    joined.extend_from_slice(&a[..split_a]);
    joined.extend_from_slice(&b[split_b..]);
    joined
}

/// Applies one havoc operator in place. Returns false when the payload is
/// too short for the operator.
fn apply_havoc(op: HavocOp, payload: &mut Vec<u8>, corpus: &Corpus, rng: &mut StdRng) -> bool {
    let len = payload.len();
    match op {
        HavocOp::BitFlip => {
            if len == 0 {
                return false;
            }
            let pos = rng.gen_range(0..len);
            payload[pos] ^= 1 << rng.gen_range(0..8u32);
        }
        HavocOp::Interesting8 => {
            if len == 0 {
                return false;
            }
            let pos = rng.gen_range(0..len);
            payload[pos] = INTERESTING_8[rng.gen_range(0..INTERESTING_8.len())] as u8;
        }
        HavocOp::Interesting16 => {
            if len < 2 {
                return false;
            }
            let pos = rng.gen_range(0..=len - 2);
            let value = INTERESTING_16[rng.gen_range(0..INTERESTING_16.len())] as u16;
            let bytes = endian_bytes16(value, rng);
            payload[pos..pos + 2].copy_from_slice(&bytes);
        }
        HavocOp::Interesting32 => {
            if len < 4 {
                return false;
            }
            let pos = rng.gen_range(0..=len - 4);
            let value = INTERESTING_32[rng.gen_range(0..INTERESTING_32.len())] as u32;
            let bytes = endian_bytes32(value, rng);
            payload[pos..pos + 4].copy_from_slice(&bytes);
        }
        HavocOp::Arith8 => {
            if len == 0 {
                return false;
            }
            let pos = rng.gen_range(0..len);
            let delta = rng.gen_range(1..=ARITH_MAX) as u8;
            payload[pos] = if rng.gen_bool(0.5) {
                payload[pos].wrapping_add(delta)
            } else {
                payload[pos].wrapping_sub(delta)
            };
        }
        HavocOp::Arith16 => {
            if len < 2 {
                return false;
            }
            let pos = rng.gen_range(0..=len - 2);
            let delta = rng.gen_range(1..=ARITH_MAX) as u16;
            let le = rng.gen_bool(0.5);
            let mut raw = [payload[pos], payload[pos + 1]];
            let value = if le {
                u16::from_le_bytes(raw)
            } else {
                u16::from_be_bytes(raw)
            };
            let value = if rng.gen_bool(0.5) {
                value.wrapping_add(delta)
            } else {
                value.wrapping_sub(delta)
            };
            raw = if le { value.to_le_bytes() } else { value.to_be_bytes() };
            payload[pos..pos + 2].copy_from_slice(&raw);
        }
        HavocOp::Arith32 => {
            if len < 4 {
                return false;
            }
            let pos = rng.gen_range(0..=len - 4);
            let delta = rng.gen_range(1..=ARITH_MAX);
            let le = rng.gen_bool(0.5);
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&payload[pos..pos + 4]);
            let value = if le {
                u32::from_le_bytes(raw)
            } else {
                u32::from_be_bytes(raw)
            };
            let value = if rng.gen_bool(0.5) {
                value.wrapping_add(delta)
            } else {
                value.wrapping_sub(delta)
            };
            let raw = if le { value.to_le_bytes() } else { value.to_be_bytes() };
            payload[pos..pos + 4].copy_from_slice(&raw);
        }
        HavocOp::RandomByte => {
            if len == 0 {
                return false;
            }
            let pos = rng.gen_range(0..len);
            payload[pos] = rng.r#gen();
        }
        HavocOp::ByteSwap => {
            if len < 2 {
                return false;
            }
            let a = rng.gen_range(0..len);
            let b = rng.gen_range(0..len);
            payload.swap(a, b);
        }
        HavocOp::Delete => {
            if len < 2 {
                return false;
            }
            let run = rng.gen_range(1..=(len / 4).max(1));
            let pos = rng.gen_range(0..=len - run);
            payload.drain(pos..pos + run);
        }
        HavocOp::Insert => {
            let run = rng.gen_range(1..=(len / 4).clamp(1, 128));
            let pos = rng.gen_range(0..=len);
            let chunk: Vec<u8> = if len > 0 && rng.gen_bool(0.75) {
                let src = rng.gen_range(0..len);
                let avail = (len - src).min(run);
                payload[src..src + avail].to_vec()
            } else {
                (0..run).map(|_| rng.r#gen()).collect()
            };
            payload.splice(pos..pos, chunk);
        }
        HavocOp::Overwrite => {
            if len < 2 {
                return false;
            }
            let run = rng.gen_range(1..=(len / 4).max(1));
            let pos = rng.gen_range(0..=len - run);
            if rng.gen_bool(0.5) {
                let src = rng.gen_range(0..=len - run);
                payload.copy_within(src..src + run, pos);
            } else {
                for byte in &mut payload[pos..pos + run] {
                    *byte = rng.r#gen();
                }
            }
        }
        HavocOp::Splice => {
            if len == 0 || corpus.len() < 2 {
                return false;
            }
            let index = rng.gen_range(0..corpus.len());
            let Some(other) = corpus.get(index).filter(|seed| !seed.payload.is_empty()) else {
                return false;
            };
            let span = rng.gen_range(1..=other.payload.len().min(len));
            let src = rng.gen_range(0..=other.payload.len() - span);
            let dst = rng.gen_range(0..=len - span);
            payload[dst..dst + span].copy_from_slice(&other.payload[src..src + span]);
        }
        HavocOp::Shuffle => {
            if len < 2 {
                return false;
            }
            let span = rng.gen_range(2..=len.min(8));
            let pos = rng.gen_range(0..=len - span);
            if rng.gen_bool(0.5) {
                payload[pos..pos + span].reverse();
            } else {
                payload[pos..pos + span].shuffle(rng);
            }
        }
        HavocOp::BlockFill => {
            if len == 0 {
                return false;
            }
            let run = rng.gen_range(1..=len.min(16));
            let pos = rng.gen_range(0..=len - run);
            let value = if rng.gen_bool(0.8) {
                BLOCK_FILL_VALUES[rng.gen_range(0..BLOCK_FILL_VALUES.len())]
            } else {
                rng.r#gen()
            };
            payload[pos..pos + run].fill(value);
        }
        HavocOp::AsciiInt => {
            if len == 0 {
                return false;
            }
            let value = ASCII_INT_EXTREMES[rng.gen_range(0..ASCII_INT_EXTREMES.len())];
            let digits = value.to_string().into_bytes();
            let span = digits.len().min(len);
            let pos = rng.gen_range(0..=len - span);
            payload[pos..pos + span].copy_from_slice(&digits[..span]);
        }
    }
    true
}

fn endian_bytes16(value: u16, rng: &mut StdRng) -> [u8; 2] {
    if rng.gen_bool(0.5) {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    }
}

fn endian_bytes32(value: u32, rng: &mut StdRng) -> [u8; 4] {
    if rng.gen_bool(0.5) {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    }
}

/// Mutates one to three command dword fields with one of six sub-ops.
fn mutate_cdws(cdws: &mut CommandDwords, rng: &mut StdRng) {
    let fields = rng.gen_range(1..=3);
    for _ in 0..fields {
        let value = &mut cdws.0[rng.gen_range(0..8)];
        match rng.gen_range(0..6) {
            0 => {
                for _ in 0..rng.gen_range(1..=4) {
                    *value ^= 1 << rng.gen_range(0..32u32);
                }
            }
            1 => {
                let delta = rng.gen_range(1..=ARITH_MAX);
                *value = if rng.gen_bool(0.5) {
                    value.wrapping_add(delta)
                } else {
                    value.wrapping_sub(delta)
                };
            }
            2 => *value = INTERESTING_32[rng.gen_range(0..INTERESTING_32.len())] as u32,
            3 => *value = rng.r#gen(),
            4 => {
                let lane = rng.gen_range(0..4u32);
                let byte = INTERESTING_8[rng.gen_range(0..INTERESTING_8.len())] as u8;
                *value = (*value & !(0xFFu32 << (8 * lane))) | (u32::from(byte) << (8 * lane));
            }
            _ => *value = value.rotate_left(16),
        }
    }
}

fn draw_opcode(
    template: &CommandTemplate,
    templates: &[Arc<CommandTemplate>],
    rng: &mut StdRng,
) -> u8 {
    match rng.gen_range(0..4) {
        // Vendor-specific range for the template's class.
        0 => match template.class {
            CommandClass::Admin => rng.gen_range(0xC0..=0xFF),
            CommandClass::Io => rng.gen_range(0x80..=0xFF),
        },
        1 => rng.r#gen(),
        2 => template.opcode ^ (1 << rng.gen_range(0..8u32)),
        _ => {
            if templates.is_empty() {
                rng.r#gen()
            } else {
                templates[rng.gen_range(0..templates.len())].opcode
            }
        }
    }
}

fn draw_nsid(rng: &mut StdRng) -> u32 {
    match rng.gen_range(0..6) {
        0 => 0,
        1 => 0xFFFF_FFFF,
        2 => 2,
        3 => 0xFFFF_FFFE,
        4 => rng.gen_range(1..=64),
        _ => rng.r#gen(),
    }
}

fn draw_data_len(rng: &mut StdRng) -> usize {
    const CHOICES: [usize; 7] = [0, 4, 64, 512, 4096, 8192, 65536];
    if rng.gen_bool(0.875) {
        CHOICES[rng.gen_range(0..CHOICES.len())]
    } else {
        rng.gen_range(1..=2 * 1024 * 1024)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoptMode {
    Pilot,
    Core,
}

/// MOpt-style operator scheduling: a uniform pilot phase gathers
/// per-operator find/use statistics, then a core phase samples operators
/// by their normalized find rate (with a floor so no operator starves),
/// then the statistics reset and the cycle repeats.
#[derive(Debug)]
pub struct MoptScheduler {
    enabled: bool,
    mode: MoptMode,
    pilot_period: u64,
    core_period: u64,
    runs_in_mode: u64,
    uses: [u64; 16],
    finds: [u64; 16],
    weights: [f64; 16],
}

const MOPT_WEIGHT_FLOOR: f64 = 0.01;

impl MoptScheduler {
    pub fn new(enabled: bool, pilot_period: u64, core_period: u64) -> Self {
        Self {
            enabled,
            mode: MoptMode::Pilot,
            pilot_period: pilot_period.max(1),
            core_period: core_period.max(1),
            runs_in_mode: 0,
            uses: [0; 16],
            finds: [0; 16],
            weights: [1.0 / 16.0; 16],
        }
    }

    pub fn pick(&mut self, rng: &mut StdRng) -> HavocOp {
        if !self.enabled || self.mode == MoptMode::Pilot {
            return HavocOp::ALL[rng.gen_range(0..HavocOp::ALL.len())];
        }
        let total: f64 = self.weights.iter().sum();
        let mut ticket = rng.gen_range(0.0..total);
        for (index, weight) in self.weights.iter().enumerate() {
            if ticket < *weight {
                return HavocOp::ALL[index];
            }
            ticket -= weight;
        }
        HavocOp::ALL[15]
    }

    /// Accounts one finished run: operators used at least once get a use,
    /// and a find when the run produced new coverage.
    pub fn record_run(&mut self, ops_used: u16, interesting: bool) {
        if !self.enabled {
            return;
        }
        for index in 0..16 {
            if ops_used & (1 << index) != 0 {
                self.uses[index] += 1;
                if interesting {
                    self.finds[index] += 1;
                }
            }
        }
        self.runs_in_mode += 1;
        match self.mode {
            MoptMode::Pilot if self.runs_in_mode >= self.pilot_period => {
                self.compute_weights();
                self.mode = MoptMode::Core;
                self.runs_in_mode = 0;
                debug!(weights = ?self.weights, "mopt: entering core mode");
            }
            MoptMode::Core if self.runs_in_mode >= self.core_period => {
                self.uses = [0; 16];
                self.finds = [0; 16];
                self.weights = [1.0 / 16.0; 16];
                self.mode = MoptMode::Pilot;
                self.runs_in_mode = 0;
                debug!("mopt: back to pilot mode");
            }
            _ => {}
        }
    }

    pub fn weight_of(&self, op: HavocOp) -> f64 {
        self.weights[op.index()]
    }

    pub fn finds(&self) -> &[u64; 16] {
        &self.finds
    }

    fn compute_weights(&mut self) {
        let ratios: Vec<f64> = (0..16)
            .map(|index| {
                if self.uses[index] == 0 {
                    0.0
                } else {
                    self.finds[index] as f64 / self.uses[index] as f64
                }
            })
            .collect();
        let sum: f64 = ratios.iter().sum();
        for (weight, ratio) in self.weights.iter_mut().zip(&ratios) {
            *weight = if sum > 0.0 {
                ratio / sum + MOPT_WEIGHT_FLOOR
            } else {
                1.0 / 16.0
            };
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DetStep {
    BitFlip(u32),
    ArithPlus(u32),
    ArithMinus(u32),
    Interesting(usize),
    ByteLane(usize),
}

/// Lazy deterministic walk over a seed's non-zero command dword fields:
/// walking bit flips, ±1..±`arith_max`, interesting-32 assignments, then
/// byte-lane interesting-8 assignments. One candidate per `next()` call;
/// values equal to the original or already emitted for the field are
/// skipped.
#[derive(Debug)]
pub struct DeterministicCursor {
    seed_id: u64,
    base: CommandDwords,
    fields: Vec<usize>,
    field_pos: usize,
    step: DetStep,
    arith_max: u32,
    emitted: AHashSet<u32>,
}

impl DeterministicCursor {
    pub fn new(seed: &Seed, arith_max: u32) -> Self {
        let fields = (0..8).filter(|&index| seed.cdws.0[index] != 0).collect();
        Self {
            seed_id: seed.id,
            base: seed.cdws,
            fields,
            field_pos: 0,
            step: DetStep::BitFlip(0),
            arith_max,
            emitted: AHashSet::new(),
        }
    }

    pub fn seed_id(&self) -> u64 {
        self.seed_id
    }

    /// The next `(field index, new value)` candidate, or None when the
    /// walk is exhausted.
    pub fn next_variant(&mut self) -> Option<(usize, u32)> {
        while self.field_pos < self.fields.len() {
            let field = self.fields[self.field_pos];
            let original = self.base.0[field];
            let candidate = self.value_for(original);
            self.advance();
            if candidate != original && self.emitted.insert(candidate) {
                return Some((field, candidate));
            }
        }
        None
    }

    /// The candidate dword set for one variant.
    pub fn dwords_with(&self, field: usize, value: u32) -> CommandDwords {
        let mut cdws = self.base;
        cdws.0[field] = value;
        cdws
    }

    fn value_for(&self, original: u32) -> u32 {
        match self.step {
            DetStep::BitFlip(bit) => original ^ (1 << bit),
            DetStep::ArithPlus(delta) => original.wrapping_add(delta),
            DetStep::ArithMinus(delta) => original.wrapping_sub(delta),
            DetStep::Interesting(index) => INTERESTING_32[index] as u32,
            DetStep::ByteLane(index) => {
                let lane = (index / INTERESTING_8.len()) as u32;
                let byte = INTERESTING_8[index % INTERESTING_8.len()] as u8;
                (original & !(0xFFu32 << (8 * lane))) | (u32::from(byte) << (8 * lane))
            }
        }
    }

    fn advance(&mut self) {
        self.step = match self.step {
            DetStep::BitFlip(bit) if bit + 1 < 32 => DetStep::BitFlip(bit + 1),
            DetStep::BitFlip(_) if self.arith_max > 0 => DetStep::ArithPlus(1),
            DetStep::BitFlip(_) => DetStep::Interesting(0),
            DetStep::ArithPlus(delta) if delta < self.arith_max => DetStep::ArithPlus(delta + 1),
            DetStep::ArithPlus(_) => DetStep::ArithMinus(1),
            DetStep::ArithMinus(delta) if delta < self.arith_max => DetStep::ArithMinus(delta + 1),
            DetStep::ArithMinus(_) => DetStep::Interesting(0),
            DetStep::Interesting(index) if index + 1 < INTERESTING_32.len() => {
                DetStep::Interesting(index + 1)
            }
            DetStep::Interesting(_) => DetStep::ByteLane(0),
            DetStep::ByteLane(index) if index + 1 < 4 * INTERESTING_8.len() => {
                DetStep::ByteLane(index + 1)
            }
            DetStep::ByteLane(_) => {
                self.field_pos += 1;
                self.emitted.clear();
                DetStep::BitFlip(0)
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::nvme::find_template;

    fn template(name: &str) -> Arc<CommandTemplate> {
        Arc::new(find_template(name).unwrap().clone())
    }

    fn test_seed(payload_len: usize) -> Seed {
        Seed::new(
            vec![0x5A; payload_len],
            template("Identify"),
            CommandDwords::default(),
        )
    }

    fn small_corpus() -> Corpus {
        let mut corpus = Corpus::new();
        corpus.push(test_seed(64));
        corpus.push(test_seed(32));
        corpus.push(test_seed(128));
        corpus
    }

    #[test]
    fn havoc_never_exceeds_max_input_len() {
        let config = FuzzConfig {
            max_input_len: 256,
            ..FuzzConfig::default()
        };
        let mut mutator = Mutator::from_config(&config);
        let corpus = small_corpus();
        let seed = test_seed(256);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let input = mutator.mutate(&seed, &corpus, &[], &mut rng);
            assert!(input.payload.len() <= 256, "len {}", input.payload.len());
        }
    }

    #[test]
    fn every_operator_applies_to_a_reasonable_payload() {
        let corpus = small_corpus();
        let mut rng = StdRng::seed_from_u64(1);
        for op in HavocOp::ALL {
            let mut payload = vec![0xA5u8; 64];
            assert!(
                apply_havoc(op, &mut payload, &corpus, &mut rng),
                "{} skipped on a 64-byte payload",
                op.name()
            );
        }
    }

    #[test]
    fn empty_payload_only_grows_through_insert() {
        let corpus = small_corpus();
        let mut rng = StdRng::seed_from_u64(2);
        for op in HavocOp::ALL {
            let mut payload: Vec<u8> = Vec::new();
            let applied = apply_havoc(op, &mut payload, &corpus, &mut rng);
            if op == HavocOp::Insert {
                assert!(applied);
                assert!(!payload.is_empty());
            } else {
                assert!(!applied, "{} applied to an empty payload", op.name());
            }
        }
    }

    #[test]
    fn excluded_opcode_draw_is_discarded_not_retried() {
        let config = FuzzConfig {
            opcode_mut_prob: 1.0,
            excluded_opcodes: (0x00..=0xFF).collect(),
            ..FuzzConfig::default()
        };
        let mut mutator = Mutator::from_config(&config);
        let corpus = small_corpus();
        let seed = test_seed(64);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let input = mutator.mutate(&seed, &corpus, &[], &mut rng);
            assert_eq!(input.overrides.opcode, None);
            assert!(!input.record.opcode_override);
        }
    }

    #[test]
    fn admin_swap_forces_the_opposite_class() {
        let config = FuzzConfig {
            admin_swap_prob: 1.0,
            ..FuzzConfig::default()
        };
        let mut mutator = Mutator::from_config(&config);
        let corpus = small_corpus();
        let mut rng = StdRng::seed_from_u64(4);

        let admin_seed = test_seed(16);
        let input = mutator.mutate(&admin_seed, &corpus, &[], &mut rng);
        assert_eq!(input.overrides.force_admin, Some(false));

        let io_seed = Seed::new(vec![0; 16], template("Read"), CommandDwords::default());
        let input = mutator.mutate(&io_seed, &corpus, &[], &mut rng);
        assert_eq!(input.overrides.force_admin, Some(true));
    }

    #[test]
    fn log_page_oversize_aligns_data_len_with_numdl() {
        let config = FuzzConfig::default();
        let mut mutator = Mutator::from_config(&config);
        let corpus = small_corpus();
        let seed = Seed::new(
            vec![0; 16],
            template("GetLogPage"),
            CommandDwords::default(),
        );
        let mut rng = StdRng::seed_from_u64(5);
        let mut seen_oversize = false;
        for _ in 0..200 {
            let input = mutator.mutate(&seed, &corpus, &[], &mut rng);
            let numdl = input.cdws.cdw10() >> 16;
            if numdl >= 0x0400 {
                if let Some(len) = input.overrides.data_len {
                    if len == (numdl as usize + 1) * 4 {
                        seen_oversize = true;
                    }
                }
            }
        }
        assert!(seen_oversize, "oversized NUMDL never drawn in 200 runs");
    }

    #[test]
    fn mopt_core_mode_prefers_finding_operators() {
        let mut mopt = MoptScheduler::new(true, 100, 1000);
        // Pilot phase: operator 0 always finds, the rest never do.
        for _ in 0..100 {
            mopt.record_run(0b01, true);
            // other ops used without finds share the same runs
        }
        assert_eq!(mopt.mode, MoptMode::Core);
        assert!(mopt.weight_of(HavocOp::BitFlip) > mopt.weight_of(HavocOp::AsciiInt));
        // The floor keeps every operator reachable.
        for op in HavocOp::ALL {
            assert!(mopt.weight_of(op) > 0.0);
        }

        let mut rng = StdRng::seed_from_u64(6);
        let mut bitflips = 0;
        for _ in 0..1000 {
            if mopt.pick(&mut rng) == HavocOp::BitFlip {
                bitflips += 1;
            }
        }
        assert!(bitflips > 500, "core mode picked bit_flip only {bitflips}x");
    }

    #[test]
    fn mopt_resets_after_core_period() {
        let mut mopt = MoptScheduler::new(true, 10, 20);
        for _ in 0..10 {
            mopt.record_run(0b1, true);
        }
        assert_eq!(mopt.mode, MoptMode::Core);
        for _ in 0..20 {
            mopt.record_run(0b1, false);
        }
        assert_eq!(mopt.mode, MoptMode::Pilot);
        assert_eq!(mopt.finds(), &[0; 16]);
    }

    #[test]
    fn deterministic_walk_starts_with_bit_flips_in_order() {
        let mut seed = test_seed(8);
        seed.cdws.set_cdw10(0x0000_0005);
        let mut cursor = DeterministicCursor::new(&seed, 10);

        let cdw10_index = 2;
        let mut variants = Vec::new();
        while let Some((field, value)) = cursor.next_variant() {
            assert_eq!(field, cdw10_index);
            variants.push(value);
        }

        // Walking flips of bits 0..3 first.
        assert_eq!(&variants[..4], &[0x4, 0x7, 0x1, 0xD]);
        // All 32 flips are unique, then the arithmetic stage begins at +1.
        assert_eq!(variants[32], 6);
        // +2 would be 7 = flip of bit 1: skipped as a duplicate.
        assert_eq!(variants.iter().filter(|&&value| value == 7).count(), 1);
        // No candidate repeats and none equals the original.
        let unique: AHashSet<u32> = variants.iter().copied().collect();
        assert_eq!(unique.len(), variants.len());
        assert!(!variants.contains(&5));
        // The interesting-32 assignments appear after the arithmetic stage.
        let pos_100663045 = variants
            .iter()
            .position(|&value| value == 100_663_045)
            .unwrap();
        assert!(pos_100663045 > 32);
        // Byte-lane assignments close the walk: lane 3 with -128 gives
        // 0x80000005.
        assert!(variants.contains(&0x8000_0005));
    }

    #[test]
    fn deterministic_walk_skips_zero_fields() {
        let seed = test_seed(8);
        let mut cursor = DeterministicCursor::new(&seed, 10);
        assert!(cursor.next_variant().is_none());
    }

    #[test]
    fn deterministic_walk_covers_every_nonzero_field() {
        let mut seed = test_seed(8);
        seed.cdws.set_cdw2(1);
        seed.cdws.set_cdw15(0xFFFF_FFFF);
        let mut cursor = DeterministicCursor::new(&seed, 4);
        let mut fields = AHashSet::new();
        while let Some((field, _)) = cursor.next_variant() {
            fields.insert(field);
        }
        assert_eq!(fields.len(), 2);
        assert!(fields.contains(&0));
        assert!(fields.contains(&7));
    }

    #[test]
    fn cdw_mutation_touches_at_most_three_fields() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..200 {
            let mut cdws = CommandDwords([7; 8]);
            mutate_cdws(&mut cdws, &mut rng);
            let touched = cdws.0.iter().filter(|&&value| value != 7).count();
            assert!(touched <= 3, "mutated {touched} fields");
        }
    }

    #[test]
    fn splice_joins_two_payloads() {
        let mut rng = StdRng::seed_from_u64(10);
        let a = vec![1u8; 10];
        let b = vec![2u8; 10];
        for _ in 0..50 {
            let joined = splice_payloads(&a, &b, &mut rng);
            assert!(!joined.is_empty());
            assert!(joined.len() <= 20);
            // Prefix from a, suffix from b.
            if let Some(first_two) = joined.iter().position(|&byte| byte == 2) {
                assert!(joined[first_two..].iter().all(|&byte| byte == 2));
            }
        }
    }
}
