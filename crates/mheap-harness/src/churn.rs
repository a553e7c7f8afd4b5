//! Seeded random alloc/free churn against a large-object space.

use crate::error::HarnessError;
use mheap_core::os::PAGE_SIZE;
use mheap_core::space::free_list::FreeListSpace;
use mheap_core::space::large_object::LargeObjectSpace;
use mheap_core::space::map::LargeObjectMapSpace;
use mheap_core::{HeapLog, ObjRef, VerifyLevel};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ChurnSpace {
    Map,
    FreeList,
}

#[derive(Debug, Clone, Copy)]
pub struct ChurnConfig {
    pub space: ChurnSpace,
    pub ops: u64,
    pub seed: u64,
    /// Largest request, in pages.
    pub max_pages: usize,
    /// Free-list region size, in pages.
    pub capacity_pages: usize,
    /// Objects held at once.
    pub slots: usize,
}

impl ChurnConfig {
    #[must_use]
    pub fn new(space: ChurnSpace, ops: u64, seed: u64) -> Self {
        Self {
            space,
            ops,
            seed,
            max_pages: 8,
            capacity_pages: 256,
            slots: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChurnReport {
    pub space: ChurnSpace,
    pub seed: u64,
    pub ops: u64,
    pub allocations: u64,
    pub frees: u64,
    /// Requests the space could not satisfy.
    pub refused: u64,
    pub peak_bytes: u64,
    pub final_bytes: u64,
    pub final_objects: u64,
    /// Side-table audits run (free list only).
    pub invariant_checks: u64,
    /// Address-independent fingerprint of the operation sequence.
    pub sequence_sha256: String,
}

/// xorshift64*; deterministic per seed.
#[derive(Debug, Clone, Copy)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Parse a decimal or `0x` seed; underscores are ignored.
pub fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let cleaned: String = raw.trim().chars().filter(|&c| c != '_').collect();
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|_| HarnessError::InvalidSeed(raw.to_string()))
}

pub fn run_churn(config: &ChurnConfig) -> Result<ChurnReport, HarnessError> {
    let log = Arc::new(HeapLog::default());
    let space = match config.space {
        ChurnSpace::Map => LargeObjectSpace::Map(LargeObjectMapSpace::new("churn map space", log)),
        ChurnSpace::FreeList => LargeObjectSpace::FreeList(FreeListSpace::create(
            "churn free list",
            config.capacity_pages * PAGE_SIZE,
            VerifyLevel::Checked,
            log,
        )?),
    };

    let mut rng = XorShift64::new(config.seed);
    let mut slots: Vec<Option<ObjRef>> = vec![None; config.slots.max(1)];
    let mut sequence = Vec::with_capacity(config.ops as usize * 9);
    let mut report = ChurnReport {
        space: config.space,
        seed: config.seed,
        ops: config.ops,
        allocations: 0,
        frees: 0,
        refused: 0,
        peak_bytes: 0,
        final_bytes: 0,
        final_objects: 0,
        invariant_checks: 0,
        sequence_sha256: String::new(),
    };

    for _ in 0..config.ops {
        let idx = rng.gen_range_usize(0, slots.len() - 1);
        match slots[idx] {
            Some(obj) => {
                let bytes = space.free(obj);
                slots[idx] = None;
                report.frees += 1;
                sequence.push(b'f');
                sequence.extend_from_slice(&(bytes as u64).to_le_bytes());
            }
            None => {
                let bytes = rng.gen_range_usize(1, config.max_pages.max(1) * PAGE_SIZE);
                match space.alloc(bytes) {
                    Some(allocation) => {
                        slots[idx] = Some(allocation.obj);
                        report.allocations += 1;
                        sequence.push(b'a');
                        sequence.extend_from_slice(&(allocation.bytes_allocated as u64).to_le_bytes());
                    }
                    None => {
                        report.refused += 1;
                        sequence.push(b'r');
                        sequence.extend_from_slice(&(bytes as u64).to_le_bytes());
                    }
                }
            }
        }
        report.peak_bytes = report.peak_bytes.max(space.bytes_allocated());
        if let LargeObjectSpace::FreeList(free_list) = &space {
            free_list.verify_invariants()?;
            report.invariant_checks += 1;
        }
    }

    report.final_bytes = space.bytes_allocated();
    report.final_objects = space.objects_allocated();
    report.sequence_sha256 = crate::structured_log::sha256_hex(&sequence);
    let live: Vec<ObjRef> = slots.into_iter().flatten().collect();
    space.free_list(&live);
    Ok(report)
}
