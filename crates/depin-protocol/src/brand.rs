//! BRAND: deterministic checker-to-worker assignment.
//!
//! Every checker and every worker evaluates the same pure function of
//! (worker license, period, checker population) and gets byte-identical
//! results, so no coordinator ever has to hand out assignments.

use std::collections::HashSet;

use crate::constants::BRAND_SLOTS;
use crate::error::ProtocolError;
use crate::hash::keccak256;
use crate::period::Period;

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
const MIX_1: u64 = 0xBF58_476D_1CE4_E5B9;
const MIX_2: u64 = 0x94D0_49BB_1331_11EB;

/// One splitmix64 mixing step.
pub fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(MIX_1);
    z = (z ^ (z >> 27)).wrapping_mul(MIX_2);
    z ^ (z >> 31)
}

/// Chained splitmix64: each output is the seed of the next step, matching
/// the draw order the program uses when crediting checkers.
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Iterator for SplitMix64 {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.state = splitmix64(self.state);
        Some(self.state)
    }
}

/// keccak256(identity || period_be)[..8] as a big-endian u64.
pub fn seed(identity: &[u8], period: Period) -> u64 {
    let mut input = Vec::with_capacity(identity.len() + 2);
    input.extend_from_slice(identity);
    input.extend_from_slice(&period.to_be_bytes());
    let digest = keccak256(&input);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Checker slots assigned to one worker for one period, in draw order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentSet {
    slots: Vec<u64>,
}

impl AssignmentSet {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, checker_index: u64) -> bool {
        self.slots.contains(&checker_index)
    }

    /// Bitmap position of `checker_index`, if assigned.
    pub fn position(&self, checker_index: u64) -> Option<usize> {
        self.slots.iter().position(|&s| s == checker_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.iter().copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.slots
    }
}

/// Compute the assignment set for `identity` in `period` over `population`
/// checkers. The result has exactly `min(512, population)` distinct members,
/// each in `[0, population)`.
pub fn assignment_set(
    identity: &[u8],
    period: Period,
    population: i64,
) -> Result<AssignmentSet, ProtocolError> {
    if population <= 0 {
        return Err(ProtocolError::InvalidPopulation(population));
    }
    let n = population as u64;
    let target = n.min(BRAND_SLOTS as u64) as usize;

    let mut seen = HashSet::with_capacity(target);
    let mut slots = Vec::with_capacity(target);
    for value in SplitMix64::new(seed(identity, period)) {
        if slots.len() == target {
            break;
        }
        let slot = value % n;
        if seen.insert(slot) {
            slots.push(slot);
        }
    }

    Ok(AssignmentSet { slots })
}

/// `checker_index ∈ assignment_set(identity, period, population)`.
pub fn is_eligible(
    checker_index: u64,
    identity: &[u8],
    period: Period,
    population: i64,
) -> Result<bool, ProtocolError> {
    Ok(assignment_set(identity, period, population)?.contains(checker_index))
}
