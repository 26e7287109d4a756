//! Lockstep SIMD groups.
//!
//! Lanes of a SIMD group share one instruction stream: a lane that has finished its
//! work stays parked until every lane reaches the point where the group reconverges.
//! The usual spin lock, "loop until the compare-and-swap wins, then do the work", is
//! unsound under that model. The lane that wins waits for the losers to leave the loop
//! before it runs its critical section, and the losers never leave because the winner
//! never releases.
//!
//! [`LockstepGroup::execute`] instead runs a single loop for the whole group. Each round
//! every pending lane attempts the compare-and-swap once, the winners run their critical
//! sections and release, and the group ballots which lanes are done. Within a group the
//! number of rounds is at most the number of lanes that share a slot, since at least one
//! lane per contended slot wins each round. Slots held by other groups only delay a lane.

use crate::dispatch::{Atomics, FusedOp, step};
use crate::lock::SlotGuard;
use crate::split::SplitCell;
use crate::types::OperationRequest;
use core::fmt;

/// Bit `i` is lane `i`.
pub type LaneMask = u64;

/// Widest group a [`LaneMask`] can describe.
pub const MAX_GROUP_WIDTH: usize = 64;

/// Default SIMD width of the targeted devices.
pub const DEFAULT_GROUP_WIDTH: usize = 32;

/// Collects one predicate per lane into a mask.
#[inline]
pub fn ballot(predicates: &[bool]) -> LaneMask {
    predicates
        .iter()
        .enumerate()
        .fold(0, |mask, (lane, &p)| mask | (LaneMask::from(p) << lane))
}

/// Mask with the low `width` lanes set.
#[inline]
pub const fn full_mask(width: usize) -> LaneMask {
    if width >= MAX_GROUP_WIDTH {
        LaneMask::MAX
    } else {
        (1 << width) - 1
    }
}

/// Results of one lockstep group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockstepOutcome {
    results: [u64; MAX_GROUP_WIDTH],
    width: usize,
    succeeded: LaneMask,
    /// Number of ballot rounds the group needed.
    pub rounds: u32,
}

impl LockstepOutcome {
    fn new(width: usize) -> Self {
        Self {
            results: [0; MAX_GROUP_WIDTH],
            width,
            succeeded: 0,
            rounds: 0,
        }
    }

    /// The value each lane's operation yielded, indexed by lane.
    pub fn results(&self) -> &[u64] {
        &self.results[..self.width]
    }

    /// Lanes whose operation took effect. Only a compare-exchange whose expected value
    /// did not match leaves its lane clear.
    pub fn succeeded(&self) -> LaneMask {
        self.succeeded
    }

    /// The result of `lane` as `Err` when its compare-exchange failed.
    ///
    /// # Panics
    ///
    /// Panics if `lane` is not below the number of requests.
    pub fn lane(&self, lane: usize) -> Result<u64, u64> {
        let result = self.results()[lane];
        if self.succeeded & (1 << lane) != 0 {
            Ok(result)
        } else {
            Err(result)
        }
    }

    fn record(&mut self, lane: usize, op: &FusedOp, result: u64) {
        self.results[lane] = result;
        self.succeeded |= LaneMask::from(op.succeeded(result)) << lane;
    }
}

/// A group of lanes that execute in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockstepGroup {
    width: usize,
}

impl Default for LockstepGroup {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_WIDTH)
    }
}

impl LockstepGroup {
    /// # Panics
    ///
    /// Panics if `width` is zero or above [`MAX_GROUP_WIDTH`].
    pub const fn new(width: usize) -> Self {
        assert!(width > 0 && width <= MAX_GROUP_WIDTH, "group width out of range");
        Self { width }
    }

    pub const fn width(&self) -> usize {
        self.width
    }

    fn lanes<'r>(&self, requests: &'r [OperationRequest]) -> &'r [OperationRequest] {
        assert!(
            requests.len() <= self.width,
            "{} requests for a group of {} lanes",
            requests.len(),
            self.width
        );
        requests
    }

    /// Runs one request per lane. Lanes past `requests.len()` are inactive.
    ///
    /// # Safety
    ///
    /// Every request must satisfy the contract of [`Atomics::execute`].
    pub unsafe fn execute(
        &self,
        atomics: &Atomics<'_>,
        requests: &[OperationRequest],
    ) -> LockstepOutcome {
        let requests = self.lanes(requests);
        let active = full_mask(requests.len());
        let mut outcome = LockstepOutcome::new(requests.len());
        let mut done: LaneMask = 0;

        while done != active {
            outcome.rounds += 1;
            let mut won = [false; MAX_GROUP_WIDTH];
            let mut guards: [Option<SlotGuard<'_>>; MAX_GROUP_WIDTH] =
                [const { None }; MAX_GROUP_WIDTH];

            for (lane, request) in requests.iter().enumerate() {
                if done & (1 << lane) == 0 {
                    let lock = atomics.locks().lock_for(request.address);
                    guards[lane] = SlotGuard::try_acquire(lock);
                }
            }

            for (lane, request) in requests.iter().enumerate() {
                if let Some(guard) = &guards[lane] {
                    // SAFETY: guaranteed by the caller.
                    unsafe { run_lane(&mut outcome, lane, request, guard, atomics) };
                    won[lane] = true;
                }
            }

            // every winner releases before the group votes
            drop(guards);

            done |= ballot(&won[..requests.len()]);
        }

        outcome
    }

    /// Models the per-lane spin loop under lockstep execution: lanes that win keep their
    /// slot until every lane of the group has won. Gives up after `max_rounds`.
    ///
    /// Succeeds when the lanes hold pairwise distinct, uncontended slots and stalls as
    /// soon as two lanes share one. Meant for diagnosing kernels, not for running them.
    ///
    /// # Safety
    ///
    /// Every request must satisfy the contract of [`Atomics::execute`].
    pub unsafe fn execute_naive(
        &self,
        atomics: &Atomics<'_>,
        requests: &[OperationRequest],
        max_rounds: u32,
    ) -> Result<LockstepOutcome, LockstepStall> {
        let requests = self.lanes(requests);
        let active = full_mask(requests.len());
        let mut guards: [Option<SlotGuard<'_>>; MAX_GROUP_WIDTH] =
            [const { None }; MAX_GROUP_WIDTH];
        let mut acquired: LaneMask = 0;
        let mut rounds = 0;

        while acquired != active {
            if rounds == max_rounds {
                return Err(LockstepStall {
                    rounds,
                    acquired,
                    waiting: active & !acquired,
                });
            }
            rounds += 1;
            for (lane, request) in requests.iter().enumerate() {
                if acquired & (1 << lane) == 0 {
                    let lock = atomics.locks().lock_for(request.address);
                    guards[lane] = SlotGuard::try_acquire(lock);
                }
            }
            let mut held = [false; MAX_GROUP_WIDTH];
            for (lane, guard) in guards[..requests.len()].iter().enumerate() {
                held[lane] = guard.is_some();
            }
            acquired = ballot(&held[..requests.len()]);
        }

        let mut outcome = LockstepOutcome::new(requests.len());
        outcome.rounds = rounds;
        for (lane, request) in requests.iter().enumerate() {
            if let Some(guard) = &guards[lane] {
                // SAFETY: guaranteed by the caller.
                unsafe { run_lane(&mut outcome, lane, request, guard, atomics) };
            }
        }

        Ok(outcome)
    }
}

/// Runs the critical section of `lane` under `guard`.
///
/// # Safety
///
/// `request` must satisfy the contract of [`Atomics::execute`].
unsafe fn run_lane(
    outcome: &mut LockstepOutcome,
    lane: usize,
    request: &OperationRequest,
    guard: &SlotGuard<'_>,
    atomics: &Atomics<'_>,
) {
    let object = core::ptr::with_exposed_provenance_mut::<u64>(request.address);
    // SAFETY: forwarded to the caller.
    let cell = unsafe { SplitCell::from_ptr(object) };
    let op = FusedOp::lower(request);
    let result = step(cell, guard, &op, atomics.math());
    outcome.record(lane, &op, result);
}

/// A naive lockstep loop that made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockstepStall {
    pub rounds: u32,
    /// Lanes that won their slot and are parked at the reconvergence point.
    pub acquired: LaneMask,
    /// Lanes still spinning.
    pub waiting: LaneMask,
}

impl fmt::Display for LockstepStall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lockstep group stalled after {} rounds: lanes {:#x} hold their slots \
             while lanes {:#x} spin",
            self.rounds, self.acquired, self.waiting
        )
    }
}

impl core::error::Error for LockstepStall {}
