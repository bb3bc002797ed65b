//! Two-stage partitioned linear-scan register allocation.
//!
//! The input register pools are split along the ARM64 PCS: callee-saved
//! integer registers (x19..x28, x29 excluded as the frame pointer) versus
//! caller-saved, and d8..d15 versus the rest of the FP file. Three scratch
//! registers are always reserved out of the caller-saved integer pool for
//! exclusive use by the code generator and are never assigned to a variable.
//!
//! Stage 1 allocates the intervals that cross a call site, from the
//! callee-saved pool; whatever the callee-saved pool cannot hold spills.
//! Stage 2 adds the caller-saved registers to the free pools and allocates
//! the local-only intervals. Within both stages, active intervals are kept
//! sorted by end point; on exhaustion the active interval with the latest
//! end point is spilled if it ends after the new interval, otherwise the new
//! interval itself spills.

use crate::analysis::intervals::LiveInterval;
use crate::fx::FxHashMap;
use crate::isa::aarch64::regs::{
    is_callee_saved, scratch_candidates, Reg, RegClass, RESERVED_SCRATCH_COUNT,
};
use crate::result::{CompileError, CompileResult};

use log::{debug, trace};

/// Final allocation decisions for one function, keyed by variable name.
pub type AllocationMap = FxHashMap<String, LiveInterval>;

/// Allocate registers for `intervals` (sorted by start point).
///
/// `int_regs` and `float_regs` are the allocatable pools;
/// `validate` enables the quadratic cross-check over the final map.
pub fn allocate(
    intervals: &[LiveInterval],
    int_regs: &[Reg],
    float_regs: &[Reg],
    call_sites: &[u32],
    function: &str,
    validate: bool,
) -> CompileResult<AllocationMap> {
    debug!(
        "linear scan for {function}: {} intervals, {} call sites",
        intervals.len(),
        call_sites.len()
    );

    // Partition the integer pool and reserve scratch registers.
    let scratch_pool = scratch_candidates();
    let mut callee_saved_int = Vec::new();
    let mut caller_saved_int = Vec::new();
    let mut reserved_scratch = Vec::new();
    for &reg in int_regs {
        if is_callee_saved(reg) {
            callee_saved_int.push(reg);
        } else if scratch_pool.contains(&reg) && reserved_scratch.len() < RESERVED_SCRATCH_COUNT {
            reserved_scratch.push(reg);
        } else {
            caller_saved_int.push(reg);
        }
    }
    let mut callee_saved_fp = Vec::new();
    let mut caller_saved_fp = Vec::new();
    for &reg in float_regs {
        if is_callee_saved(reg) {
            callee_saved_fp.push(reg);
        } else {
            caller_saved_fp.push(reg);
        }
    }
    trace!(
        "pools: {} callee int, {} caller int, {} reserved scratch, {} callee fp, {} caller fp",
        callee_saved_int.len(),
        caller_saved_int.len(),
        reserved_scratch.len(),
        callee_saved_fp.len(),
        caller_saved_fp.len()
    );

    // Partition intervals by call-crossing behavior.
    let mut call_crossing: Vec<LiveInterval> = Vec::new();
    let mut local_only: Vec<LiveInterval> = Vec::new();
    for interval in intervals {
        if interval_crosses_call(interval, call_sites) {
            call_crossing.push(interval.clone());
        } else {
            local_only.push(interval.clone());
        }
    }
    call_crossing.sort_by_key(|i| i.start_point);
    local_only.sort_by_key(|i| i.start_point);

    let mut state = ScanState {
        active: Vec::new(),
        free_int: callee_saved_int,
        free_float: callee_saved_fp,
        allocations: AllocationMap::default(),
        function: function.to_string(),
    };

    // Stage 1: call-crossing intervals from the callee-saved pools.
    for interval in call_crossing {
        state.place(interval)?;
    }

    // Stage 2: local-only intervals with the caller-saved pools added.
    state.free_int.extend(caller_saved_int);
    state.free_float.extend(caller_saved_fp);
    for interval in local_only {
        state.place(interval)?;
    }

    if validate {
        validate_allocations(&state.allocations, function)?;
    }
    Ok(state.allocations)
}

struct ScanState {
    /// Active intervals, sorted by end point.
    active: Vec<LiveInterval>,
    free_int: Vec<Reg>,
    free_float: Vec<Reg>,
    allocations: AllocationMap,
    function: String,
}

impl ScanState {
    fn place(&mut self, mut interval: LiveInterval) -> CompileResult<()> {
        self.expire_old_intervals(interval.start_point);
        let is_float = interval.var_type.uses_fp_register();
        let pool = if is_float {
            &mut self.free_float
        } else {
            &mut self.free_int
        };
        if let Some(reg) = pool.pop() {
            interval.assigned_register = Some(reg);
            interval.is_spilled = false;
            trace!("  {} -> {}", interval.var_name, reg);
            self.allocations
                .insert(interval.var_name.clone(), interval.clone());
            self.active.push(interval);
            self.active.sort_by_key(|i| i.end_point);
        } else {
            self.spill_at_interval(interval)?;
        }
        Ok(())
    }

    fn expire_old_intervals(&mut self, current_point: i32) {
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].end_point >= current_point {
                i += 1;
                continue;
            }
            let expired = self.active.remove(i);
            let reg = expired
                .assigned_register
                .expect("active interval without a register");
            trace!("  expiring {}, freeing {}", expired.var_name, reg);
            // Return the register to the pool of its stored type, not the
            // pool the current interval wants.
            match reg.class() {
                RegClass::Int => self.free_int.push(reg),
                RegClass::Float => self.free_float.push(reg),
            }
        }
    }

    fn spill_at_interval(&mut self, mut interval: LiveInterval) -> CompileResult<()> {
        if self.active.is_empty() {
            // All registers taken yet nothing is active: the free pools and
            // the active list disagree, which is an allocator bug.
            debug_assert!(
                false,
                "no active intervals but all registers occupied for {}",
                interval.var_name
            );
            return Err(CompileError::AllocatorInvariant(format!(
                "no active intervals but all registers occupied while placing {} in {}",
                interval.var_name, self.function
            )));
        }

        let is_float = interval.var_type.uses_fp_register();
        // Latest-ending active interval of the same class.
        let mut best: Option<usize> = None;
        let mut latest_end = interval.end_point;
        for (i, candidate) in self.active.iter().enumerate() {
            if candidate.var_type.uses_fp_register() == is_float && candidate.end_point > latest_end {
                latest_end = candidate.end_point;
                best = Some(i);
            }
        }

        match best {
            Some(index) => {
                let mut victim = self.active.remove(index);
                trace!(
                    "  spilling {} (ends {}) to make room for {} (ends {})",
                    victim.var_name,
                    victim.end_point,
                    interval.var_name,
                    interval.end_point
                );
                interval.assigned_register = victim.assigned_register.take();
                interval.is_spilled = false;
                victim.is_spilled = true;
                if let Some(entry) = self.allocations.get_mut(&victim.var_name) {
                    entry.is_spilled = true;
                    entry.assigned_register = None;
                }
                self.allocations
                    .insert(interval.var_name.clone(), interval.clone());
                self.active.push(interval);
                self.active.sort_by_key(|i| i.end_point);
            }
            None => {
                trace!("  no candidate outlives {}; spilling it", interval.var_name);
                interval.is_spilled = true;
                interval.assigned_register = None;
                self.allocations
                    .insert(interval.var_name.clone(), interval.clone());
            }
        }
        Ok(())
    }
}

fn interval_crosses_call(interval: &LiveInterval, call_sites: &[u32]) -> bool {
    call_sites.iter().any(|&site| {
        let site = site as i32;
        site >= interval.start_point && site <= interval.end_point
    })
}

/// Quadratic cross-check over the final allocation map: no overlapping
/// intervals share a register, and every entry is in exactly one of the
/// register/spilled states.
fn validate_allocations(allocations: &AllocationMap, function: &str) -> CompileResult<()> {
    for (name, interval) in allocations {
        if interval.is_spilled && interval.assigned_register.is_some() {
            return Err(CompileError::AllocatorInvariant(format!(
                "{name} in {function} is spilled but retains a register"
            )));
        }
        if !interval.is_spilled && interval.assigned_register.is_none() {
            return Err(CompileError::AllocatorInvariant(format!(
                "{name} in {function} has neither a register nor a spill slot"
            )));
        }
    }
    let entries: Vec<&LiveInterval> = allocations.values().collect();
    for (i, a) in entries.iter().enumerate() {
        let Some(reg_a) = a.assigned_register else {
            continue;
        };
        for b in entries.iter().skip(i + 1) {
            let Some(reg_b) = b.assigned_register else {
                continue;
            };
            if reg_a == reg_b && a.overlaps(b) {
                return Err(CompileError::AllocatorInvariant(format!(
                    "register {reg_a} assigned to overlapping intervals {} and {} in {function}",
                    a.var_name, b.var_name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::regs::{allocatable_float_regs, allocatable_int_regs, xreg};
    use crate::types::VarType;

    fn interval(name: &str, start: i32, end: i32) -> LiveInterval {
        LiveInterval::new(name, start, end, VarType::INTEGER)
    }

    fn float_interval(name: &str, start: i32, end: i32) -> LiveInterval {
        LiveInterval::new(name, start, end, VarType::FLOAT)
    }

    fn run(intervals: &[LiveInterval], call_sites: &[u32]) -> AllocationMap {
        allocate(
            intervals,
            &allocatable_int_regs(),
            &allocatable_float_regs(),
            call_sites,
            "f",
            true,
        )
        .unwrap()
    }

    #[test]
    fn call_crossing_goes_callee_saved() {
        // x lives across the call at index 5.
        let allocations = run(&[interval("x", 0, 10)], &[5]);
        let x = &allocations["x"];
        assert!(!x.is_spilled);
        let reg = x.assigned_register.unwrap();
        assert!(is_callee_saved(reg), "expected callee-saved, got {reg}");
        assert!((19..=28).contains(&reg.hw_enc()));
    }

    #[test]
    fn local_only_prefers_caller_saved() {
        let allocations = run(&[interval("t", 0, 3)], &[]);
        let t = &allocations["t"];
        assert!(!t.is_spilled);
        assert!(!is_callee_saved(t.assigned_register.unwrap()));
    }

    #[test]
    fn scratch_registers_never_assigned() {
        // More intervals than the caller-saved pool minus scratch can hold.
        let intervals: Vec<LiveInterval> =
            (0..24).map(|i| interval(&format!("v{i}"), 0, 100)).collect();
        let allocations = run(&intervals, &[]);
        for entry in allocations.values() {
            if let Some(reg) = entry.assigned_register {
                assert!(
                    reg != xreg(9) && reg != xreg(10) && reg != xreg(11),
                    "scratch register {reg} assigned to {}",
                    entry.var_name
                );
            }
        }
    }

    #[test]
    fn overlapping_intervals_get_distinct_registers() {
        let intervals = vec![interval("a", 0, 10), interval("b", 2, 8), interval("c", 3, 6)];
        let allocations = run(&intervals, &[]);
        let regs: Vec<Reg> = allocations
            .values()
            .filter_map(|i| i.assigned_register)
            .collect();
        let mut dedup = regs.clone();
        dedup.dedup();
        assert_eq!(regs.len(), 3);
        let mut sorted = regs.iter().map(|r| r.hw_enc()).collect::<Vec<_>>();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn pressure_spills_the_longest_ending() {
        // 24 allocatable int regs (7 caller-saved - 3 scratch + 10 callee =
        // 14); overflow forces spills, and the victim should be an interval
        // that ends last.
        let mut intervals: Vec<LiveInterval> =
            (0..14).map(|i| interval(&format!("v{i}"), 0, 50)).collect();
        intervals.push(interval("long", 1, 1000));
        intervals.push(interval("short", 2, 5));
        intervals.sort_by_key(|i| i.start_point);
        let allocations = run(&intervals, &[]);
        // One of them must spill; the short interval must not be the victim
        // while "long" holds a register to the end.
        let spilled: Vec<&str> = allocations
            .values()
            .filter(|i| i.is_spilled)
            .map(|i| i.var_name.as_str())
            .collect();
        assert!(!spilled.is_empty());
        assert!(
            spilled.contains(&"long") || !allocations["short"].is_spilled,
            "spilled: {spilled:?}"
        );
    }

    #[test]
    fn float_and_int_pools_are_disjoint() {
        let intervals = vec![interval("i0", 0, 10), float_interval("f0", 0, 10)];
        let allocations = run(&intervals, &[]);
        assert_eq!(
            allocations["i0"].assigned_register.unwrap().class(),
            RegClass::Int
        );
        assert_eq!(
            allocations["f0"].assigned_register.unwrap().class(),
            RegClass::Float
        );
    }

    #[test]
    fn expired_registers_return_to_their_own_pool() {
        // Sequential non-overlapping intervals can share one register.
        let intervals = vec![interval("a", 0, 2), interval("b", 5, 7), interval("c", 10, 12)];
        let allocations = run(&intervals, &[]);
        assert!(allocations.values().all(|i| !i.is_spilled));
    }
}
