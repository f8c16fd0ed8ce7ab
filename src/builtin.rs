// SPDX-License-Identifier: GPL-2.0
//
// Built-in symbolic events: the names perf understands without consulting
// sysfs, backed by the static HARDWARE/SOFTWARE/HW_CACHE types.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::sys::*;

struct BuiltinTables {
    // Valid with no PMU or the cpu/ PMU.
    hardware: HashMap<&'static str, u64>,
    // Valid with no PMU only.
    software: HashMap<&'static str, u64>,

    // Legacy cache name fragments, longest name first so prefix matching
    // finds "L1-dcache" before "L1-d" would half-match.
    cache: Vec<(&'static str, u64)>,
    cache_op: Vec<(&'static str, u64)>,
    cache_result: Vec<(&'static str, u64)>,
    // Cache level -> bitmap of permitted cache ops.
    cache_allowed: HashMap<u64, u8>,
}

fn insert_names(map: &mut HashMap<&'static str, u64>, config: u64, names: &[&'static str]) {
    for name in names {
        map.insert(name, config);
    }
}

fn push_names(list: &mut Vec<(&'static str, u64)>, config: u64, names: &[&'static str]) {
    for name in names {
        list.push((name, config));
    }
}

static TABLES: LazyLock<BuiltinTables> = LazyLock::new(|| {
    // See tools/perf parse-events.c:event_symbols_hw
    let mut hardware = HashMap::new();
    insert_names(&mut hardware, PERF_COUNT_HW_CPU_CYCLES, &["cpu-cycles", "cycles"]);
    insert_names(&mut hardware, PERF_COUNT_HW_INSTRUCTIONS, &["instructions"]);
    insert_names(&mut hardware, PERF_COUNT_HW_CACHE_REFERENCES, &["cache-references"]);
    insert_names(&mut hardware, PERF_COUNT_HW_CACHE_MISSES, &["cache-misses"]);
    insert_names(
        &mut hardware,
        PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
        &["branch-instructions", "branches"],
    );
    insert_names(&mut hardware, PERF_COUNT_HW_BRANCH_MISSES, &["branch-misses"]);
    insert_names(&mut hardware, PERF_COUNT_HW_BUS_CYCLES, &["bus-cycles"]);
    insert_names(
        &mut hardware,
        PERF_COUNT_HW_STALLED_CYCLES_FRONTEND,
        &["stalled-cycles-frontend", "idle-cycles-frontend"],
    );
    insert_names(
        &mut hardware,
        PERF_COUNT_HW_STALLED_CYCLES_BACKEND,
        &["stalled-cycles-backend", "idle-cycles-backend"],
    );
    insert_names(&mut hardware, PERF_COUNT_HW_REF_CPU_CYCLES, &["ref-cycles"]);

    // See tools/perf parse-events.c:event_symbols_sw
    let mut software = HashMap::new();
    insert_names(&mut software, PERF_COUNT_SW_CPU_CLOCK, &["cpu-clock"]);
    insert_names(&mut software, PERF_COUNT_SW_TASK_CLOCK, &["task-clock"]);
    insert_names(&mut software, PERF_COUNT_SW_PAGE_FAULTS, &["page-faults", "faults"]);
    insert_names(
        &mut software,
        PERF_COUNT_SW_CONTEXT_SWITCHES,
        &["context-switches", "cs"],
    );
    insert_names(
        &mut software,
        PERF_COUNT_SW_CPU_MIGRATIONS,
        &["cpu-migrations", "migrations"],
    );
    insert_names(&mut software, PERF_COUNT_SW_PAGE_FAULTS_MIN, &["minor-faults"]);
    insert_names(&mut software, PERF_COUNT_SW_PAGE_FAULTS_MAJ, &["major-faults"]);
    insert_names(&mut software, PERF_COUNT_SW_ALIGNMENT_FAULTS, &["alignment-faults"]);
    insert_names(&mut software, PERF_COUNT_SW_EMULATION_FAULTS, &["emulation-faults"]);
    insert_names(&mut software, PERF_COUNT_SW_DUMMY, &["dummy"]);
    insert_names(&mut software, PERF_COUNT_SW_BPF_OUTPUT, &["bpf-output"]);
    insert_names(&mut software, PERF_COUNT_SW_CGROUP_SWITCHES, &["cgroup-switches"]);

    // See tools/perf evsel.c:evsel__hw_cache
    let mut cache = Vec::new();
    push_names(
        &mut cache,
        PERF_COUNT_HW_CACHE_L1D,
        &["L1-dcache", "l1-d", "l1d", "L1-data"],
    );
    push_names(
        &mut cache,
        PERF_COUNT_HW_CACHE_L1I,
        &["L1-icache", "l1-i", "l1i", "L1-instruction"],
    );
    push_names(&mut cache, PERF_COUNT_HW_CACHE_LL, &["LLC", "L2"]);
    push_names(&mut cache, PERF_COUNT_HW_CACHE_DTLB, &["dTLB", "d-tlb", "Data-TLB"]);
    push_names(&mut cache, PERF_COUNT_HW_CACHE_ITLB, &["iTLB", "i-tlb", "Instruction-TLB"]);
    push_names(
        &mut cache,
        PERF_COUNT_HW_CACHE_BPU,
        &["branch", "branches", "bpu", "btb", "bpc"],
    );
    push_names(&mut cache, PERF_COUNT_HW_CACHE_NODE, &["node"]);

    // See tools/perf evsel.c:evsel__hw_cache_op
    let mut cache_op = Vec::new();
    push_names(&mut cache_op, PERF_COUNT_HW_CACHE_OP_READ, &["load", "loads", "read"]);
    push_names(&mut cache_op, PERF_COUNT_HW_CACHE_OP_WRITE, &["store", "stores", "write"]);
    push_names(
        &mut cache_op,
        PERF_COUNT_HW_CACHE_OP_PREFETCH,
        &["prefetch", "prefetches", "speculative-read", "speculative-load"],
    );

    // See tools/perf evsel.c:evsel__hw_cache_result
    let mut cache_result = Vec::new();
    push_names(
        &mut cache_result,
        PERF_COUNT_HW_CACHE_RESULT_ACCESS,
        &["refs", "Reference", "ops", "access"],
    );
    push_names(&mut cache_result, PERF_COUNT_HW_CACHE_RESULT_MISS, &["misses", "miss"]);

    // Longer names first so prefix matching is unambiguous.
    for list in [&mut cache, &mut cache_op, &mut cache_result] {
        list.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    let r = 1u8 << PERF_COUNT_HW_CACHE_OP_READ;
    let w = 1u8 << PERF_COUNT_HW_CACHE_OP_WRITE;
    let p = 1u8 << PERF_COUNT_HW_CACHE_OP_PREFETCH;
    let cache_allowed = HashMap::from([
        (PERF_COUNT_HW_CACHE_L1D, r | w | p),
        (PERF_COUNT_HW_CACHE_L1I, r | p),
        (PERF_COUNT_HW_CACHE_LL, r | w | p),
        (PERF_COUNT_HW_CACHE_DTLB, r | w | p),
        (PERF_COUNT_HW_CACHE_ITLB, r),
        (PERF_COUNT_HW_CACHE_BPU, r),
        (PERF_COUNT_HW_CACHE_NODE, r | w | p),
    ]);

    BuiltinTables {
        hardware,
        software,
        cache,
        cache_op,
        cache_result,
        cache_allowed,
    }
});

/// Match `s` against a category table: either the whole string or a prefix
/// followed by `-`, returning the config bits and the unconsumed remainder.
fn find_cache<'a>(s: &'a str, names: &[(&'static str, u64)]) -> Option<(u64, &'a str)> {
    for &(name, config) in names {
        if s == name {
            return Some((config, ""));
        }
        if s.len() > name.len() && s.starts_with(name) && s.as_bytes()[name.len()] == b'-' {
            return Some((config, &s[name.len() + 1..]));
        }
    }
    None
}

/// Resolve a symbolic name against the built-in tables. Returns the
/// `(type, config)` pair, or None if the name is not a built-in event under
/// the given PMU.
pub fn resolve_builtin(pmu: &str, event_name: &str) -> Option<(u32, u64)> {
    // All builtin events are either under no PMU or under cpu/.
    if !(pmu.is_empty() || pmu == "cpu") {
        return None;
    }
    let t = &*TABLES;

    // CPU events can be used with or without a PMU name.
    if let Some(&config) = t.hardware.get(event_name) {
        return Some((PERF_TYPE_HARDWARE, config));
    }

    // Software events can only be used with no PMU name.
    if pmu.is_empty() {
        if let Some(&config) = t.software.get(event_name) {
            return Some((PERF_TYPE_SOFTWARE, config));
        }
    }

    // Legacy cache event: a level name, then up to two more `-`-separated
    // tokens giving the op and result in either order. See tools/perf
    // parse-events.l:PE_LEGACY_CACHE. Note that perf itself also accepts
    // nonsense like l1d-loads-stores because its lexer conflates op and
    // result; we do not.
    let (level, mut s) = find_cache(event_name, &t.cache)?;
    let mut op = PERF_COUNT_HW_CACHE_OP_READ;
    let mut result = PERF_COUNT_HW_CACHE_RESULT_ACCESS;
    let mut have_op = false;
    let mut have_result = false;
    for _ in 0..2 {
        if s.is_empty() {
            break;
        }
        if !have_op {
            if let Some((op2, s2)) = find_cache(s, &t.cache_op) {
                op = op2;
                s = s2;
                have_op = true;
                continue;
            }
        }
        if !have_result {
            if let Some((result2, s2)) = find_cache(s, &t.cache_result) {
                result = result2;
                s = s2;
                have_result = true;
                continue;
            }
        }
        break;
    }
    if !s.is_empty() {
        return None;
    }

    // Parsed the whole name. Check it's an allowed combination.
    if t.cache_allowed.get(&level).copied().unwrap_or(0) & (1 << op) == 0 {
        return None;
    }
    Some((PERF_TYPE_HW_CACHE, level | (op << 8) | (result << 16)))
}
