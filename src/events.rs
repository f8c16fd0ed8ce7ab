// SPDX-License-Identifier: GPL-2.0
//
// The resolved event attribute record and the well-known events that map
// straight to perf's static enums.

use std::fmt;

use crate::sys;
use crate::sys::PerfEventAttr;

/// A fully resolved performance event: everything needed to open a kernel
/// counter, plus the conversion factor applied when reading it.
///
/// Obtained from [`parse_event`](crate::parse_event) or one of the
/// well-known constructors below. Two events compare equal iff every field
/// matches, including the display name.
#[derive(Debug, Clone, PartialEq)]
pub struct EventAttr {
    /// Numeric PMU identifier: one of the static perf types for built-in
    /// events, or the dynamic type a sysfs PMU advertises.
    pub pmu_type: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
    /// Default sample period from the PMU event description. Zero for plain
    /// counting. Maps to the kernel's sample_period/sample_freq union; a
    /// nonzero value is always treated as a period here.
    pub period: u64,
    /// Multiplier applied to raw counter values at read time.
    pub scale: f64,
    /// Unit label for scaled values, e.g. "Joules". Empty for plain counts.
    pub unit: String,
    name: String,
}

impl EventAttr {
    pub(crate) fn basic(name: &str, pmu_type: u32, config: u64) -> EventAttr {
        EventAttr {
            pmu_type,
            config,
            config1: 0,
            config2: 0,
            period: 0,
            scale: 1.0,
            unit: String::new(),
            name: name.to_string(),
        }
    }

    pub(crate) fn empty(name: &str) -> EventAttr {
        EventAttr::basic(name, 0, 0)
    }

    /// The original event specification, as given to the parser.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn fill_attr(&self, attr: &mut PerfEventAttr) {
        attr.type_ = self.pmu_type;
        attr.config = self.config;
        attr.config1 = self.config1;
        attr.config2 = self.config2;
        attr.sample = self.period;
    }
}

impl fmt::Display for EventAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Hardware event: CPU cycles.
pub fn cpu_cycles() -> EventAttr {
    EventAttr::basic("cpu-cycles", sys::PERF_TYPE_HARDWARE, sys::PERF_COUNT_HW_CPU_CYCLES)
}

/// Hardware event: retired instructions.
pub fn instructions() -> EventAttr {
    EventAttr::basic(
        "instructions",
        sys::PERF_TYPE_HARDWARE,
        sys::PERF_COUNT_HW_INSTRUCTIONS,
    )
}

/// Hardware event: cache references.
pub fn cache_references() -> EventAttr {
    EventAttr::basic(
        "cache-references",
        sys::PERF_TYPE_HARDWARE,
        sys::PERF_COUNT_HW_CACHE_REFERENCES,
    )
}

/// Hardware event: cache misses.
pub fn cache_misses() -> EventAttr {
    EventAttr::basic(
        "cache-misses",
        sys::PERF_TYPE_HARDWARE,
        sys::PERF_COUNT_HW_CACHE_MISSES,
    )
}

/// Hardware event: retired branch instructions.
pub fn branches() -> EventAttr {
    EventAttr::basic(
        "branches",
        sys::PERF_TYPE_HARDWARE,
        sys::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_semantics() {
        let a = cpu_cycles();
        let b = cpu_cycles();
        assert_eq!(a, b);

        let mut c = cpu_cycles();
        c.config1 = 1;
        assert_ne!(a, c);
    }

    #[test]
    fn test_matches_symbolic_resolution() {
        // Each constructor produces exactly what resolving its name does.
        // These are all built-in events, so no sysfs is involved.
        for ev in [
            cpu_cycles(),
            instructions(),
            cache_references(),
            cache_misses(),
            branches(),
        ] {
            let parsed = crate::parse::parse_event(ev.name())
                .unwrap_or_else(|e| panic!("{}: {}", ev.name(), e));
            assert_eq!(parsed, ev, "{}", ev.name());
        }
    }

    #[test]
    fn test_fill_attr() {
        let mut ev = EventAttr::basic("x", 4, 0xd0);
        ev.config1 = 0xd1;
        ev.config2 = 0xd2;
        ev.period = 1000;

        let mut attr = PerfEventAttr::default();
        ev.fill_attr(&mut attr);
        assert_eq!(attr.type_, 4);
        assert_eq!(attr.config, 0xd0);
        assert_eq!(attr.config1, 0xd1);
        assert_eq!(attr.config2, 0xd2);
        assert_eq!(attr.sample, 1000);
    }
}
