// SPDX-License-Identifier: GPL-2.0

//! Linux performance counters (`perf_event_open`) for benchmarks and
//! application code, without shelling out to the `perf` tool at measurement
//! time.
//!
//! Event names use perf's syntax and are resolved against the same sources
//! perf uses: the built-in symbolic tables (`cpu-cycles`,
//! `l1d-load-misses`, ...), the sysfs PMU descriptions
//! (`cpu/mem-stores,edge/`, `cpu/event=0xd0,umask=0x82/`,
//! `power/energy-pkg/`), and the extended event database published by
//! `perf list -j` (`l1d.replacement`).
//!
//! ```no_run
//! use perfcount::{parse_event, Counter, Target};
//!
//! let event = parse_event("cpu-cycles")?;
//! let mut counter = Counter::open(Target::ThisThread, &[event])?;
//! counter.start();
//! // ... measured work ...
//! counter.stop();
//! let count = counter.read_one()?;
//! println!("{} cycles", count.value().0);
//! # anyhow::Ok(())
//! ```
//!
//! Counters opened with several events form a group that the kernel
//! schedules onto the hardware as a unit. [`BenchCounters`] layers a
//! benchmark-harness reporting convention on top.

mod bench;
mod builtin;
mod counter;
pub mod events;
mod once_map;
mod parse;
mod perfjson;
mod pmu;
mod sys;

pub use bench::{BenchCounters, Reporter};
pub use counter::{Count, Counter, Target};
pub use events::EventAttr;
pub use parse::parse_event;
