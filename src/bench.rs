// SPDX-License-Identifier: GPL-2.0
//
// Benchmark adapter: a fixed set of per-thread counters reported as
// per-iteration metrics at the end of a benchmark run.

use std::collections::HashSet;
use std::sync::{LazyLock, Mutex, Once};

use anyhow::{anyhow, Result};

use crate::counter::{Count, Counter, Target};
use crate::events::{self, EventAttr};
use crate::parse::parse_event;

/// The benchmark-harness seam. Mirrors the reporting surface a harness
/// exposes: a metric sink and a log line.
pub trait Reporter {
    /// Report a final metric, e.g. `(123.4, "cpu-cycles/op")`.
    fn report_metric(&mut self, value: f64, unit: &str);
    /// Report a non-fatal problem.
    fn log(&mut self, msg: &str);
}

fn default_events() -> Vec<EventAttr> {
    let mut defaults = vec![
        events::cpu_cycles(),
        events::instructions(),
        events::cache_misses(),
        events::cache_references(),
        events::branches(),
    ];
    // The legacy cache events have no fixed constructor; resolve them by
    // name.
    for name in ["l1d-loads", "l1d-load-misses"] {
        defaults.push(parse_event(name).expect("default events are built-in"));
    }
    defaults
}

fn metric_name(event: &EventAttr) -> String {
    if event.unit.is_empty() {
        event.name().to_string()
    } else {
        format!("{}-{}", event.name(), event.unit)
    }
}

// Each distinct open error is logged once per process, so a benchmark with
// thousands of iterations doesn't flood the log.
static OPEN_ERRORS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(Default::default);

fn print_units() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // Print unit metadata. Currently all events are better=lower.
        for event in default_events() {
            println!("Unit {}/op better=lower", metric_name(&event));
        }
        println!();
    });
}

struct BenchCounter {
    event: EventAttr,
    // None if the counter could not be opened; its metric is omitted.
    counter: Option<Counter>,
    name: String,
    baseline: Count,
}

impl BenchCounter {
    /// Current value relative to the last reset. +inf means the counter
    /// never ran over that window, so there is nothing to report.
    fn read(&mut self) -> Result<f64> {
        let Some(counter) = self.counter.as_mut() else {
            return Ok(f64::INFINITY);
        };
        let mut val = counter
            .read_one()
            .map_err(|e| anyhow!("error reading {}: {}", self.event, e))?;
        val.raw = val.raw.wrapping_sub(self.baseline.raw);
        val.time_enabled = val.time_enabled.wrapping_sub(self.baseline.time_enabled);
        val.time_running = val.time_running.wrapping_sub(self.baseline.time_running);
        if val.time_running == 0 {
            return Ok(f64::INFINITY);
        }
        Ok(val.value().0)
    }
}

/// A set of performance counters reported as benchmark metrics.
///
/// Counters only count events on the calling thread, and are running on
/// return from [`open`](BenchCounters::open). Call
/// [`finish`](BenchCounters::finish) when the measured work is done; each
/// counter is reported as `{value}/{iterations}` under `{name}/op`.
pub struct BenchCounters {
    iters: u64,
    counters: Vec<BenchCounter>,
}

impl BenchCounters {
    /// Opens and starts the default counter set for a benchmark of `iters`
    /// iterations. Counters that cannot be opened are logged (once per
    /// process per distinct error) and skipped.
    pub fn open(reporter: &mut impl Reporter, iters: u64) -> BenchCounters {
        print_units();
        let mut counters = Vec::new();
        for event in default_events() {
            let counter = match Counter::open(Target::ThisThread, std::slice::from_ref(&event)) {
                Ok(c) => Some(c),
                Err(e) => {
                    let msg = format!("error opening counter {}: {:#}", event, e);
                    if OPEN_ERRORS.lock().unwrap().insert(msg.clone()) {
                        log::warn!("{}", msg);
                        reporter.log(&msg);
                    }
                    None
                }
            };
            counters.push(BenchCounter {
                name: metric_name(&event),
                event,
                counter,
                baseline: Count::default(),
            });
        }

        let mut cs = BenchCounters {
            iters: iters.max(1),
            counters,
        };
        cs.start();
        cs
    }

    /// Start all counters. Pair with [`stop`](BenchCounters::stop) around
    /// untimed sections, like a harness's timer controls.
    pub fn start(&mut self) {
        for c in &mut self.counters {
            if let Some(counter) = c.counter.as_mut() {
                counter.start();
            }
        }
    }

    /// Stop all counters.
    pub fn stop(&mut self) {
        for c in &mut self.counters {
            if let Some(counter) = c.counter.as_mut() {
                counter.stop();
            }
        }
    }

    /// Zero the counters. The kernel can reset a counter's value but not
    /// its time accumulators, so this records a baseline and subtracts it
    /// from later readings instead.
    pub fn reset(&mut self) {
        for c in &mut self.counters {
            if let Some(counter) = c.counter.as_mut() {
                c.baseline = counter.read_one().unwrap_or_default();
            }
        }
    }

    /// The current total of the named counter (a metric name without the
    /// "/op"), or None if it is unknown or couldn't be read.
    pub fn total(&mut self, name: &str) -> Option<f64> {
        let c = self.counters.iter_mut().find(|c| c.name == name)?;
        c.read().ok()
    }

    /// Stop, report one metric per readable counter, and close everything.
    /// Dropping without calling this closes the counters but reports
    /// nothing.
    pub fn finish(mut self, reporter: &mut impl Reporter) {
        self.stop();
        let iters = self.iters as f64;
        for c in &mut self.counters {
            match c.read() {
                Err(e) => reporter.log(&e.to_string()),
                // A counter that never ran has no meaningful value; omit it.
                Ok(v) if v.is_infinite() => {}
                Ok(v) => reporter.report_metric(v / iters, &format!("{}/op", c.name)),
            }
            if let Some(counter) = c.counter.as_mut() {
                counter.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestReporter {
        metrics: HashMap<String, f64>,
        logs: Vec<String>,
    }

    impl Reporter for TestReporter {
        fn report_metric(&mut self, value: f64, unit: &str) {
            self.metrics.insert(unit.to_string(), value);
        }
        fn log(&mut self, msg: &str) {
            self.logs.push(msg.to_string());
        }
    }

    const LOOP_ITERS: u64 = 1000;

    fn work(n: u64) {
        let mut acc = 0u64;
        for i in 0..n {
            acc = acc.wrapping_add(std::hint::black_box(i));
        }
        std::hint::black_box(acc);
    }

    /// True if this environment can't open counters at all, in which case
    /// the adapter tests have nothing to measure.
    fn counters_unavailable() -> bool {
        Counter::open(Target::ThisThread, &[crate::events::cpu_cycles()]).is_err()
    }

    #[test]
    fn test_basic() {
        if counters_unavailable() {
            eprintln!("skipping: cannot open counters");
            return;
        }
        let mut tb = TestReporter::default();
        let cs = BenchCounters::open(&mut tb, 1);
        work(LOOP_ITERS);
        cs.finish(&mut tb);

        // A metric can be missing when its counter was never scheduled
        // (multiplexing) or failed to open, but the run as a whole must
        // produce something.
        assert!(!tb.metrics.is_empty(), "no metrics reported");
        for event in default_events() {
            let name = format!("{}/op", metric_name(&event));
            if let Some(&val) = tb.metrics.get(&name) {
                // Cache counters can legitimately read 0 over a loop this
                // small.
                if !name.starts_with("cache-") && !name.starts_with("l1d") {
                    assert!(val > 0.0, "metric {} reported, but value is 0", name);
                }
            }
        }
    }

    fn p95_of(iters: usize, mut f: impl FnMut() -> f64) -> f64 {
        let mut dist: Vec<f64> = (0..iters).map(|_| f()).collect();
        dist.sort_by(|a, b| a.total_cmp(b));
        dist[(iters as f64 * 95.0 / 100.0 + 0.5) as usize]
    }

    /// Measures instructions/op of the standard work loop, as a baseline
    /// for the stop/reset tests. None if the instructions counter is
    /// unavailable here.
    fn measure_loop() -> Option<f64> {
        let available = std::cell::Cell::new(true);
        let p95 = p95_of(100, || {
            let mut tb = TestReporter::default();
            let cs = BenchCounters::open(&mut tb, 1);
            work(LOOP_ITERS);
            cs.finish(&mut tb);
            match tb.metrics.get("instructions/op") {
                Some(&v) => v,
                None => {
                    available.set(false);
                    0.0
                }
            }
        });
        if !available.get() {
            return None;
        }
        // The loop executes at least one instruction per iteration.
        assert!(p95 >= LOOP_ITERS as f64, "failed to count loop instructions");
        Some(p95)
    }

    const SLACK: f64 = 1.5;

    #[test]
    fn test_stop() {
        let Some(limit) = measure_loop() else {
            eprintln!("skipping: cannot open counters");
            return;
        };

        // Occasionally we get unlucky (e.g. kernel preemption), so compare
        // percentiles rather than single runs.
        let p95 = p95_of(100, || {
            let mut tb = TestReporter::default();
            let mut cs = BenchCounters::open(&mut tb, 1);
            work(LOOP_ITERS);
            cs.stop();
            work(100 * LOOP_ITERS);
            cs.finish(&mut tb);
            tb.metrics.get("instructions/op").copied().unwrap_or(0.0)
        });
        assert!(
            p95 <= limit * SLACK,
            "stop didn't stop counter, got {} > {} instructions",
            p95,
            limit * SLACK
        );
    }

    #[test]
    fn test_reset_stopped() {
        if counters_unavailable() {
            eprintln!("skipping: cannot open counters");
            return;
        }
        let mut tb = TestReporter::default();
        let mut cs = BenchCounters::open(&mut tb, 1);
        cs.stop();
        cs.reset();
        work(LOOP_ITERS);
        cs.finish(&mut tb);

        // Nothing ran after the reset, so either the metric is omitted
        // (time_running == 0) or it reads zero.
        let val = tb.metrics.get("instructions/op").copied().unwrap_or(0.0);
        assert_eq!(val, 0.0, "reset didn't reset instructions to 0");
    }

    #[test]
    fn test_reset_running() {
        let Some(limit) = measure_loop() else {
            eprintln!("skipping: cannot open counters");
            return;
        };

        let p95 = p95_of(100, || {
            let mut tb = TestReporter::default();
            let mut cs = BenchCounters::open(&mut tb, 1);
            work(100 * LOOP_ITERS);
            cs.reset();
            work(LOOP_ITERS);
            cs.stop();
            cs.finish(&mut tb);
            tb.metrics.get("instructions/op").copied().unwrap_or(0.0)
        });
        assert!(
            p95 <= limit * SLACK,
            "reset didn't reset counter, got {} > {} instructions",
            p95,
            limit * SLACK
        );
    }

    #[test]
    fn test_total() {
        if counters_unavailable() {
            eprintln!("skipping: cannot open counters");
            return;
        }
        let mut tb = TestReporter::default();
        let mut cs = BenchCounters::open(&mut tb, 1);
        work(LOOP_ITERS);
        let total = cs.total("instructions").expect("instructions counter");
        assert!(total >= LOOP_ITERS as f64);
        assert_eq!(cs.total("nonsense"), None);
        cs.finish(&mut tb);
    }
}
