// SPDX-License-Identifier: GPL-2.0
//
// Event specification parsing and resolution. Two surface forms:
//
//   pmu/param,param=value,.../   a PMU with an explicit parameter list
//   name                         a bare symbolic event
//
// Resolution consults, in order, the built-in symbolic tables, the PMU's
// sysfs event descriptions, and the extended perf-list index.

use anyhow::{anyhow, bail, Result};

use crate::builtin::resolve_builtin;
use crate::events::EventAttr;
use crate::perfjson;
use crate::pmu::{pmu_desc, PmuDesc};

/// One element of a parameter list. A lone key is assumed to have value 1
/// and may turn out to be an event name rather than a bit-field; that
/// ambiguity is settled once the PMU description is known.
#[derive(Debug, Clone)]
pub(crate) struct EventParam {
    pub name: String,
    pub value: u64,
    pub key_only: bool,
}

/// Outcome of one event resolver probing one name.
#[derive(Debug)]
pub(crate) enum ResolveError {
    /// The resolver doesn't know this name; try the next one.
    Unknown,
    /// The resolver knows the name but failed to use it.
    Other(anyhow::Error),
}

impl From<anyhow::Error> for ResolveError {
    fn from(e: anyhow::Error) -> ResolveError {
        ResolveError::Other(e)
    }
}

enum PmuParseError {
    /// Input doesn't have the pmu/.../ shape at all.
    NotPmuEvent,
    /// It does, but the parameter list is malformed.
    Malformed(anyhow::Error),
}

/// Parse and resolve an event specification into a kernel-ready attribute
/// record.
///
/// ```no_run
/// let ev = perfcount::parse_event("cpu/event=0xd0,umask=0x82,edge/")?;
/// # anyhow::Ok(())
/// ```
pub fn parse_event(spec: &str) -> Result<EventAttr> {
    match parse_pmu_event(spec) {
        Ok((pmu, params)) => resolve(spec, pmu, params),
        Err(PmuParseError::NotPmuEvent) => {
            // Try as a symbolic event.
            let params = vec![EventParam {
                name: spec.to_string(),
                value: 1,
                key_only: true,
            }];
            resolve(spec, "", params)
        }
        Err(PmuParseError::Malformed(e)) => Err(e),
    }
}

/// Parse the `pmu/k=v,.../` surface form.
fn parse_pmu_event(name: &str) -> Result<(&str, Vec<EventParam>), PmuParseError> {
    if !(name.matches('/').count() == 2 && !name.starts_with('/') && name.ends_with('/')) {
        return Err(PmuParseError::NotPmuEvent);
    }
    let (pmu, rest) = name.split_once('/').unwrap();
    let rest = rest.strip_suffix('/').unwrap();
    let params = parse_param_list(rest)
        .map_err(|e| PmuParseError::Malformed(anyhow!("event {:?}: {}", name, e)))?;
    Ok((pmu, params))
}

/// Used by the extended index to validate perf-list encodings, which must
/// themselves be PMU format events.
pub(crate) fn parse_pmu_event_str(name: &str) -> Result<(&str, Vec<EventParam>)> {
    match parse_pmu_event(name) {
        Ok(v) => Ok(v),
        Err(PmuParseError::NotPmuEvent) => Err(anyhow!("not a PMU format event")),
        Err(PmuParseError::Malformed(e)) => Err(e),
    }
}

/// Parse a comma-separated list of `k` and `k=v` entries. A lone `k` gets
/// value 1 and is marked as a potential event name: sysfs event syntax
/// allows this even inside event descriptions, so names and keys can only
/// be told apart by consulting the PMU.
pub(crate) fn parse_param_list(list: &str) -> Result<Vec<EventParam>> {
    let mut params = Vec::new();
    for s in list.split(',') {
        let (k, v) = match s.split_once('=') {
            None => (s, None),
            Some((k, vs)) => (k, Some(vs)),
        };
        if k.is_empty() {
            bail!(
                "error parsing event param list {:?}: missing parameter name in {:?}",
                list,
                s
            );
        }
        match v {
            None => params.push(EventParam {
                name: k.to_string(),
                value: 1,
                key_only: true,
            }),
            Some(vs) => {
                // The value can be decimal, hex, or octal.
                let Some(value) = parse_uint(vs) else {
                    bail!(
                        "error parsing event param list {:?}: parameter {:?} not a number",
                        list,
                        s
                    );
                };
                params.push(EventParam {
                    name: k.to_string(),
                    value,
                    key_only: false,
                });
            }
        }
    }
    Ok(params)
}

/// Auto-base unsigned parse: 0x/0X hex, leading 0 octal, else decimal.
pub(crate) fn parse_uint(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

type Resolver = fn(&PmuDesc, &str, &mut EventAttr) -> Result<(), ResolveError>;

// Probed in order for each name-like parameter.
const RESOLVERS: &[Resolver] = &[resolve_sysfs_event, perfjson::resolve_extended];

fn resolve_sysfs_event(desc: &PmuDesc, name: &str, out: &mut EventAttr) -> Result<(), ResolveError> {
    desc.resolve_event(name, out)
}

/// Resolve a parsed event. Symbolic events arrive with pmu == "" and a
/// single key-only param.
fn resolve(spec: &str, pmu: &str, params: Vec<EventParam>) -> Result<EventAttr> {
    let mut event = EventAttr::empty(spec);

    // Events with perf constants are baked in and don't necessarily appear
    // in sysfs (though sometimes they do). Perf prefers the built-in
    // encoding, but it also lets built-in events mix with dynamic-PMU
    // parameters, which produces malformed attributes; here the built-in
    // table only applies to a bare name, and a name with extra parameters
    // resolves through sysfs instead.
    if params.len() == 1 && params[0].key_only {
        if let Some((pmu_type, config)) = resolve_builtin(pmu, &params[0].name) {
            event.pmu_type = pmu_type;
            event.config = config;
            return Ok(event);
        }
    }

    // A symbolic event that gets this far implies the CPU PMU.
    let sym_event = pmu.is_empty();
    let pmu = if sym_event { "cpu" } else { pmu };

    // Check that the PMU exists and get its type.
    let desc = match pmu_desc(pmu) {
        Ok(desc) => desc,
        Err(e) => return Err(anyhow!("{:#}", e)),
    };
    event.pmu_type = desc.pmu_type;

    // First pass: classify each parameter as a PMU format or an event name.
    let mut event_name_index = None;
    'params: for (i, param) in params.iter().enumerate() {
        if desc.get_format(&param.name).is_some() {
            // Known format name. Filled in below.
            continue;
        }
        if param.key_only {
            for resolver in RESOLVERS {
                // A named event's parameters are overridden by explicit
                // parameters regardless of their order in the list, so the
                // resolver can fill in the record directly here.
                match resolver(&desc, &param.name, &mut event) {
                    Ok(()) => {
                        if let Some(first) = event_name_index {
                            let first: &EventParam = &params[first];
                            bail!(
                                "event {:?}: multiple events {:?} and {:?}",
                                spec,
                                first.name,
                                param.name
                            );
                        }
                        event_name_index = Some(i);
                        continue 'params;
                    }
                    Err(ResolveError::Unknown) => {}
                    Err(ResolveError::Other(e)) => {
                        return Err(anyhow!("event {:?}: {:#}", spec, e));
                    }
                }
            }
        }
        // Failed to resolve this parameter.
        if sym_event {
            bail!("unknown event {:?}", spec);
        }
        bail!("event {:?}: unknown event or parameter {:?}", spec, param.name);
    }

    // Second pass: apply the format parameters. Explicit parameters land
    // after any event template, so they win.
    for (i, param) in params.iter().enumerate() {
        if Some(i) == event_name_index {
            // Already resolved above.
            continue;
        }
        if let Some(f) = desc.get_format(&param.name) {
            if let Err(e) = f.set(&mut event, param.value) {
                return Err(anyhow!("event {:?}: {}", spec, e));
            }
        }
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmu::tests::test_init;
    use crate::sys::*;

    #[track_caller]
    fn check(name: &str, pmu_type: u32, config: u64) {
        check_full(name, pmu_type, config, 0, 0, 0);
    }

    #[track_caller]
    fn check_full(name: &str, pmu_type: u32, config: u64, config1: u64, config2: u64, period: u64) {
        test_init();
        let got = parse_event(name).unwrap_or_else(|e| panic!("{}: {}", name, e));
        // The display name carries the original spec through unchanged.
        assert_eq!(got.name(), name);
        assert_eq!(
            (got.pmu_type, got.config, got.config1, got.config2, got.period),
            (pmu_type, config, config1, config2, period),
            "{}",
            name
        );
    }

    #[track_caller]
    fn check_err(name: &str, want: &str) {
        test_init();
        let err = parse_event(name).unwrap_err();
        assert_eq!(err.to_string(), want, "{}", name);
    }

    #[test]
    fn test_builtin_events() {
        // Perf prefers the built-in event even if there's one in sysfs.
        check("cpu/cpu-cycles/", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);
        check("cpu-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);
        check("context-switches", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES);
        check(
            "l1d-load-misses",
            PERF_TYPE_HW_CACHE,
            PERF_COUNT_HW_CACHE_L1D | PERF_COUNT_HW_CACHE_OP_READ << 8
                | PERF_COUNT_HW_CACHE_RESULT_MISS << 16,
        );
    }

    #[test]
    fn test_sysfs_events() {
        // An event from sysfs.
        check("cpu/mem-stores/", PERF_TYPE_RAW, 0xd0 | 0x82 << 8);
        // Any CPU event can omit the PMU, even if it's not built-in.
        check("mem-stores", PERF_TYPE_RAW, 0xd0 | 0x82 << 8);
        // A template whose parameters scatter into more than one register.
        check_full("cpu/mem-loads/", PERF_TYPE_RAW, 0xcd | 0x1 << 8, 3, 0, 0);
    }

    #[test]
    fn test_parameters() {
        check("cpu/event=0xd0/", PERF_TYPE_RAW, 0xd0);
        check("cpu/event=42/", PERF_TYPE_RAW, 42);
        check("cpu/event=042/", PERF_TYPE_RAW, 0o42);
        check_full("cpu/event=0xd0,config1=0xd1,config2=0xd2/", PERF_TYPE_RAW, 0xd0, 0xd1, 0xd2, 0);
        check_full("cpu/config=0xd0,config1=0xd1,config2=0xd2/", PERF_TYPE_RAW, 0xd0, 0xd1, 0xd2, 0);
    }

    #[test]
    fn test_event_parameter_mix() {
        // Explicit parameters override the named event's template,
        // regardless of order.
        check("cpu/mem-stores,umask=42/", PERF_TYPE_RAW, 0xd0 | 42 << 8);
        check("cpu/umask=42,mem-stores/", PERF_TYPE_RAW, 0xd0 | 42 << 8);
        // A single bit field, with and without a value.
        check("cpu/edge=1/", PERF_TYPE_RAW, 1 << 18);
        check("cpu/edge/", PERF_TYPE_RAW, 1 << 18);
        check("cpu/mem-stores,edge/", PERF_TYPE_RAW, 0xd0 | 0x82 << 8 | 1 << 18);
        check("cpu/edge,mem-stores/", PERF_TYPE_RAW, 0xd0 | 0x82 << 8 | 1 << 18);
        // An event that's both built-in and in sysfs, mixed with a sysfs
        // parameter: the sysfs encoding wins, because mixing the static
        // HARDWARE type with dynamic-PMU bits would be nonsense.
        check("cpu/cpu-cycles,edge/", PERF_TYPE_RAW, 0x3c | 1 << 18);
    }

    #[test]
    fn test_extended_events() {
        check_full("l1d.replacement", PERF_TYPE_RAW, 0x51 | 0x1 << 8, 0, 0, 0x186a3);
        check_full("cpu/l1d.replacement/", PERF_TYPE_RAW, 0x51 | 0x1 << 8, 0, 0, 0x186a3);
    }

    #[test]
    fn test_extended_scale_unit() {
        test_init();
        // Aliases index the same record; ScaleUnit carries into the event.
        for name in ["mem_trans_retired.load_latency_gt_4", "mtr.llgt4"] {
            let ev = parse_event(name).unwrap();
            assert_eq!(ev.config, 0xcd | 0x1 << 8, "{}", name);
            assert_eq!(ev.period, 0x3e8, "{}", name);
            assert_eq!(ev.scale, 0.1, "{}", name);
            assert_eq!(ev.unit, "ns", "{}", name);
        }
    }

    #[test]
    fn test_sysfs_scale_unit() {
        test_init();
        let ev = parse_event("power/energy-pkg/").unwrap();
        assert_eq!(ev.pmu_type, 10);
        assert_eq!(ev.config, 0x02);
        assert_eq!(ev.scale, 2.3283064365386962890625e-10);
        assert_eq!(ev.unit, "Joules");
    }

    #[test]
    fn test_errors() {
        check_err("bad", r#"unknown event "bad""#);
        check_err("cpu/bad/", r#"event "cpu/bad/": unknown event or parameter "bad""#);
        check_err("bad/cpu-cycles/", r#"unknown PMU "bad""#);
        check_err(
            "cpu/event=0x1ff/",
            r#"event "cpu/event=0x1ff/": parameter event=511 not in range 0-255"#,
        );
        check_err("cpu/edge=2/", r#"event "cpu/edge=2/": parameter edge=2 not in range 0-1"#);
        check_err("cpu/bad=25/", r#"event "cpu/bad=25/": unknown event or parameter "bad""#);
        check_err(
            "cpu/cpu-cycles,mem-stores/",
            r#"event "cpu/cpu-cycles,mem-stores/": multiple events "cpu-cycles" and "mem-stores""#,
        );
        // Mixing a built-in event that isn't in sysfs with parameters from
        // sysfs would produce a mis-typed attribute; rejected.
        check_err("cpu/l1d,edge/", r#"event "cpu/l1d,edge/": unknown event or parameter "l1d""#);
        check_err("cpu/edge,l1d/", r#"event "cpu/edge,l1d/": unknown event or parameter "l1d""#);
        check_err(
            "cpu/event=abc/",
            r#"event "cpu/event=abc/": error parsing event param list "event=abc": parameter "event=abc" not a number"#,
        );
        check_err("cpu/one,two/", r#"event "cpu/one,two/": unknown event or parameter "one""#);
        check_err(
            "cpu/=1/",
            r#"event "cpu/=1/": error parsing event param list "=1": missing parameter name in "=1""#,
        );
    }

    #[test]
    fn test_parse_uint() {
        assert_eq!(parse_uint("42"), Some(42));
        assert_eq!(parse_uint("0xd0"), Some(0xd0));
        assert_eq!(parse_uint("0Xd0"), Some(0xd0));
        assert_eq!(parse_uint("042"), Some(0o42));
        assert_eq!(parse_uint("0"), Some(0));
        assert_eq!(parse_uint(""), None);
        assert_eq!(parse_uint("abc"), None);
        assert_eq!(parse_uint("08"), None);
    }

    #[test]
    fn test_resolution_is_pure() {
        test_init();
        let a = parse_event("cpu/mem-stores,edge/").unwrap();
        let b = parse_event("cpu/mem-stores,edge/").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_concurrent_resolution() {
        test_init();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let spec = if i % 2 == 0 { "cpu/mem-stores/" } else { "l1d.replacement" };
                    parse_event(spec).unwrap().config
                })
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            let want = if i % 2 == 0 { 0xd0 | 0x82 << 8 } else { 0x51 | 0x1 << 8 };
            assert_eq!(h.join().unwrap(), want);
        }
    }
}
