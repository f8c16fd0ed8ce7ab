// SPDX-License-Identifier: GPL-2.0
//
// Extended event index: events that aren't advertised in sysfs but are
// published by `perf list -j`, which knows the CPU model's PMU database.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::{Command, ExitStatus};
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde::Deserialize;

use crate::events::EventAttr;
use crate::once_map::OnceMap;
use crate::parse::{parse_pmu_event_str, ResolveError};
use crate::pmu::PmuDesc;
use crate::sys;

/// One record of `perf list -j` output. The descriptive fields are decoded
/// but otherwise unused.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
#[allow(dead_code)]
struct PerfJsonEvent {
    #[serde(rename = "Unit")]
    unit: String,
    #[serde(rename = "Topic")]
    topic: String,
    #[serde(rename = "EventName")]
    event_name: String,
    #[serde(rename = "ScaleUnit")]
    scale_unit: String,
    #[serde(rename = "EventAlias")]
    event_alias: String,
    #[serde(rename = "EventType")]
    event_type: String,
    #[serde(rename = "BriefDescription")]
    brief_description: String,
    #[serde(rename = "PublicDescription")]
    public_description: String,
    #[serde(rename = "Encoding")]
    encoding: String,
}

type PerfListHook = fn(&mut Vec<u8>);

// Test seam: stands in for running the real perf binary.
static PERF_LIST_HOOK: Mutex<Option<PerfListHook>> = Mutex::new(None);

#[cfg(test)]
pub(crate) fn set_perf_list_hook_for_tests(hook: PerfListHook) {
    *PERF_LIST_HOOK.lock().unwrap() = Some(hook);
    PERF_LIST.clear();
}

// The enumeration runs at most once per process; failure is sticky.
static PERF_LIST: LazyLock<OnceMap<(), Arc<HashMap<String, PerfJsonEvent>>>> =
    LazyLock::new(|| OnceMap::new(|_| load_perf_list().map(Arc::new)));

fn load_perf_list() -> Result<HashMap<String, PerfJsonEvent>> {
    let hook = *PERF_LIST_HOOK.lock().unwrap();
    if let Some(hook) = hook {
        let mut out = Vec::new();
        hook(&mut out);
        return parse_perf_list(&out, &[], None);
    }
    match Command::new("perf").args(["list", "-j"]).output() {
        Ok(out) => parse_perf_list(&out.stdout, &out.stderr, Some(out.status)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            bail!("perf command not found; cannot enumerate extended events")
        }
        Err(e) => bail!("perf list -j failed: {}", e),
    }
}

fn parse_perf_list(
    data: &[u8],
    err_out: &[u8],
    status: Option<ExitStatus>,
) -> Result<HashMap<String, PerfJsonEvent>> {
    if let Some(status) = status {
        if !status.success() {
            let out = String::from_utf8_lossy(err_out);
            if out.contains("Error: unknown switch `j'") {
                // JSON output was added in linux-kernel commit
                // 6ed249441a7d3ead8e81cc926e68d5e7ae031032 (v6.2).
                bail!("perf version must be >= 6.2; cannot enumerate extended events");
            }
            if !out.trim().is_empty() {
                bail!("perf list -j failed:\n{}", out.trim());
            }
            bail!("perf list -j failed: {}", status);
        }
    }

    // There's a bug in perf (as of 6.5.13) where it may write errors to
    // stdout interleaved with the JSON. Strip those out.
    static PERF_ERR_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\}Error: .*").expect("static regex"));
    let data = String::from_utf8_lossy(data);
    let data = PERF_ERR_RE.replace_all(&data, "}");
    let list: Vec<PerfJsonEvent> = serde_json::from_str(&data)
        .map_err(|e| anyhow!("error decoding perf list -j output: {}", e))?;

    // Index by event name and alias.
    let mut m = HashMap::new();
    for ev in list {
        if !ev.event_alias.is_empty() {
            m.insert(ev.event_alias.clone(), ev.clone());
        }
        if !ev.event_name.is_empty() {
            m.insert(ev.event_name.clone(), ev);
        }
    }
    log::debug!("perf list -j enumerated {} extended events", m.len());
    Ok(m)
}

/// Event resolver backed by the perf-list index. Extended events only exist
/// under the CPU PMU, whose dynamic descriptions use the RAW type.
pub(crate) fn resolve_extended(
    pmu: &PmuDesc,
    event_name: &str,
    out: &mut EventAttr,
) -> Result<(), ResolveError> {
    if pmu.pmu_type != sys::PERF_TYPE_RAW {
        return Err(ResolveError::Unknown);
    }
    let list = match PERF_LIST.get(&()) {
        Ok(list) => list,
        Err(e) => return Err(ResolveError::Other(anyhow!("{:#}", e))),
    };
    let Some(ev) = list.get(event_name) else {
        return Err(ResolveError::Unknown);
    };
    // Some records (usually the built-in events) are published without an
    // encoding. There's nothing usable in them, so treat the name as
    // unknown here.
    if ev.encoding.is_empty() {
        return Err(ResolveError::Unknown);
    }
    apply_json_event(ev, pmu, out).map_err(ResolveError::from)
}

fn apply_json_event(ev: &PerfJsonEvent, pmu: &PmuDesc, out: &mut EventAttr) -> Result<()> {
    let (enc_pmu, params) = parse_pmu_event_str(&ev.encoding).map_err(|e| {
        anyhow!("unexpected encoding {:?} from perf list -j: {}", ev.encoding, e)
    })?;
    if enc_pmu != "cpu" {
        bail!(
            "unexpected encoding {:?} from perf list -j: expected PMU {:?}",
            ev.encoding,
            "cpu"
        );
    }

    if !ev.scale_unit.is_empty() {
        let (scale, unit) = parse_scale_unit(&ev.scale_unit).ok_or_else(|| {
            anyhow!("unexpected ScaleUnit {:?} from perf list -j", ev.scale_unit)
        })?;
        out.scale = scale;
        out.unit = unit;
    }

    // Resolve and set the parameters.
    for param in &params {
        let Some(f) = pmu.get_format(&param.name) else {
            bail!(
                "unknown parameter {:?} in encoding {:?} from perf list -j",
                param.name,
                ev.encoding
            );
        };
        f.set(out, param.value)?;
    }
    Ok(())
}

/// Split a ScaleUnit like "2.5e-10Joules" or "1e-1ns" into the factor and
/// the (possibly empty) unit label.
fn parse_scale_unit(s: &str) -> Option<(f64, String)> {
    static SCALE_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^([+-]?[0-9]*\.?[0-9]+(?:[eE][+-]?[0-9]+)?)(.*)$").expect("static regex")
    });
    let caps = SCALE_UNIT_RE.captures(s)?;
    let scale = caps[1].parse::<f64>().ok()?;
    Some((scale, caps[2].to_string()))
}
