// SPDX-License-Identifier: GPL-2.0
//
// Sysfs PMU descriptions: numeric type, named bit-field formats, and named
// event templates, read from /sys/bus/event_source/devices/<pmu>/ and cached
// for the life of the process.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, OnceLock};

use anyhow::{bail, Context, Result};

use crate::events::EventAttr;
use crate::once_map::{OnceMap, SharedError};
use crate::parse::{parse_param_list, parse_uint, EventParam, ResolveError};

const DEFAULT_PMU_ROOT: &str = "/sys/bus/event_source/devices";

// Overridden by tests to point at a fake sysfs tree.
static PMU_ROOT_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

fn pmu_root() -> &'static Path {
    match PMU_ROOT_OVERRIDE.get() {
        Some(p) => p.as_path(),
        None => Path::new(DEFAULT_PMU_ROOT),
    }
}

#[cfg(test)]
pub(crate) fn set_pmu_root_for_tests(path: PathBuf) {
    let _ = PMU_ROOT_OVERRIDE.set(path);
    PMUS.clear();
}

/// Destination register of a bit-field format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatDest {
    Config,
    Config1,
    Config2,
    Period,
}

/// A named PMU format: where a parameter's bits land. A format names one
/// destination register and one or more bit ranges within it; a value is
/// scattered into the ranges low bits first, in the order the sysfs file
/// lists them.
#[derive(Debug, Clone)]
pub struct BitFormat {
    name: String,
    dest: FormatDest,
    ranges: Vec<(u32, u32)>, // (shift, n_bits)
}

impl BitFormat {
    fn all_bits(name: &str, dest: FormatDest) -> BitFormat {
        BitFormat {
            name: name.to_string(),
            dest,
            ranges: vec![(0, 64)],
        }
    }

    /// Scatter `val` into this format's ranges in `ev`. Bits already present
    /// in the destination ranges are cleared first; bits outside the ranges
    /// are preserved. Fails if `val` does not fit in the format's total
    /// width.
    pub(crate) fn set(&self, ev: &mut EventAttr, val: u64) -> Result<()> {
        let field = match self.dest {
            FormatDest::Config => &mut ev.config,
            FormatDest::Config1 => &mut ev.config1,
            FormatDest::Config2 => &mut ev.config2,
            FormatDest::Period => &mut ev.period,
        };
        let mut x = val;
        let mut total_bits = 0u32;
        for &(shift, n_bits) in &self.ranges {
            total_bits += n_bits;
            let mask = u64::MAX >> (64 - n_bits);
            *field &= !(mask << shift);
            *field |= (x & mask) << shift;
            x = if n_bits >= 64 { 0 } else { x >> n_bits };
        }
        if x != 0 {
            // The ranges didn't consume every set bit.
            let max = if total_bits >= 64 {
                u64::MAX
            } else {
                (1u64 << total_bits) - 1
            };
            bail!("parameter {}={} not in range 0-{}", self.name, val, max);
        }
        Ok(())
    }
}

/// A named event published by a PMU in sysfs: a parameter list to apply,
/// plus the optional scale/unit from the companion dotted files.
#[derive(Debug, Clone)]
struct PmuEventTemplate {
    params: Vec<EventParam>,
    scale: f64,
    unit: String,
}

/// Everything we know about one PMU. Immutable once constructed.
#[derive(Debug)]
pub struct PmuDesc {
    pub(crate) pmu_type: u32,
    formats: HashMap<String, BitFormat>,
    events: HashMap<String, PmuEventTemplate>,
}

impl PmuDesc {
    /// Returns the format for a parameter name on this PMU. The generic
    /// config/config1/config2/period destinations always resolve, whether or
    /// not the PMU lists them.
    pub(crate) fn get_format(&self, param: &str) -> Option<BitFormat> {
        match param {
            "config" => Some(BitFormat::all_bits("config", FormatDest::Config)),
            "config1" => Some(BitFormat::all_bits("config1", FormatDest::Config1)),
            "config2" => Some(BitFormat::all_bits("config2", FormatDest::Config2)),
            "period" => Some(BitFormat::all_bits("period", FormatDest::Period)),
            _ => self.formats.get(param).cloned(),
        }
    }

    /// Resolve a named sysfs event on this PMU into `out`: apply the
    /// template's parameters through their formats and take its scale/unit.
    pub(crate) fn resolve_event(&self, name: &str, out: &mut EventAttr) -> Result<(), ResolveError> {
        let Some(tmpl) = self.events.get(name) else {
            return Err(ResolveError::Unknown);
        };
        for param in &tmpl.params {
            let Some(f) = self.get_format(&param.name) else {
                return Err(ResolveError::Other(anyhow::anyhow!(
                    "unknown parameter {:?} in {} description",
                    param.name,
                    name
                )));
            };
            f.set(out, param.value)?;
        }
        out.scale = tmpl.scale;
        out.unit = tmpl.unit.clone();
        Ok(())
    }
}

static PMUS: LazyLock<OnceMap<String, Arc<PmuDesc>>> =
    LazyLock::new(|| OnceMap::new(|name| load_desc(name).map(Arc::new)));

/// Look up a PMU by sysfs name. Descriptions (and failures) are cached for
/// the life of the process.
pub(crate) fn pmu_desc(name: &str) -> Result<Arc<PmuDesc>, SharedError> {
    PMUS.get(&name.to_string())
}

fn load_desc(pmu: &str) -> Result<PmuDesc> {
    let dir = pmu_root().join(pmu);

    let type_str = match fs::read_to_string(dir.join("type")) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => bail!("unknown PMU {:?}", pmu),
        Err(e) => bail!("unknown PMU {:?}: {}", pmu, e),
    };
    let type_str = type_str.trim_end_matches('\n');
    let pmu_type = match parse_uint(type_str) {
        Some(v) if v <= u32::MAX as u64 => v as u32,
        _ => bail!("error parsing PMU {:?} type {:?}", pmu, type_str),
    };

    let mut formats = HashMap::new();
    for_each_file(&dir.join("format"), |name, data| {
        let format = parse_format(name, data)?;
        formats.insert(name.to_string(), format);
        Ok(())
    })?;

    // See Documentation/ABI/testing/sysfs-bus-event_source-devices-events.
    // Entries come back sorted, so a base event is always seen before its
    // dotted .scale/.unit companions.
    let mut events: HashMap<String, PmuEventTemplate> = HashMap::new();
    for_each_file(&dir.join("events"), |name, data| {
        let data = data.trim_end_matches('\n');
        if let Some(base) = name.strip_suffix(".scale") {
            if let Some(ev) = events.get_mut(base) {
                ev.scale = data
                    .parse::<f64>()
                    .with_context(|| format!("error parsing scale {:?}", data))?;
            }
        } else if let Some(base) = name.strip_suffix(".unit") {
            if let Some(ev) = events.get_mut(base) {
                ev.unit = data.to_string();
            }
        } else if name.contains('.') {
            // Some other special file. Ignore.
        } else {
            let params = parse_param_list(data)?;
            events.insert(
                name.to_string(),
                PmuEventTemplate {
                    params,
                    scale: 1.0,
                    unit: String::new(),
                },
            );
        }
        Ok(())
    })?;

    log::debug!(
        "loaded PMU {} (type {}): {} formats, {} events",
        pmu,
        pmu_type,
        formats.len(),
        events.len()
    );
    Ok(PmuDesc {
        pmu_type,
        formats,
        events,
    })
}

/// Calls `f(file_name, contents)` for every regular file directly under
/// `dir`, in sorted name order. A missing directory is treated as empty;
/// all the directories this runs on are optional.
fn for_each_file(dir: &Path, mut f: impl FnMut(&str, &str) -> Result<()>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => bail!("error reading {}: {}", dir.display(), e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("error reading {}", dir.display()))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
    }
    names.sort();
    for name in names {
        let path = dir.join(&name);
        let data =
            fs::read_to_string(&path).with_context(|| format!("error reading {}", path.display()))?;
        f(&name, &data).with_context(|| format!("from {}", path.display()))?;
    }
    Ok(())
}

/// Parse the content of /sys/bus/event_source/devices/*/format/<name>:
/// `<dest>:<ranges>` where ranges is a comma-separated list of `N` or `N-M`
/// (inclusive) bit positions.
fn parse_format(name: &str, data: &str) -> Result<BitFormat> {
    // See Documentation/ABI/testing/sysfs-bus-event_source-devices-format.
    // Perf assumes the ranges are in ascending order; we take them as
    // listed.
    let s = data.trim_end_matches('\n');
    let Some((field, ranges)) = s.split_once(':') else {
        bail!("error parsing format {:?}", s);
    };
    let dest = match field {
        "config" => FormatDest::Config,
        "config1" => FormatDest::Config1,
        "config2" => FormatDest::Config2,
        _ => bail!("error parsing format {:?}: unknown field {}", s, field),
    };
    let mut bits = Vec::new();
    for r in ranges.split(',') {
        let (lo, hi) = match r.split_once('-') {
            Some((lo, hi)) => (lo, Some(hi)),
            None => (r, None),
        };
        let shift: u32 = lo
            .parse()
            .with_context(|| format!("error parsing format {:?}", s))?;
        let n_bits = match hi {
            None => 1,
            Some(hi) => {
                let hi: u32 = hi
                    .parse()
                    .with_context(|| format!("error parsing format {:?}", s))?;
                if hi < shift {
                    bail!("error parsing format {:?}: empty range {}", s, r);
                }
                hi - shift + 1
            }
        };
        if shift + n_bits > 64 {
            bail!("error parsing format {:?}: range {} exceeds 64 bits", s, r);
        }
        bits.push((shift, n_bits));
    }
    Ok(BitFormat {
        name: name.to_string(),
        dest,
        ranges: bits,
    })
}
