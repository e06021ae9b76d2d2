// Writing the results of a run.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value as JSValue};

use crate::gap::{geo::GeoLookup, *};

pub const DEFAULT_RANKED_FILE: &str = "statistical_gap_analysis.json";
pub const DEFAULT_CRITICAL_FILE: &str = "top_critical_pincodes.csv";
pub const DEFAULT_SUMMARY_FILE: &str = "severity_summary.json";

const TOP_STATES: usize = 10;
const TOP_DISTRICTS: usize = 15;

pub fn ranked_to_json(ranked: &[ScoredPostalCode]) -> JSValue {
    JSValue::Array(
        ranked
            .iter()
            .map(|s| {
                json!({
                    "postal_code": s.postal_code.as_str(),
                    "aggregated_score": s.aggregated_score,
                    "z_score": s.z_score,
                    "severity": s.severity.name(),
                })
            })
            .collect(),
    )
}

/// The critical extract, with the district and the state when a lookup is
/// available.
pub fn critical_to_csv(
    entries: &[CriticalEntry],
    geo: Option<&GeoLookup>,
    path: &Path,
) -> GapResult<Vec<u8>> {
    let path_s = path.display().to_string();
    let mut wtr = csv::Writer::from_writer(vec![]);
    let header: Vec<&str> = match geo {
        Some(_) => vec!["pincode", "district", "state", "severity", "criticality_index"],
        None => vec!["pincode", "severity", "criticality_index"],
    };
    wtr.write_record(&header)
        .context(WritingCsvSnafu { path: &path_s })?;

    for e in entries.iter() {
        let criticality = format!("{:.2}", e.criticality_index);
        let record: Vec<&str> = match geo {
            Some(lookup) => {
                let (district, state) = match lookup.get(&e.postal_code) {
                    Some(g) => (g.district.as_str(), g.state.as_deref().unwrap_or("")),
                    None => ("", ""),
                };
                vec![
                    e.postal_code.as_str(),
                    district,
                    state,
                    e.severity.name(),
                    criticality.as_str(),
                ]
            }
            None => vec![e.postal_code.as_str(), e.severity.name(), criticality.as_str()],
        };
        wtr.write_record(&record)
            .context(WritingCsvSnafu { path: &path_s })?;
    }
    wtr.into_inner()
        .map_err(|e| e.into_error())
        .context(WritingOutputSnafu { path: &path_s })
}

/// Number of Extreme and Critical postal codes per state, largest first.
/// Postal codes without a known state are left out.
pub fn state_impact(ranked: &[ScoredPostalCode], geo: &GeoLookup, limit: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for s in ranked
        .iter()
        .filter(|s| matches!(s.severity, Severity::Extreme | Severity::Critical))
    {
        if let Some(state) = geo.get(&s.postal_code).and_then(|g| g.state.as_deref()) {
            *counts.entry(state).or_insert(0) += 1;
        }
    }
    let mut res: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(state, n)| (state.to_string(), n))
        .collect();
    res.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    res.truncate(limit);
    res
}

#[derive(PartialEq, Debug, Clone)]
pub struct DistrictVolume {
    pub district: String,
    pub state: Option<String>,
    pub cumulative_score: f64,
    pub mean_criticality: f64,
    pub postal_codes: usize,
}

/// Sum of the aggregated scores per district, largest first.
///
/// `critical` must hold the criticality of every ranked postal code, in the
/// same order.
pub fn district_gap_volume(
    ranked: &[ScoredPostalCode],
    critical: &[CriticalEntry],
    geo: &GeoLookup,
    limit: usize,
) -> Vec<DistrictVolume> {
    let mut acc: HashMap<(&str, Option<&str>), (f64, f64, usize)> = HashMap::new();
    for (s, c) in ranked.iter().zip(critical.iter()) {
        if let Some(g) = geo.get(&s.postal_code) {
            let e = acc
                .entry((g.district.as_str(), g.state.as_deref()))
                .or_insert((0.0, 0.0, 0));
            e.0 += s.aggregated_score;
            e.1 += c.criticality_index;
            e.2 += 1;
        }
    }
    let mut res: Vec<DistrictVolume> = acc
        .into_iter()
        .map(|((district, state), (score, crit, n))| DistrictVolume {
            district: district.to_string(),
            state: state.map(|s| s.to_string()),
            cumulative_score: score,
            mean_criticality: crit / n as f64,
            postal_codes: n,
        })
        .collect();
    res.sort_by(|a, b| {
        b.cumulative_score
            .partial_cmp(&a.cumulative_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.district.cmp(&b.district))
            .then_with(|| a.state.cmp(&b.state))
    });
    res.truncate(limit);
    res
}

pub fn summary_to_json(
    result: &SeverityResult,
    critical: &[CriticalEntry],
    geo: Option<&GeoLookup>,
) -> JSValue {
    let distribution: Vec<JSValue> = severity_distribution(&result.ranked)
        .iter()
        .map(|(sev, n)| json!({"severity": sev.name(), "count": n}))
        .collect();
    let sc = &result.stage_counts;
    let mut js = json!({
        "population": {
            "count": result.population.count,
            "mean": result.population.mean,
            "stddev": result.population.stddev,
        },
        "stage_counts": {
            "events": sc.events,
            "load_entries": sc.load_entries,
            "campaign_entries": sc.campaign_entries,
            "postal_codes": sc.postal_codes,
            "filtered_out": sc.filtered_out,
        },
        "severity_distribution": distribution,
    });

    if let Some(lookup) = geo {
        let states: Vec<JSValue> = state_impact(&result.ranked, lookup, TOP_STATES)
            .iter()
            .map(|(state, n)| json!({"state": state, "extreme_or_critical": n}))
            .collect();
        let districts: Vec<JSValue> =
            district_gap_volume(&result.ranked, critical, lookup, TOP_DISTRICTS)
                .iter()
                .map(|d| {
                    json!({
                        "district": d.district,
                        "state": d.state,
                        "cumulative_score": d.cumulative_score,
                        "mean_criticality": d.mean_criticality,
                        "postal_codes": d.postal_codes,
                    })
                })
                .collect();
        let unmatched = result
            .ranked
            .iter()
            .filter(|s| !lookup.contains_key(&s.postal_code))
            .count();
        js["state_impact"] = JSValue::Array(states);
        js["district_gap_volume"] = JSValue::Array(districts);
        js["postal_codes_without_location"] = json!(unmatched);
    }
    js
}

/// Writes every file to a temporary path next to its destination, then moves
/// them all in place. Nothing is moved when one of the writes fails.
pub fn write_outputs(outputs: &[(&Path, &[u8])]) -> GapResult<()> {
    let mut staged: Vec<(PathBuf, &Path)> = Vec::new();
    for (path, contents) in outputs.iter() {
        match stage_output(path, contents) {
            Ok(tmp) => staged.push((tmp, *path)),
            Err(e) => {
                for (tmp, _) in staged.iter() {
                    let _ = fs::remove_file(tmp);
                }
                return Err(e);
            }
        }
    }
    for (tmp, path) in staged.iter() {
        fs::rename(tmp, path).context(WritingOutputSnafu {
            path: path.display().to_string(),
        })?;
        debug!("write_outputs: {:?}", path);
    }
    Ok(())
}

// The parent directory is created if needed.
fn stage_output(path: &Path, contents: &[u8]) -> GapResult<PathBuf> {
    let path_s = path.display().to_string();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context(WritingOutputSnafu { path: &path_s })?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents).context(WritingOutputSnafu { path: &path_s })?;
    Ok(tmp_path)
}
