use crate::gap::*;

use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputSettings {
    #[serde(rename = "outputDirectory")]
    pub output_directory: Option<String>,
    #[serde(rename = "rankedFileName")]
    pub ranked_file_name: Option<String>,
    #[serde(rename = "criticalFileName")]
    pub critical_file_name: Option<String>,
    #[serde(rename = "summaryFileName")]
    pub summary_file_name: Option<String>,
    #[serde(rename = "topN")]
    _top_n: Option<JSValue>,
    #[serde(rename = "geoLookupPath")]
    pub geo_lookup_path: Option<String>,
}

impl OutputSettings {
    pub fn top_n(&self) -> GapResult<Option<usize>> {
        self._top_n.as_ref().map(read_js_int).transpose()
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    pub category: String,
    pub directory: String,
    #[serde(rename = "postalCodeColumn")]
    pub postal_code_column: Option<String>,
    #[serde(rename = "monthColumn")]
    pub month_column: Option<String>,
}

impl FileSource {
    pub fn category(&self) -> GapResult<Category> {
        match Category::from_label(&self.category) {
            Some(c) => Ok(c),
            None => whatever!("unknown source category: {}", self.category),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct CategoryWeightsConfig {
    pub enrolment: Option<JSValue>,
    pub demographic: Option<JSValue>,
    pub biometric: Option<JSValue>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThresholdsConfig {
    pub extreme: Option<JSValue>,
    pub critical: Option<JSValue>,
    pub high: Option<JSValue>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScoringRules {
    pub preset: Option<String>,
    #[serde(rename = "categoryWeights")]
    pub category_weights: Option<CategoryWeightsConfig>,
    /// category label -> bracket label ("0-5", "5-17", "18+") -> weight
    #[serde(rename = "bucketWeights")]
    pub bucket_weights: Option<BTreeMap<String, BTreeMap<String, JSValue>>>,
    #[serde(rename = "supplyDenominator")]
    pub supply_denominator: Option<String>,
    #[serde(rename = "baselineCapacity")]
    pub baseline_capacity: Option<JSValue>,
    #[serde(rename = "campaignCoefficient")]
    pub campaign_coefficient: Option<JSValue>,
    #[serde(rename = "transactionDivisor")]
    pub transaction_divisor: Option<JSValue>,
    pub aggregation: Option<String>,
    #[serde(rename = "smoothingFactor")]
    pub smoothing_factor: Option<JSValue>,
    #[serde(rename = "calendarWeights")]
    pub calendar_weights: Option<Vec<JSValue>>,
    pub thresholds: Option<ThresholdsConfig>,
    #[serde(rename = "positiveZOnly")]
    pub positive_z_only: Option<bool>,
    #[serde(rename = "minMatchRate")]
    pub min_match_rate: Option<JSValue>,
}

impl ScoringRules {
    pub fn min_match_rate(&self) -> GapResult<f64> {
        let rate = read_js_float_opt(&self.min_match_rate)?
            .unwrap_or(ShapeResolver::DEFAULT_MATCH_RATE);
        if !(0.0..1.0).contains(&rate) {
            whatever!("minMatchRate must be in [0, 1): {}", rate)
        }
        Ok(rate)
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct GapConfig {
    #[serde(rename = "outputSettings", default)]
    pub output_settings: OutputSettings,
    #[serde(default)]
    pub sources: Vec<FileSource>,
    #[serde(default)]
    pub rules: ScoringRules,
}

pub fn read_config(path: &str) -> GapResult<GapConfig> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let config: GapConfig = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
    Ok(config)
}

pub fn read_reference(path: &str) -> GapResult<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
    Ok(js)
}

/// Starts from the preset and applies every key of the configuration on top.
pub fn validate_rules(cfg: &ScoringRules) -> GapResult<SeverityRules> {
    let mut rules = match cfg.preset.as_deref() {
        None | Some("default") => SeverityRules::DEFAULT_RULES,
        Some("legacy") => SeverityRules::LEGACY_RULES,
        Some(x) => whatever!("unknown rules preset: {}", x),
    };

    if let Some(cw) = &cfg.category_weights {
        if let Some(w) = read_js_float_opt(&cw.enrolment)? {
            rules.category_weights.enrolment = w;
        }
        if let Some(w) = read_js_float_opt(&cw.demographic)? {
            rules.category_weights.demographic = w;
        }
        if let Some(w) = read_js_float_opt(&cw.biometric)? {
            rules.category_weights.biometric = w;
        }
    }

    if let Some(bw) = &cfg.bucket_weights {
        for (category_label, brackets) in bw.iter() {
            let target: &mut BracketWeights = match Category::from_label(category_label) {
                Some(Category::Enrolment) => &mut rules.bucket_weights.enrolment,
                Some(Category::Demographic) => &mut rules.bucket_weights.demographic,
                Some(Category::Biometric) => &mut rules.bucket_weights.biometric,
                Some(Category::Campaign) => whatever!("campaigns have no bucket weights"),
                None => whatever!("unknown category in bucketWeights: {}", category_label),
            };
            for (bracket_label, value) in brackets.iter() {
                let w = read_js_float(value)?;
                match AgeBracket::from_label(bracket_label) {
                    Some(AgeBracket::Infant) => target.infant = w,
                    Some(AgeBracket::Child) => target.child = w,
                    Some(AgeBracket::Adult) => target.adult = w,
                    None => whatever!("unknown age bracket in bucketWeights: {}", bracket_label),
                }
            }
        }
    }

    rules.supply_denominator = supply_denominator(cfg, rules.supply_denominator)?;
    rules.aggregation = aggregation(cfg, rules.aggregation)?;

    if let Some(t) = &cfg.thresholds {
        if let Some(x) = read_js_float_opt(&t.extreme)? {
            rules.thresholds.extreme = x;
        }
        if let Some(x) = read_js_float_opt(&t.critical)? {
            rules.thresholds.critical = x;
        }
        if let Some(x) = read_js_float_opt(&t.high)? {
            rules.thresholds.high = x;
        }
    }

    if let Some(b) = cfg.positive_z_only {
        rules.positive_z_only = b;
    }
    Ok(rules)
}

fn supply_denominator(
    cfg: &ScoringRules,
    current: SupplyDenominator,
) -> GapResult<SupplyDenominator> {
    let baseline = read_js_float_opt(&cfg.baseline_capacity)?;
    let coefficient = read_js_float_opt(&cfg.campaign_coefficient)?;
    let divisor = read_js_float_opt(&cfg.transaction_divisor)?;
    let base = match cfg.supply_denominator.as_deref() {
        None => current,
        Some("campaignCapacity") => match current {
            d @ SupplyDenominator::CampaignCapacity { .. } => d,
            _ => SupplyDenominator::DEFAULT,
        },
        Some("transactionVolume") => match current {
            d @ SupplyDenominator::TransactionVolume { .. } => d,
            _ => SupplyDenominator::LEGACY,
        },
        Some(x) => whatever!("unknown supply denominator: {}", x),
    };
    Ok(match base {
        SupplyDenominator::CampaignCapacity {
            baseline: b,
            coefficient: c,
        } => SupplyDenominator::CampaignCapacity {
            baseline: baseline.unwrap_or(b),
            coefficient: coefficient.unwrap_or(c),
        },
        SupplyDenominator::TransactionVolume {
            baseline: b,
            divisor: d,
        } => SupplyDenominator::TransactionVolume {
            baseline: baseline.unwrap_or(b),
            divisor: divisor.unwrap_or(d),
        },
    })
}

fn aggregation(cfg: &ScoringRules, current: TemporalAggregation) -> GapResult<TemporalAggregation> {
    let alpha = read_js_float_opt(&cfg.smoothing_factor)?;
    let calendar: Option<[f64; 12]> = match &cfg.calendar_weights {
        Some(ws) => {
            let values = ws.iter().map(read_js_float).collect::<GapResult<Vec<f64>>>()?;
            match <[f64; 12]>::try_from(values) {
                Ok(arr) => Some(arr),
                Err(v) => whatever!("calendarWeights needs 12 values, got {}", v.len()),
            }
        }
        None => None,
    };
    let base = match cfg.aggregation.as_deref() {
        None => current,
        Some("recursiveEma") => match current {
            a @ TemporalAggregation::RecursiveEma { .. } => a,
            _ => TemporalAggregation::RecursiveEma {
                alpha: TemporalAggregation::DEFAULT_ALPHA,
            },
        },
        Some("calendarDecay") => match current {
            a @ TemporalAggregation::CalendarDecay(_) => a,
            _ => TemporalAggregation::CalendarDecay(CALENDAR_DECAY_WEIGHTS),
        },
        Some(x) => whatever!("unknown aggregation: {}", x),
    };
    Ok(match base {
        TemporalAggregation::RecursiveEma { alpha: a } => TemporalAggregation::RecursiveEma {
            alpha: alpha.unwrap_or(a),
        },
        TemporalAggregation::CalendarDecay(w) => {
            TemporalAggregation::CalendarDecay(calendar.unwrap_or(w))
        }
    })
}

fn read_js_float_opt(x: &Option<JSValue>) -> GapResult<Option<f64>> {
    x.as_ref().map(read_js_float).transpose()
}

// Numbers may be written as JSON numbers or as strings.
fn read_js_float(x: &JSValue) -> GapResult<f64> {
    let res = match x {
        JSValue::Number(n) => n.as_f64(),
        JSValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    res.filter(|f| f.is_finite())
        .context(ParsingJsonNumberSnafu {
            value: x.to_string(),
        })
}

fn read_js_int(x: &JSValue) -> GapResult<usize> {
    let res = match x {
        JSValue::Number(n) => n.as_u64().map(|x| x as usize),
        JSValue::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    };
    res.context(ParsingJsonNumberSnafu {
        value: x.to_string(),
    })
}
