// ********* Input data structures ***********

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Display;

/// Number of digits in a postal code.
pub const POSTAL_CODE_LEN: usize = 6;

/// Cleans a raw postal code value.
///
/// The text after the first `.` is discarded (spreadsheet exports often render
/// codes as `110001.0`), then every non-digit character is removed. The result
/// is not padded or truncated.
pub fn clean_postal_code(raw: &str) -> String {
    let integral = raw.trim().split('.').next().unwrap_or("");
    integral.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// True if the string is exactly six ASCII digits.
pub fn is_valid_postal_code(s: &str) -> bool {
    s.len() == POSTAL_CODE_LEN && s.bytes().all(|b| b.is_ascii_digit())
}

/// A validated 6-digit postal code.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd)]
pub struct PostalCode(String);

impl PostalCode {
    /// Cleans the raw value and accepts it only if exactly six digits remain.
    pub fn parse(raw: &str) -> Option<PostalCode> {
        let cleaned = clean_postal_code(raw);
        if is_valid_postal_code(&cleaned) {
            Some(PostalCode(cleaned))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for PostalCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// A calendar month, stored as its ordinal (1 = January).
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct Month(u8);

impl Month {
    pub fn new(ordinal: u8) -> Option<Month> {
        if (1..=12).contains(&ordinal) {
            Some(Month(ordinal))
        } else {
            None
        }
    }

    /// Maps a month label to a month.
    ///
    /// Accepts full names and three-letter abbreviations in any case, `sept`,
    /// and the ordinals 1 to 12. Anything else is rejected, never defaulted.
    pub fn from_label(label: &str) -> Option<Month> {
        let l = label.trim().to_lowercase();
        if l.is_empty() {
            return None;
        }
        if let Ok(n) = l.parse::<u8>() {
            return Month::new(n);
        }
        if l == "sept" {
            return Some(Month(9));
        }
        MONTH_NAMES
            .iter()
            .position(|name| {
                let name = name.to_lowercase();
                name == l || &name[..3] == l.as_str()
            })
            .map(|idx| Month((idx + 1) as u8))
    }

    pub fn ordinal(&self) -> u8 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        MONTH_NAMES[(self.0 - 1) as usize]
    }
}

/// The source of a transaction event.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum Category {
    Enrolment,
    /// Demographic update.
    Demographic,
    /// Biometric update.
    Biometric,
    /// Service campaign. Supply side, carries no demand.
    Campaign,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Enrolment,
        Category::Demographic,
        Category::Biometric,
        Category::Campaign,
    ];

    /// Recognises directory names and configuration labels by prefix
    /// (`Enrolment`, `enrollment`, `Demographics`, `bio`, `campaigns`, ...).
    pub fn from_label(label: &str) -> Option<Category> {
        let l = label.trim().to_lowercase();
        if l.starts_with("enrol") {
            Some(Category::Enrolment)
        } else if l.starts_with("demo") {
            Some(Category::Demographic)
        } else if l.starts_with("bio") {
            Some(Category::Biometric)
        } else if l.starts_with("camp") {
            Some(Category::Campaign)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Category::Enrolment => "enrolment",
            Category::Demographic => "demographic",
            Category::Biometric => "biometric",
            Category::Campaign => "campaign",
        }
    }

    /// Demand categories contribute load. Campaigns only contribute supply.
    pub fn is_demand(&self) -> bool {
        !matches!(self, Category::Campaign)
    }
}

/// The age brackets found in the count columns of the source files.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum AgeBracket {
    /// 0 to 5 years.
    Infant,
    /// 5 to 17 years.
    Child,
    /// 18 years and above (some files label it 17+).
    Adult,
}

impl AgeBracket {
    /// Recognises a count column from its name.
    ///
    /// The name must contain an `age` token directly followed by a numeric
    /// token: `age_0_5`, `age_5_17`, `age_18_greater`, `bio_age_17_`,
    /// `demo_age_5_17`. The first number selects the bracket.
    pub fn from_column_name(name: &str) -> Option<AgeBracket> {
        let lowered = name.trim().to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let age_pos = tokens.iter().position(|t| *t == "age")?;
        let lower_bound: u32 = tokens.get(age_pos + 1)?.parse().ok()?;
        Some(if lower_bound < 5 {
            AgeBracket::Infant
        } else if lower_bound < 17 {
            AgeBracket::Child
        } else {
            AgeBracket::Adult
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgeBracket::Infant => "0-5",
            AgeBracket::Child => "5-17",
            AgeBracket::Adult => "18+",
        }
    }

    pub fn from_label(label: &str) -> Option<AgeBracket> {
        match label.trim() {
            "0-5" => Some(AgeBracket::Infant),
            "5-17" => Some(AgeBracket::Child),
            "18+" | "17+" => Some(AgeBracket::Adult),
            _ => None,
        }
    }
}

/// One normalized transaction record.
#[derive(PartialEq, Debug, Clone)]
pub struct CanonicalEvent {
    pub postal_code: PostalCode,
    /// Always present for demand categories. Campaign events may omit it.
    pub month: Option<Month>,
    pub category: Category,
    pub age_bucket_counts: BTreeMap<AgeBracket, f64>,
    /// Number of campaigns this record stands for. Zero for demand events.
    pub campaign_count: u64,
}

impl CanonicalEvent {
    pub fn demand(
        postal_code: PostalCode,
        month: Month,
        category: Category,
        counts: &[(AgeBracket, f64)],
    ) -> CanonicalEvent {
        let mut age_bucket_counts: BTreeMap<AgeBracket, f64> = BTreeMap::new();
        for (bracket, count) in counts {
            *age_bucket_counts.entry(*bracket).or_insert(0.0) += *count;
        }
        CanonicalEvent {
            postal_code,
            month: Some(month),
            category,
            age_bucket_counts,
            campaign_count: 0,
        }
    }

    pub fn campaigns(postal_code: PostalCode, campaign_count: u64) -> CanonicalEvent {
        CanonicalEvent {
            postal_code,
            month: None,
            category: Category::Campaign,
            age_bucket_counts: BTreeMap::new(),
            campaign_count,
        }
    }
}

// ******** Output data structures *********

/// Weighted demand for one postal code in one month.
#[derive(PartialEq, Debug, Clone)]
pub struct LoadEntry {
    pub postal_code: PostalCode,
    pub month: Month,
    pub raw_load: f64,
    /// Number of demand records that contributed to this entry.
    pub transactions: u64,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CampaignEntry {
    pub postal_code: PostalCode,
    pub campaign_count: u64,
}

#[derive(PartialEq, Debug, Clone)]
pub struct NetLoadEntry {
    pub postal_code: PostalCode,
    pub month: Month,
    pub net_load: f64,
}

/// Severity tiers, ordered from least to most severe.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum Severity {
    Moderate,
    High,
    Critical,
    Extreme,
}

impl Severity {
    /// Most severe first.
    pub const DESCENDING: [Severity; 4] = [
        Severity::Extreme,
        Severity::Critical,
        Severity::High,
        Severity::Moderate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Severity::Moderate => "Moderate",
            Severity::High => "High",
            Severity::Critical => "Critical",
            Severity::Extreme => "Extreme",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct ScoredPostalCode {
    pub postal_code: PostalCode,
    pub aggregated_score: f64,
    pub z_score: f64,
    pub severity: Severity,
}

/// Population statistics of the aggregated scores of one run.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct PopulationStats {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation (no degrees-of-freedom correction).
    pub stddev: f64,
}

/// Sizes of the intermediate collections, for reporting.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub struct StageCounts {
    pub events: usize,
    pub load_entries: usize,
    pub campaign_entries: usize,
    pub postal_codes: usize,
    /// Postal codes removed by the positive z-score filter.
    pub filtered_out: usize,
}

#[derive(PartialEq, Debug, Clone)]
pub struct SeverityResult {
    /// Sorted by descending z-score.
    pub ranked: Vec<ScoredPostalCode>,
    pub population: PopulationStats,
    pub stage_counts: StageCounts,
}

/// One line of the top-N critical extract.
#[derive(PartialEq, Debug, Clone)]
pub struct CriticalEntry {
    pub postal_code: PostalCode,
    pub severity: Severity,
    pub z_score: f64,
    /// z-score rescaled against the largest z-score of the run, 0 to 100.
    pub criticality_index: f64,
}

/// Errors that prevent the pipeline from completing successfully.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum SeverityErrors {
    /// No canonical event at all: nothing downstream can run.
    EmptyInput,
    InvalidPostalCode(String),
    InvalidMonth(String),
    /// A demand event without a month, for the given postal code.
    MissingMonth(String),
    /// A negative or non-finite count, for the given postal code.
    InvalidCount(String),
    InvalidRules(String),
}

impl Error for SeverityErrors {}

impl Display for SeverityErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeverityErrors::EmptyInput => write!(f, "no valid records in the input"),
            SeverityErrors::InvalidPostalCode(s) => write!(f, "invalid postal code {:?}", s),
            SeverityErrors::InvalidMonth(s) => write!(f, "invalid month {:?}", s),
            SeverityErrors::MissingMonth(s) => {
                write!(f, "demand record for postal code {} has no month", s)
            }
            SeverityErrors::InvalidCount(s) => {
                write!(f, "negative or non-finite count for postal code {}", s)
            }
            SeverityErrors::InvalidRules(s) => write!(f, "invalid scoring rules: {}", s),
        }
    }
}

// ********* Configuration **********

/// Importance of each demand category in the load.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct CategoryWeights {
    pub enrolment: f64,
    pub demographic: f64,
    pub biometric: f64,
}

impl CategoryWeights {
    pub const DEFAULT: CategoryWeights = CategoryWeights {
        enrolment: 1.0,
        demographic: 1.2,
        biometric: 2.5,
    };

    /// The weighting of the first published runs.
    pub const LEGACY: CategoryWeights = CategoryWeights {
        enrolment: 1.0,
        demographic: 1.2,
        biometric: 1.5,
    };

    pub fn weight(&self, category: Category) -> f64 {
        match category {
            Category::Enrolment => self.enrolment,
            Category::Demographic => self.demographic,
            Category::Biometric => self.biometric,
            Category::Campaign => 0.0,
        }
    }
}

/// Weights of the age brackets within one category.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct BracketWeights {
    pub infant: f64,
    pub child: f64,
    pub adult: f64,
}

impl BracketWeights {
    pub const ENROLMENT: BracketWeights = BracketWeights {
        infant: 1.5,
        child: 1.2,
        adult: 1.0,
    };

    /// Update files only report 5-17 and 17+ brackets.
    pub const UPDATES: BracketWeights = BracketWeights {
        infant: 1.5,
        child: 1.5,
        adult: 1.2,
    };

    pub fn weight(&self, bracket: AgeBracket) -> f64 {
        match bracket {
            AgeBracket::Infant => self.infant,
            AgeBracket::Child => self.child,
            AgeBracket::Adult => self.adult,
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct BucketWeights {
    pub enrolment: BracketWeights,
    pub demographic: BracketWeights,
    pub biometric: BracketWeights,
}

impl BucketWeights {
    pub const DEFAULT: BucketWeights = BucketWeights {
        enrolment: BracketWeights::ENROLMENT,
        demographic: BracketWeights::UPDATES,
        biometric: BracketWeights::UPDATES,
    };

    pub fn for_category(&self, category: Category) -> Option<&BracketWeights> {
        match category {
            Category::Enrolment => Some(&self.enrolment),
            Category::Demographic => Some(&self.demographic),
            Category::Biometric => Some(&self.biometric),
            Category::Campaign => None,
        }
    }

    pub fn weight(&self, category: Category, bracket: AgeBracket) -> f64 {
        self.for_category(category)
            .map(|w| w.weight(bracket))
            .unwrap_or(0.0)
    }
}

/// How local supply dampens the raw demand.
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum SupplyDenominator {
    /// `baseline + coefficient * campaign_count`
    CampaignCapacity { baseline: f64, coefficient: f64 },
    /// `baseline + transactions / divisor`, transactions counted per month.
    TransactionVolume { baseline: f64, divisor: f64 },
}

impl SupplyDenominator {
    pub const DEFAULT: SupplyDenominator = SupplyDenominator::CampaignCapacity {
        baseline: 3.0,
        coefficient: 1.25,
    };

    pub const LEGACY: SupplyDenominator = SupplyDenominator::TransactionVolume {
        baseline: 3.0,
        divisor: 3.0,
    };

    pub fn denominator(&self, campaign_count: u64, transactions: u64) -> f64 {
        match *self {
            SupplyDenominator::CampaignCapacity {
                baseline,
                coefficient,
            } => baseline + coefficient * campaign_count as f64,
            SupplyDenominator::TransactionVolume { baseline, divisor } => {
                baseline + transactions as f64 / divisor
            }
        }
    }
}

/// Weights of the calendar months, January first. The most recent month
/// (December) has weight 1 and each earlier month is worth about 3/4 of the
/// next one.
pub const CALENDAR_DECAY_WEIGHTS: [f64; 12] = [
    0.04, 0.06, 0.08, 0.10, 0.13, 0.18, 0.24, 0.32, 0.42, 0.56, 0.75, 1.00,
];

/// How a monthly series is collapsed into one score.
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum TemporalAggregation {
    /// Static weighted sum over the calendar months.
    CalendarDecay([f64; 12]),
    /// `s_t = alpha * x_t + (1 - alpha) * s_(t-1)`, seeded with the first value.
    RecursiveEma { alpha: f64 },
}

impl TemporalAggregation {
    pub const DEFAULT_ALPHA: f64 = 0.4;

    /// The series must be sorted by month.
    pub fn collapse(&self, series: &[(Month, f64)]) -> f64 {
        match self {
            TemporalAggregation::CalendarDecay(weights) => series
                .iter()
                .map(|(m, x)| x * weights[(m.ordinal() - 1) as usize])
                .sum(),
            TemporalAggregation::RecursiveEma { alpha } => {
                let mut iter = series.iter();
                let mut score = match iter.next() {
                    Some((_, x)) => *x,
                    None => return 0.0,
                };
                for (_, x) in iter {
                    score = alpha * x + (1.0 - alpha) * score;
                }
                score
            }
        }
    }
}

/// Lower z-score bounds of the severity tiers.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct SeverityThresholds {
    pub extreme: f64,
    pub critical: f64,
    pub high: f64,
}

impl SeverityThresholds {
    pub const DEFAULT: SeverityThresholds = SeverityThresholds {
        extreme: 3.0,
        critical: 2.0,
        high: 1.0,
    };

    pub fn classify(&self, z_score: f64) -> Severity {
        if z_score >= self.extreme {
            Severity::Extreme
        } else if z_score >= self.critical {
            Severity::Critical
        } else if z_score >= self.high {
            Severity::High
        } else {
            Severity::Moderate
        }
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct SeverityRules {
    pub category_weights: CategoryWeights,
    pub bucket_weights: BucketWeights,
    pub supply_denominator: SupplyDenominator,
    pub aggregation: TemporalAggregation,
    pub thresholds: SeverityThresholds,
    /// Keep only the postal codes with a strictly positive z-score.
    pub positive_z_only: bool,
}

impl SeverityRules {
    pub const DEFAULT_RULES: SeverityRules = SeverityRules {
        category_weights: CategoryWeights::DEFAULT,
        bucket_weights: BucketWeights::DEFAULT,
        supply_denominator: SupplyDenominator::DEFAULT,
        aggregation: TemporalAggregation::RecursiveEma {
            alpha: TemporalAggregation::DEFAULT_ALPHA,
        },
        thresholds: SeverityThresholds::DEFAULT,
        positive_z_only: false,
    };

    /// Reproduces the first published runs: legacy category weights,
    /// transaction-volume denominator and calendar decay.
    pub const LEGACY_RULES: SeverityRules = SeverityRules {
        category_weights: CategoryWeights::LEGACY,
        bucket_weights: BucketWeights::DEFAULT,
        supply_denominator: SupplyDenominator::LEGACY,
        aggregation: TemporalAggregation::CalendarDecay(CALENDAR_DECAY_WEIGHTS),
        thresholds: SeverityThresholds::DEFAULT,
        positive_z_only: false,
    };

    /// Checks that every stage can run with these rules: weights are finite and
    /// non-negative, denominators stay positive, the smoothing factor is in
    /// (0, 1] and the thresholds are ordered.
    pub fn validate(&self) -> Result<(), SeverityErrors> {
        let invalid = |msg: String| Err(SeverityErrors::InvalidRules(msg));
        let is_weight = |w: f64| w.is_finite() && w >= 0.0;

        for category in Category::ALL.iter().filter(|c| c.is_demand()) {
            let w = self.category_weights.weight(*category);
            if !is_weight(w) {
                return invalid(format!("category weight {} for {}", w, category.name()));
            }
            if let Some(bw) = self.bucket_weights.for_category(*category) {
                for w in [bw.infant, bw.child, bw.adult] {
                    if !is_weight(w) {
                        return invalid(format!("bucket weight {} for {}", w, category.name()));
                    }
                }
            }
        }

        match self.supply_denominator {
            SupplyDenominator::CampaignCapacity {
                baseline,
                coefficient,
            } => {
                if !(baseline.is_finite() && baseline > 0.0) || !is_weight(coefficient) {
                    return invalid(format!(
                        "campaign capacity baseline {} coefficient {}",
                        baseline, coefficient
                    ));
                }
            }
            SupplyDenominator::TransactionVolume { baseline, divisor } => {
                if !(baseline.is_finite() && baseline > 0.0)
                    || !(divisor.is_finite() && divisor > 0.0)
                {
                    return invalid(format!(
                        "transaction volume baseline {} divisor {}",
                        baseline, divisor
                    ));
                }
            }
        }

        match self.aggregation {
            TemporalAggregation::RecursiveEma { alpha } => {
                if !(alpha > 0.0 && alpha <= 1.0) {
                    return invalid(format!("smoothing factor {} outside (0, 1]", alpha));
                }
            }
            TemporalAggregation::CalendarDecay(weights) => {
                if let Some(w) = weights.iter().find(|w| !is_weight(**w)) {
                    return invalid(format!("calendar weight {}", w));
                }
            }
        }

        let t = self.thresholds;
        let finite = t.extreme.is_finite() && t.critical.is_finite() && t.high.is_finite();
        if !finite || t.extreme < t.critical || t.critical < t.high {
            return invalid(format!(
                "thresholds must satisfy extreme >= critical >= high, got {} {} {}",
                t.extreme, t.critical, t.high
            ));
        }
        Ok(())
    }
}
