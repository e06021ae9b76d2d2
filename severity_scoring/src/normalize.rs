//! Turning raw tables into canonical events.
//!
//! Source files do not agree on their headers: the postal code may appear
//! under several transliterated names, and months come either as a month
//! label or inside a date. The column holding the postal codes is therefore
//! located by a [`ColumnResolver`], by default by looking at the shape of the
//! values rather than at the header.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Display;

use chrono::{Datelike, NaiveDate};
use log::{debug, info};

use crate::config::*;

/// An untyped table, as read from a delimited file.
///
/// Rows may be shorter than the header: missing cells read as empty text.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> RawTable {
        RawTable { headers, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Position of the first header equal to `name`, ignoring case and
    /// surrounding whitespace.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let wanted = name.trim().to_lowercase();
        self.headers
            .iter()
            .position(|h| h.trim().to_lowercase() == wanted)
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn column_values(&self, col: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows
            .iter()
            .map(move |r| r.get(col).map(|s| s.as_str()).unwrap_or(""))
    }
}

/// Finds the column holding the postal codes.
pub trait ColumnResolver: Send + Sync {
    fn resolve(&self, table: &RawTable) -> Option<usize>;
}

/// Selects the first column in which more than `min_match_rate` of the rows
/// clean up to a 6-digit postal code.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct ShapeResolver {
    pub min_match_rate: f64,
}

impl ShapeResolver {
    pub const DEFAULT_MATCH_RATE: f64 = 0.10;
}

impl Default for ShapeResolver {
    fn default() -> Self {
        ShapeResolver {
            min_match_rate: ShapeResolver::DEFAULT_MATCH_RATE,
        }
    }
}

impl ColumnResolver for ShapeResolver {
    fn resolve(&self, table: &RawTable) -> Option<usize> {
        if table.rows.is_empty() {
            return None;
        }
        let num_rows = table.num_rows() as f64;
        for (idx, header) in table.headers.iter().enumerate() {
            let matches = table
                .column_values(idx)
                .filter(|v| is_valid_postal_code(&clean_postal_code(v)))
                .count();
            let rate = matches as f64 / num_rows;
            debug!(
                "ShapeResolver: column {} {:?}: match rate {:.3}",
                idx, header, rate
            );
            if rate > self.min_match_rate {
                return Some(idx);
            }
        }
        None
    }
}

/// Selects a column by its exact header name (case-insensitive). The first
/// name present in the table wins.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct HeaderResolver {
    pub names: Vec<String>,
}

impl HeaderResolver {
    pub fn new(names: &[&str]) -> HeaderResolver {
        HeaderResolver {
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ColumnResolver for HeaderResolver {
    fn resolve(&self, table: &RawTable) -> Option<usize> {
        self.names.iter().find_map(|n| table.column_index(n))
    }
}

/// Reasons for a table to contribute no events at all.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum NormalizeError {
    NoPostalCodeColumn,
    /// A demand table without a month or date column.
    NoMonthColumn,
}

impl Error for NormalizeError {}

impl Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizeError::NoPostalCodeColumn => write!(f, "no postal code column found"),
            NormalizeError::NoMonthColumn => write!(f, "no month or date column found"),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub struct NormalizeStats {
    pub rows_in: usize,
    pub rows_out: usize,
    pub dropped_postal_code: usize,
    pub dropped_month: usize,
}

#[derive(PartialEq, Debug, Clone)]
pub struct NormalizedTable {
    pub events: Vec<CanonicalEvent>,
    pub stats: NormalizeStats,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
enum MonthSource {
    Label(usize),
    Date(usize),
}

/// Converts the tables of one category into canonical events.
pub struct Normalizer<'a> {
    category: Category,
    resolver: &'a dyn ColumnResolver,
    month_column: Option<String>,
}

impl<'a> Normalizer<'a> {
    pub fn new(category: Category, resolver: &'a dyn ColumnResolver) -> Normalizer<'a> {
        Normalizer {
            category,
            resolver,
            month_column: None,
        }
    }

    /// Reads the months from this column instead of detecting it.
    pub fn with_month_column(self, name: Option<String>) -> Normalizer<'a> {
        Normalizer {
            month_column: name,
            ..self
        }
    }

    pub fn normalize(&self, table: &RawTable) -> Result<NormalizedTable, NormalizeError> {
        let postal_idx = self
            .resolver
            .resolve(table)
            .ok_or(NormalizeError::NoPostalCodeColumn)?;
        let month_source = self.find_month_source(table, postal_idx);
        if month_source.is_none() && self.category.is_demand() {
            return Err(NormalizeError::NoMonthColumn);
        }
        debug!(
            "normalize: {}: postal code column {:?}, month source {:?}",
            self.category.name(),
            table.headers.get(postal_idx),
            month_source
        );

        let age_columns: Vec<(usize, AgeBracket)> = table
            .headers
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != postal_idx)
            .filter_map(|(idx, h)| AgeBracket::from_column_name(h).map(|b| (idx, b)))
            .collect();
        let count_column: Option<usize> = if self.category.is_demand() {
            None
        } else {
            table
                .headers
                .iter()
                .position(|h| h.trim().to_lowercase().ends_with("count"))
        };
        debug!(
            "normalize: age columns {:?}, campaign count column {:?}",
            age_columns, count_column
        );

        let mut stats = NormalizeStats {
            rows_in: table.num_rows(),
            ..NormalizeStats::default()
        };
        let mut events: Vec<CanonicalEvent> = Vec::new();
        for row in 0..table.num_rows() {
            let postal_code = match PostalCode::parse(table.cell(row, postal_idx)) {
                Some(p) => p,
                None => {
                    stats.dropped_postal_code += 1;
                    continue;
                }
            };
            let month = month_source.and_then(|src| match src {
                MonthSource::Label(col) => Month::from_label(table.cell(row, col)),
                MonthSource::Date(col) => month_from_date(table.cell(row, col)),
            });

            if self.category.is_demand() {
                let month = match month {
                    Some(m) => m,
                    None => {
                        stats.dropped_month += 1;
                        continue;
                    }
                };
                let mut age_bucket_counts: BTreeMap<AgeBracket, f64> = BTreeMap::new();
                for (col, bracket) in age_columns.iter() {
                    *age_bucket_counts.entry(*bracket).or_insert(0.0) +=
                        parse_count(table.cell(row, *col));
                }
                events.push(CanonicalEvent {
                    postal_code,
                    month: Some(month),
                    category: self.category,
                    age_bucket_counts,
                    campaign_count: 0,
                });
            } else {
                let campaign_count = match count_column {
                    Some(col) => parse_campaign_count(table.cell(row, col)),
                    None => 1,
                };
                events.push(CanonicalEvent {
                    postal_code,
                    month,
                    category: self.category,
                    age_bucket_counts: BTreeMap::new(),
                    campaign_count,
                });
            }
        }
        stats.rows_out = events.len();
        info!(
            "normalize: {}: {} rows in, {} kept, {} dropped (postal code), {} dropped (month)",
            self.category.name(),
            stats.rows_in,
            stats.rows_out,
            stats.dropped_postal_code,
            stats.dropped_month
        );
        Ok(NormalizedTable { events, stats })
    }

    fn find_month_source(&self, table: &RawTable, postal_idx: usize) -> Option<MonthSource> {
        if let Some(name) = &self.month_column {
            return table.column_index(name).map(MonthSource::Label);
        }
        if let Some(idx) = table.column_index("month") {
            return Some(MonthSource::Label(idx));
        }
        if let Some(idx) = table.column_index("date").filter(|idx| *idx != postal_idx) {
            return Some(MonthSource::Date(idx));
        }
        table
            .headers
            .iter()
            .enumerate()
            .find(|(idx, h)| *idx != postal_idx && h.to_lowercase().contains("date"))
            .map(|(idx, _)| MonthSource::Date(idx))
    }
}

const DATE_FORMATS: [&str; 7] = [
    "%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d", "%d-%m-%y", "%d/%m/%y", "%Y/%m/%d",
];

/// Month of a day-first date such as `01-03-2025`. A time part after a space
/// or a `T` is ignored.
pub fn month_from_date(raw: &str) -> Option<Month> {
    let date_part = raw.trim().split(|c: char| c == ' ' || c == 'T').next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
        .and_then(|d| Month::new(d.month() as u8))
}

/// Non-negative count. Malformed, negative or non-finite values count as zero.
pub fn parse_count(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(x) if x.is_finite() && x > 0.0 => x,
        _ => 0.0,
    }
}

/// Campaigns in one row. Values too large to be a real count are malformed
/// and count as zero.
pub fn parse_campaign_count(raw: &str) -> u64 {
    let x = parse_count(raw).round();
    if x < MAX_CAMPAIGNS_PER_ROW as f64 {
        x as u64
    } else {
        0
    }
}

const MAX_CAMPAIGNS_PER_ROW: u32 = u32::MAX;
