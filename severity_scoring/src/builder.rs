pub use crate::config::*;

/// A builder for collecting the records of a run.
///
/// The builder checks every record as it is added, so that the pipeline only
/// sees well-formed events.
///
/// ```
/// pub use severity_scoring::builder::Builder;
/// pub use severity_scoring::{AgeBracket, Category, SeverityRules, Severity};
/// # use severity_scoring::SeverityErrors;
///
/// let mut builder = Builder::new(&SeverityRules::DEFAULT_RULES)?;
///
/// builder.add_demand("110001", "December", Category::Enrolment, &[(AgeBracket::Infant, 20.0)])?;
/// builder.add_demand("560001", "December", Category::Enrolment, &[(AgeBracket::Infant, 0.0)])?;
/// builder.add_campaigns("560001", 2)?;
///
/// let result = builder.run()?;
/// assert_eq!(result.ranked[0].postal_code.as_str(), "110001");
/// assert_eq!(result.ranked[0].severity, Severity::High);
///
/// # Ok::<(), SeverityErrors>(())
/// ```
pub struct Builder {
    pub(crate) _rules: SeverityRules,
    pub(crate) _events: Vec<CanonicalEvent>,
}

impl Builder {
    pub fn new(rules: &SeverityRules) -> Result<Builder, SeverityErrors> {
        rules.validate()?;
        Ok(Builder {
            _rules: rules.clone(),
            _events: Vec::new(),
        })
    }

    /// Adds a demand record from raw labels.
    ///
    /// The postal code is cleaned (see [`PostalCode::parse`]) and the month may be
    /// a name, an abbreviation or an ordinal.
    pub fn add_demand(
        &mut self,
        postal_code: &str,
        month: &str,
        category: Category,
        counts: &[(AgeBracket, f64)],
    ) -> Result<(), SeverityErrors> {
        let p = PostalCode::parse(postal_code)
            .ok_or_else(|| SeverityErrors::InvalidPostalCode(postal_code.to_string()))?;
        let m =
            Month::from_label(month).ok_or_else(|| SeverityErrors::InvalidMonth(month.to_string()))?;
        self.add_event(CanonicalEvent::demand(p, m, category, counts))
    }

    pub fn add_campaigns(&mut self, postal_code: &str, count: u64) -> Result<(), SeverityErrors> {
        let p = PostalCode::parse(postal_code)
            .ok_or_else(|| SeverityErrors::InvalidPostalCode(postal_code.to_string()))?;
        self.add_event(CanonicalEvent::campaigns(p, count))
    }

    /// Adds an event. Demand events must carry a month and finite,
    /// non-negative counts.
    pub fn add_event(&mut self, event: CanonicalEvent) -> Result<(), SeverityErrors> {
        if event.category.is_demand() && event.month.is_none() {
            return Err(SeverityErrors::MissingMonth(event.postal_code.to_string()));
        }
        if event
            .age_bucket_counts
            .values()
            .any(|c| !c.is_finite() || *c < 0.0)
        {
            return Err(SeverityErrors::InvalidCount(event.postal_code.to_string()));
        }
        self._events.push(event);
        Ok(())
    }

    pub fn add_events(&mut self, events: Vec<CanonicalEvent>) -> Result<(), SeverityErrors> {
        for ev in events {
            self.add_event(ev)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self._events.len()
    }

    pub fn is_empty(&self) -> bool {
        self._events.is_empty()
    }

    pub fn events(&self) -> &[CanonicalEvent] {
        &self._events
    }

    pub fn run(&self) -> Result<SeverityResult, SeverityErrors> {
        crate::run_severity_scoring(&self._events, &self._rules)
    }
}
