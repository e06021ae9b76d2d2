mod config;
pub mod builder;
pub mod manual;
pub mod normalize;

use log::{debug, info};

use std::collections::{BTreeMap, HashMap, HashSet};

pub use crate::config::*;

/// Runs the full scoring pipeline over a set of canonical events.
///
/// Arguments:
/// * `events` the normalized records of all the categories, campaigns included
/// * `rules` the weights, strategies and thresholds of this run
///
/// Every distinct postal code of the input receives a score. Postal codes
/// without any demand score 0. The result is sorted by descending z-score.
pub fn run_severity_scoring(
    events: &[CanonicalEvent],
    rules: &SeverityRules,
) -> Result<SeverityResult, SeverityErrors> {
    rules.validate()?;
    if events.is_empty() {
        return Err(SeverityErrors::EmptyInput);
    }
    info!(
        "run_severity_scoring: Processing {:?} events, rules: {:?}",
        events.len(),
        rules
    );

    let loads = compute_loads(events, &rules.category_weights, &rules.bucket_weights)?;
    let campaigns = campaign_totals(events);
    info!(
        "run_severity_scoring: {} load entries, {} postal codes with campaigns",
        loads.len(),
        campaigns.len()
    );

    let net_loads = adjust_for_supply(&loads, &campaigns, &rules.supply_denominator);
    let postal_codes = postal_codes_in_order(events);
    let aggregated = aggregate_scores(&postal_codes, &net_loads, &rules.aggregation);
    let (scored, population) = classify(&aggregated, &rules.thresholds);
    info!(
        "run_severity_scoring: {} postal codes, mean score {:.4}, stddev {:.4}",
        population.count, population.mean, population.stddev
    );

    let num_scored = scored.len();
    let ranked = rank(scored, rules.positive_z_only);
    for sev in Severity::DESCENDING.iter() {
        let n = ranked.iter().filter(|s| s.severity == *sev).count();
        info!("run_severity_scoring: {:>8}: {}", sev.name(), n);
    }

    Ok(SeverityResult {
        stage_counts: StageCounts {
            events: events.len(),
            load_entries: loads.len(),
            campaign_entries: campaigns.len(),
            postal_codes: num_scored,
            filtered_out: num_scored - ranked.len(),
        },
        ranked,
        population,
    })
}

/// Weighted demand per (postal code, month).
///
/// `raw_load = sum over categories of category_weight * sum over brackets of
/// bucket_weight * count`. Pairs with a zero load are not emitted. Entries are
/// sorted by postal code, then month.
pub fn compute_loads(
    events: &[CanonicalEvent],
    category_weights: &CategoryWeights,
    bucket_weights: &BucketWeights,
) -> Result<Vec<LoadEntry>, SeverityErrors> {
    let mut acc: BTreeMap<(PostalCode, Month), (f64, u64)> = BTreeMap::new();
    for ev in events.iter().filter(|e| e.category.is_demand()) {
        let month = ev
            .month
            .ok_or_else(|| SeverityErrors::MissingMonth(ev.postal_code.to_string()))?;
        let cat_weight = category_weights.weight(ev.category);
        let weighted: f64 = ev
            .age_bucket_counts
            .iter()
            .map(|(bracket, count)| bucket_weights.weight(ev.category, *bracket) * count)
            .sum();
        let entry = acc
            .entry((ev.postal_code.clone(), month))
            .or_insert((0.0, 0));
        entry.0 += cat_weight * weighted;
        entry.1 += 1;
    }

    let loads: Vec<LoadEntry> = acc
        .into_iter()
        .filter(|(_, (raw_load, _))| *raw_load > 0.0)
        .map(|((postal_code, month), (raw_load, transactions))| LoadEntry {
            postal_code,
            month,
            raw_load,
            transactions,
        })
        .collect();
    debug!("compute_loads: {} entries", loads.len());
    Ok(loads)
}

/// Total number of campaigns per postal code, sorted by postal code.
pub fn campaign_totals(events: &[CanonicalEvent]) -> Vec<CampaignEntry> {
    let mut acc: BTreeMap<PostalCode, u64> = BTreeMap::new();
    for ev in events.iter().filter(|e| e.category == Category::Campaign) {
        let total = acc.entry(ev.postal_code.clone()).or_insert(0);
        *total = total.saturating_add(ev.campaign_count);
    }
    acc.into_iter()
        .map(|(postal_code, campaign_count)| CampaignEntry {
            postal_code,
            campaign_count,
        })
        .collect()
}

/// Divides each raw load by the supply denominator of its postal code. A
/// postal code without campaign data has zero campaigns.
pub fn adjust_for_supply(
    loads: &[LoadEntry],
    campaigns: &[CampaignEntry],
    denominator: &SupplyDenominator,
) -> Vec<NetLoadEntry> {
    let campaigns_by_code: HashMap<&PostalCode, u64> = campaigns
        .iter()
        .map(|c| (&c.postal_code, c.campaign_count))
        .collect();
    loads
        .iter()
        .map(|l| {
            let campaign_count = campaigns_by_code.get(&l.postal_code).cloned().unwrap_or(0);
            let d = denominator.denominator(campaign_count, l.transactions);
            NetLoadEntry {
                postal_code: l.postal_code.clone(),
                month: l.month,
                net_load: l.raw_load / d,
            }
        })
        .collect()
}

/// Distinct postal codes, in order of first appearance.
pub fn postal_codes_in_order(events: &[CanonicalEvent]) -> Vec<PostalCode> {
    let mut seen: HashSet<&PostalCode> = HashSet::new();
    let mut res: Vec<PostalCode> = Vec::new();
    for ev in events.iter() {
        if seen.insert(&ev.postal_code) {
            res.push(ev.postal_code.clone());
        }
    }
    res
}

/// Collapses the monthly series of each postal code into one score.
///
/// The series are put in chronological order before aggregation. The output
/// follows the order of `postal_codes`; codes without any entry score 0.
pub fn aggregate_scores(
    postal_codes: &[PostalCode],
    net_loads: &[NetLoadEntry],
    aggregation: &TemporalAggregation,
) -> Vec<(PostalCode, f64)> {
    let mut series: HashMap<&PostalCode, Vec<(Month, f64)>> = HashMap::new();
    for nl in net_loads.iter() {
        series
            .entry(&nl.postal_code)
            .or_insert_with(Vec::new)
            .push((nl.month, nl.net_load));
    }
    postal_codes
        .iter()
        .map(|p| {
            let score = match series.get_mut(p) {
                Some(s) => {
                    s.sort_by_key(|(m, _)| *m);
                    aggregation.collapse(s)
                }
                None => 0.0,
            };
            (p.clone(), score)
        })
        .collect()
}

/// Mean and population standard deviation.
pub fn population_stats(scores: &[f64]) -> PopulationStats {
    let count = scores.len();
    if count == 0 {
        return PopulationStats {
            count,
            mean: 0.0,
            stddev: 0.0,
        };
    }
    let n = count as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    PopulationStats {
        count,
        mean,
        stddev: variance.sqrt(),
    }
}

/// Standardizes the scores against the population of this run and assigns
/// the severity tiers.
///
/// When all the scores are equal the standard deviation is zero and every
/// z-score is 0.
pub fn classify(
    aggregated: &[(PostalCode, f64)],
    thresholds: &SeverityThresholds,
) -> (Vec<ScoredPostalCode>, PopulationStats) {
    let scores: Vec<f64> = aggregated.iter().map(|(_, s)| *s).collect();
    let population = population_stats(&scores);
    let scale = if population.stddev.is_finite() && population.stddev > 0.0 {
        Some(population.stddev)
    } else {
        None
    };
    let scored = aggregated
        .iter()
        .map(|(postal_code, score)| {
            let z_score = match scale {
                Some(sd) => (score - population.mean) / sd,
                None => 0.0,
            };
            ScoredPostalCode {
                postal_code: postal_code.clone(),
                aggregated_score: *score,
                z_score,
                severity: thresholds.classify(z_score),
            }
        })
        .collect();
    (scored, population)
}

/// Sorts by descending z-score. The sort is stable: ties keep their input
/// order.
pub fn rank(mut scored: Vec<ScoredPostalCode>, positive_z_only: bool) -> Vec<ScoredPostalCode> {
    if positive_z_only {
        scored.retain(|s| s.z_score > 0.0);
    }
    scored.sort_by(|a, b| {
        b.z_score
            .partial_cmp(&a.z_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}

/// The `n` most severe postal codes, with their criticality index: the z-score
/// as a percentage of the largest z-score of the run, clamped to 0..100 and
/// rounded to 2 decimals.
pub fn critical_extract(ranked: &[ScoredPostalCode], n: usize) -> Vec<CriticalEntry> {
    let max_z = ranked
        .iter()
        .map(|s| s.z_score)
        .fold(f64::NEG_INFINITY, f64::max);
    ranked
        .iter()
        .take(n)
        .map(|s| {
            let criticality_index = if max_z > 0.0 {
                let pct = (s.z_score / max_z * 100.0).clamp(0.0, 100.0);
                (pct * 100.0).round() / 100.0
            } else {
                0.0
            };
            CriticalEntry {
                postal_code: s.postal_code.clone(),
                severity: s.severity,
                z_score: s.z_score,
                criticality_index,
            }
        })
        .collect()
}

/// Number of postal codes per tier, most severe first. Empty tiers are listed.
pub fn severity_distribution(ranked: &[ScoredPostalCode]) -> Vec<(Severity, usize)> {
    Severity::DESCENDING
        .iter()
        .map(|sev| (*sev, ranked.iter().filter(|s| s.severity == *sev).count()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc(s: &str) -> PostalCode {
        PostalCode::parse(s).unwrap()
    }

    fn month(n: u8) -> Month {
        Month::new(n).unwrap()
    }

    fn enrolment(code: &str, m: u8, infants: f64) -> CanonicalEvent {
        CanonicalEvent::demand(
            pc(code),
            month(m),
            Category::Enrolment,
            &[(AgeBracket::Infant, infants)],
        )
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn single_record_load() {
        let events = vec![CanonicalEvent::demand(
            pc("110001"),
            month(12),
            Category::Enrolment,
            &[
                (AgeBracket::Infant, 10.0),
                (AgeBracket::Child, 0.0),
                (AgeBracket::Adult, 0.0),
            ],
        )];
        let loads =
            compute_loads(&events, &CategoryWeights::DEFAULT, &BucketWeights::DEFAULT).unwrap();
        assert_eq!(loads.len(), 1);
        assert_close(loads[0].raw_load, 15.0);
        assert_eq!(loads[0].transactions, 1);

        let net = adjust_for_supply(&loads, &[], &SupplyDenominator::DEFAULT);
        assert_close(net[0].net_load, 5.0);

        let res = run_severity_scoring(&events, &SeverityRules::DEFAULT_RULES).unwrap();
        assert_eq!(res.ranked.len(), 1);
        assert_close(res.ranked[0].aggregated_score, 5.0);
        // A population of one has no spread.
        assert_eq!(res.ranked[0].z_score, 0.0);
        assert_eq!(res.ranked[0].severity, Severity::Moderate);
    }

    #[test]
    fn category_weights_combine() {
        let events = vec![
            enrolment("110001", 1, 2.0),
            CanonicalEvent::demand(
                pc("110001"),
                month(1),
                Category::Biometric,
                &[(AgeBracket::Child, 2.0), (AgeBracket::Adult, 1.0)],
            ),
            CanonicalEvent::demand(
                pc("110001"),
                month(1),
                Category::Demographic,
                &[(AgeBracket::Adult, 10.0)],
            ),
        ];
        // 1.0 * 1.5 * 2 + 2.5 * (1.5 * 2 + 1.2 * 1) + 1.2 * 1.2 * 10
        let loads =
            compute_loads(&events, &CategoryWeights::DEFAULT, &BucketWeights::DEFAULT).unwrap();
        assert_close(loads[0].raw_load, 3.0 + 10.5 + 14.4);
        assert_eq!(loads[0].transactions, 3);

        // 1.0 * 1.5 * 2 + 1.5 * (1.5 * 2 + 1.2 * 1) + 1.2 * 1.2 * 10
        let loads =
            compute_loads(&events, &CategoryWeights::LEGACY, &BucketWeights::DEFAULT).unwrap();
        assert_close(loads[0].raw_load, 3.0 + 6.3 + 14.4);
    }

    #[test]
    fn zero_load_is_sparse() {
        let events = vec![enrolment("110001", 3, 0.0), enrolment("560001", 3, 4.0)];
        let loads =
            compute_loads(&events, &CategoryWeights::DEFAULT, &BucketWeights::DEFAULT).unwrap();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].postal_code, pc("560001"));

        // The postal code still gets a score.
        let res = run_severity_scoring(&events, &SeverityRules::DEFAULT_RULES).unwrap();
        assert_eq!(res.ranked.len(), 2);
        assert_eq!(res.ranked[1].postal_code, pc("110001"));
        assert_eq!(res.ranked[1].aggregated_score, 0.0);
    }

    #[test]
    fn missing_month_is_rejected() {
        let mut ev = enrolment("110001", 3, 1.0);
        ev.month = None;
        let res = compute_loads(&[ev], &CategoryWeights::DEFAULT, &BucketWeights::DEFAULT);
        assert_eq!(res, Err(SeverityErrors::MissingMonth("110001".to_string())));
    }

    #[test]
    fn campaign_totals_saturate() {
        let _ = env_logger::try_init();
        let events = vec![
            CanonicalEvent::campaigns(pc("110001"), u64::MAX),
            CanonicalEvent::campaigns(pc("110001"), u64::MAX),
        ];
        let campaigns = campaign_totals(&events);
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].campaign_count, u64::MAX);
    }

    #[test]
    fn campaigns_raise_capacity() {
        let events = vec![
            enrolment("110001", 5, 10.0),
            CanonicalEvent::campaigns(pc("110001"), 1),
            CanonicalEvent::campaigns(pc("110001"), 1),
            CanonicalEvent::campaigns(pc("999999"), 4),
        ];
        let campaigns = campaign_totals(&events);
        assert_eq!(
            campaigns,
            vec![
                CampaignEntry {
                    postal_code: pc("110001"),
                    campaign_count: 2
                },
                CampaignEntry {
                    postal_code: pc("999999"),
                    campaign_count: 4
                },
            ]
        );
        let loads =
            compute_loads(&events, &CategoryWeights::DEFAULT, &BucketWeights::DEFAULT).unwrap();
        let net = adjust_for_supply(&loads, &campaigns, &SupplyDenominator::DEFAULT);
        // 15 / (3 + 1.25 * 2)
        assert_close(net[0].net_load, 15.0 / 5.5);
    }

    #[test]
    fn transaction_volume_denominator() {
        let events = vec![
            enrolment("110001", 5, 2.0),
            enrolment("110001", 5, 2.0),
            enrolment("110001", 5, 2.0),
        ];
        let loads =
            compute_loads(&events, &CategoryWeights::DEFAULT, &BucketWeights::DEFAULT).unwrap();
        let net = adjust_for_supply(&loads, &[], &SupplyDenominator::LEGACY);
        // 9 / (3 + 3 / 3)
        assert_close(net[0].net_load, 2.25);
    }

    #[test]
    fn recursive_ema_is_chronological() {
        let p = pc("110001");
        let net = vec![
            NetLoadEntry {
                postal_code: p.clone(),
                month: month(2),
                net_load: 20.0,
            },
            NetLoadEntry {
                postal_code: p.clone(),
                month: month(1),
                net_load: 10.0,
            },
        ];
        let ema = TemporalAggregation::RecursiveEma { alpha: 0.4 };
        let res = aggregate_scores(&[p.clone()], &net, &ema);
        assert_close(res[0].1, 0.4 * 20.0 + 0.6 * 10.0);

        let decay = TemporalAggregation::CalendarDecay(CALENDAR_DECAY_WEIGHTS);
        let res = aggregate_scores(&[p], &net, &decay);
        assert_close(res[0].1, 20.0 * 0.06 + 10.0 * 0.04);
    }

    #[test]
    fn calendar_decay_weights_recent_months() {
        let series = vec![(month(11), 10.0), (month(12), 10.0)];
        let decay = TemporalAggregation::CalendarDecay(CALENDAR_DECAY_WEIGHTS);
        assert_close(decay.collapse(&series), 17.5);
        let ema = TemporalAggregation::RecursiveEma { alpha: 0.4 };
        assert_eq!(ema.collapse(&[]), 0.0);
    }

    #[test]
    fn two_postal_codes_standardize_to_plus_minus_one() {
        let aggregated = vec![(pc("110001"), 10.0), (pc("560001"), 0.0)];
        let (scored, population) = classify(&aggregated, &SeverityThresholds::DEFAULT);
        assert_close(population.mean, 5.0);
        assert_close(population.stddev, 5.0);
        assert_close(scored[0].z_score, 1.0);
        assert_close(scored[1].z_score, -1.0);
        assert_eq!(scored[0].severity, Severity::High);
        assert_eq!(scored[1].severity, Severity::Moderate);
    }

    #[test]
    fn standardization_invariant() {
        let codes = [
            "110001", "110002", "110003", "110004", "110005", "110006", "110007",
        ];
        let loads = [1.0, 3.0, 3.0, 8.0, 40.0, 0.5, 12.0];
        let events: Vec<CanonicalEvent> = codes
            .iter()
            .zip(loads.iter())
            .map(|(c, l)| enrolment(c, 6, *l))
            .collect();
        let res = run_severity_scoring(&events, &SeverityRules::DEFAULT_RULES).unwrap();
        let zs: Vec<f64> = res.ranked.iter().map(|s| s.z_score).collect();
        let stats = population_stats(&zs);
        assert!(stats.mean.abs() < 1e-9);
        assert!((stats.stddev - 1.0).abs() < 1e-9);
        for s in res.ranked.iter() {
            assert!(s.z_score.is_finite());
            assert_eq!(s.severity, SeverityThresholds::DEFAULT.classify(s.z_score));
            assert!(is_valid_postal_code(s.postal_code.as_str()));
        }
        // Sorted by descending z-score.
        assert!(res.ranked.windows(2).all(|w| w[0].z_score >= w[1].z_score));
        assert_eq!(res.ranked[0].postal_code, pc("110005"));
    }

    #[test]
    fn ties_keep_first_appearance_order() {
        let events = vec![
            enrolment("300001", 1, 1.0),
            enrolment("200001", 1, 5.0),
            enrolment("100001", 1, 1.0),
            enrolment("400001", 1, 5.0),
        ];
        let res = run_severity_scoring(&events, &SeverityRules::DEFAULT_RULES).unwrap();
        let order: Vec<&str> = res.ranked.iter().map(|s| s.postal_code.as_str()).collect();
        assert_eq!(order, vec!["200001", "400001", "300001", "100001"]);
    }

    #[test]
    fn positive_only_filter_keeps_population_stats() {
        let events = vec![
            enrolment("110001", 1, 10.0),
            enrolment("110002", 1, 0.0),
            enrolment("110003", 1, 2.0),
        ];
        let mut rules = SeverityRules::DEFAULT_RULES;
        let all = run_severity_scoring(&events, &rules).unwrap();
        rules.positive_z_only = true;
        let positive = run_severity_scoring(&events, &rules).unwrap();
        assert_eq!(all.ranked.len(), 3);
        assert_eq!(positive.ranked.len(), 1);
        assert_eq!(positive.stage_counts.filtered_out, 2);
        assert_eq!(positive.population, all.population);
        assert_eq!(positive.ranked[0], all.ranked[0]);
    }

    #[test]
    fn runs_are_idempotent() {
        let events = vec![
            enrolment("110001", 1, 10.0),
            enrolment("110001", 7, 3.0),
            enrolment("110002", 2, 1.0),
            CanonicalEvent::campaigns(pc("110002"), 2),
            enrolment("110003", 12, 6.0),
        ];
        let a = run_severity_scoring(&events, &SeverityRules::LEGACY_RULES).unwrap();
        let b = run_severity_scoring(&events, &SeverityRules::LEGACY_RULES).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_is_fatal() {
        assert_eq!(
            run_severity_scoring(&[], &SeverityRules::DEFAULT_RULES),
            Err(SeverityErrors::EmptyInput)
        );
    }

    #[test]
    fn criticality_index() {
        let aggregated = vec![
            (pc("110001"), 10.0),
            (pc("110002"), 0.0),
            (pc("110003"), 5.0),
            (pc("110004"), 1.0),
        ];
        let (scored, _) = classify(&aggregated, &SeverityThresholds::DEFAULT);
        let ranked = rank(scored, false);
        let top = critical_extract(&ranked, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].postal_code, pc("110001"));
        assert_eq!(top[0].criticality_index, 100.0);
        assert!(top[1].criticality_index > 0.0 && top[1].criticality_index < 100.0);

        let all = critical_extract(&ranked, 10);
        assert_eq!(all.len(), 4);
        // Below-average codes are clamped to 0.
        assert_eq!(all[3].criticality_index, 0.0);
    }

    #[test]
    fn distribution_lists_every_tier() {
        let aggregated = vec![(pc("110001"), 10.0), (pc("560001"), 0.0)];
        let (scored, _) = classify(&aggregated, &SeverityThresholds::DEFAULT);
        assert_eq!(
            severity_distribution(&scored),
            vec![
                (Severity::Extreme, 0),
                (Severity::Critical, 0),
                (Severity::High, 1),
                (Severity::Moderate, 1),
            ]
        );
    }
}
