use log::{debug, info, warn};

use rayon::prelude::*;
use severity_scoring::builder::Builder;
use severity_scoring::normalize::*;
use severity_scoring::*;
use snafu::{prelude::*, Snafu};

use std::path::{Path, PathBuf};

use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::args::Args;
use crate::gap::config_reader::*;
use crate::gap::io_common::simplify_file_name;

pub mod config_reader;
pub mod export;
pub mod geo;
pub mod io_common;
pub mod io_csv;

#[derive(Debug, Snafu)]
pub enum GapError {
    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing JSON"))]
    ParsingJson { source: serde_json::Error },
    #[snafu(display("Cannot read a number from {value}"))]
    ParsingJsonNumber { value: String },
    #[snafu(display("The configuration file has no parent directory"))]
    MissingParentDir {},
    #[snafu(display("No input directory: use --input or --config"))]
    MissingInput {},

    #[snafu(display("Error reading {path}"))]
    ReadingSource {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing the delimited file {path}"))]
    CsvParse { source: csv::Error, path: String },
    #[snafu(display("The file {path} is empty"))]
    EmptyTable { path: String },
    #[snafu(display("Column {column} is missing in {path}"))]
    MissingColumn { column: String, path: String },

    #[snafu(display("Error writing {path}"))]
    WritingOutput {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error writing CSV for {path}"))]
    WritingCsv { source: csv::Error, path: String },

    #[snafu(display("No valid records found under {path}"))]
    NoValidRecords { path: String },
    #[snafu(display("Scoring failed: {source}"))]
    Scoring { source: SeverityErrors },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type GapResult<T> = Result<T, GapError>;

/// One category directory to read.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SourceSpec {
    pub category: Category,
    pub directory: PathBuf,
    pub postal_code_column: Option<String>,
    pub month_column: Option<String>,
}

/// Everything a run needs, after merging the configuration file and the
/// command line.
#[derive(PartialEq, Debug, Clone)]
pub struct RunSettings {
    pub input_root: PathBuf,
    pub sources: Vec<SourceSpec>,
    pub rules: SeverityRules,
    pub min_match_rate: f64,
    /// None or `stdout` prints the ranking.
    pub ranked_out: Option<String>,
    pub critical_out: Option<PathBuf>,
    pub summary_out: Option<PathBuf>,
    pub top_n: usize,
    pub geo_lookup: Option<PathBuf>,
    pub reference: Option<String>,
}

pub const DEFAULT_TOP_N: usize = 200;

pub fn build_settings(args: &Args) -> GapResult<RunSettings> {
    let (config, base_dir) = match &args.config {
        Some(p) => {
            let config = read_config(p)?;
            let parent = Path::new(p).parent().context(MissingParentDirSnafu {})?;
            if parent.as_os_str().is_empty() {
                (config, PathBuf::from("."))
            } else {
                (config, parent.to_path_buf())
            }
        }
        None => (GapConfig::default(), PathBuf::new()),
    };
    info!("config: {:?}", config);

    let input_root: PathBuf = match (&args.input, &args.config) {
        (Some(i), _) => PathBuf::from(i),
        (None, Some(_)) => base_dir.clone(),
        (None, None) => return MissingInputSnafu {}.fail(),
    };

    let sources: Vec<SourceSpec> = if config.sources.is_empty() {
        io_common::discover_sources(&input_root)?
            .into_iter()
            .map(|(category, directory)| SourceSpec {
                category,
                directory,
                postal_code_column: None,
                month_column: None,
            })
            .collect()
    } else {
        let mut res: Vec<SourceSpec> = Vec::new();
        for src in config.sources.iter() {
            res.push(SourceSpec {
                category: src.category()?,
                directory: input_root.join(&src.directory),
                postal_code_column: src.postal_code_column.clone(),
                month_column: src.month_column.clone(),
            });
        }
        res
    };
    debug!("sources: {:?}", sources);

    let mut rules_cfg = config.rules.clone();
    if args.preset.is_some() {
        rules_cfg.preset = args.preset.clone();
    }
    if args.aggregation.is_some() {
        rules_cfg.aggregation = args.aggregation.clone();
    }
    if args.denominator.is_some() {
        rules_cfg.supply_denominator = args.denominator.clone();
    }
    if args.positive_only {
        rules_cfg.positive_z_only = Some(true);
    }
    let rules = validate_rules(&rules_cfg)?;
    rules.validate().context(ScoringSnafu {})?;
    let min_match_rate = rules_cfg.min_match_rate()?;

    let os = &config.output_settings;
    let out_dir: Option<PathBuf> = os.output_directory.as_ref().map(|d| base_dir.join(d));
    let in_out_dir = |arg: &Option<String>, name: &Option<String>, default: &str| {
        arg.as_ref().map(PathBuf::from).or_else(|| {
            out_dir
                .as_ref()
                .map(|d| d.join(name.as_deref().unwrap_or(default)))
        })
    };

    let ranked_out: Option<String> = in_out_dir(
        &args.out,
        &os.ranked_file_name,
        export::DEFAULT_RANKED_FILE,
    )
    .map(|p| p.display().to_string());
    let critical_out = in_out_dir(
        &args.critical_out,
        &os.critical_file_name,
        export::DEFAULT_CRITICAL_FILE,
    );
    let summary_out = in_out_dir(
        &args.summary_out,
        &os.summary_file_name,
        export::DEFAULT_SUMMARY_FILE,
    );
    let geo_lookup: Option<PathBuf> = args
        .geo
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| os.geo_lookup_path.as_ref().map(|p| base_dir.join(p)));
    let top_n = match args.top_n {
        Some(n) => n,
        None => os.top_n()?.unwrap_or(DEFAULT_TOP_N),
    };

    Ok(RunSettings {
        input_root,
        sources,
        rules,
        min_match_rate,
        ranked_out,
        critical_out,
        summary_out,
        top_n,
        geo_lookup,
        reference: args.reference.clone(),
    })
}

/// Reads one file of a category. Files that cannot be read or that hold no
/// postal code column are skipped.
fn read_source_file(path: &Path, normalizer: &Normalizer) -> Option<NormalizedTable> {
    let fname = simplify_file_name(path);
    let table = match io_csv::read_table(path) {
        Ok(t) => t,
        Err(e) => {
            warn!("Skipping {}: {}", fname, e);
            return None;
        }
    };
    match normalizer.normalize(&table) {
        Ok(n) => {
            debug!("read_source_file: {}: {:?}", fname, n.stats);
            Some(n)
        }
        Err(e) => {
            warn!("{} contributes no records: {}", fname, e);
            None
        }
    }
}

/// Reads all the sources and runs the scoring pipeline.
pub fn score_sources(settings: &RunSettings) -> GapResult<SeverityResult> {
    let mut builder = Builder::new(&settings.rules).context(ScoringSnafu {})?;
    let shape = ShapeResolver {
        min_match_rate: settings.min_match_rate,
    };

    for source in settings.sources.iter() {
        let files = match io_common::list_source_files(&source.directory) {
            Ok(f) => f,
            Err(e) => {
                warn!("Skipping {} source: {}", source.category.name(), e);
                continue;
            }
        };
        info!(
            "Reading {} {} files from {:?}",
            files.len(),
            source.category.name(),
            source.directory
        );

        let by_header: Option<HeaderResolver> = source
            .postal_code_column
            .as_ref()
            .map(|c| HeaderResolver::new(&[c.as_str()]));
        let resolver: &dyn ColumnResolver = match &by_header {
            Some(h) => h,
            None => &shape,
        };
        let normalizer = Normalizer::new(source.category, resolver)
            .with_month_column(source.month_column.clone());

        let tables: Vec<Option<NormalizedTable>> = files
            .par_iter()
            .map(|p| read_source_file(p, &normalizer))
            .collect();

        let mut totals = NormalizeStats::default();
        for t in tables.into_iter().flatten() {
            totals.rows_in += t.stats.rows_in;
            totals.rows_out += t.stats.rows_out;
            totals.dropped_postal_code += t.stats.dropped_postal_code;
            totals.dropped_month += t.stats.dropped_month;
            builder.add_events(t.events).context(ScoringSnafu {})?;
        }
        info!(
            "{}: {} rows read, {} records kept, {} rows without postal code, {} rows without month",
            source.category.name(),
            totals.rows_in,
            totals.rows_out,
            totals.dropped_postal_code,
            totals.dropped_month
        );
    }

    if builder.is_empty() {
        return NoValidRecordsSnafu {
            path: settings.input_root.display().to_string(),
        }
        .fail();
    }
    builder.run().context(ScoringSnafu {})
}

/// Compares the computed ranking with a reference ranking.
fn check_reference(reference_path: &str, pretty_js_ranking: &str) -> GapResult<()> {
    let reference = read_reference(reference_path)?;
    let pretty_js_reference =
        serde_json::to_string_pretty(&reference).context(ParsingJsonSnafu {})?;
    if pretty_js_reference != pretty_js_ranking {
        warn!("Found differences with the reference ranking");
        print_diff(
            pretty_js_reference.as_str(),
            pretty_js_ranking,
            "\n",
        );
        whatever!("Difference detected between computed ranking and reference ranking")
    }
    Ok(())
}

pub fn run_with_settings(settings: &RunSettings) -> GapResult<SeverityResult> {
    let result = score_sources(settings)?;

    let geo = match &settings.geo_lookup {
        Some(p) => Some(geo::read_geo_lookup(p)?),
        None => None,
    };

    // Render everything before writing anything.
    let ranked_js: JSValue = export::ranked_to_json(&result.ranked);
    let pretty_js_ranking = serde_json::to_string_pretty(&ranked_js).context(ParsingJsonSnafu {})?;
    let critical_all = critical_extract(&result.ranked, result.ranked.len());
    let critical_csv = match &settings.critical_out {
        Some(p) => {
            let top: Vec<CriticalEntry> =
                critical_all.iter().take(settings.top_n).cloned().collect();
            Some((p, export::critical_to_csv(&top, geo.as_ref(), p)?))
        }
        None => None,
    };
    let summary = match &settings.summary_out {
        Some(p) => {
            let js = export::summary_to_json(&result, &critical_all, geo.as_ref());
            let s = serde_json::to_string_pretty(&js).context(ParsingJsonSnafu {})?;
            Some((p, s))
        }
        None => None,
    };

    // The reference ranking, if provided for comparison
    if let Some(reference_path) = &settings.reference {
        check_reference(reference_path, &pretty_js_ranking)?;
    }

    let mut outputs: Vec<(&Path, &[u8])> = Vec::new();
    match settings.ranked_out.as_deref() {
        None | Some("stdout") => println!("{}", pretty_js_ranking),
        Some(p) => outputs.push((Path::new(p), pretty_js_ranking.as_bytes())),
    }
    if let Some((p, bytes)) = &critical_csv {
        outputs.push((p.as_path(), bytes.as_slice()));
    }
    if let Some((p, s)) = &summary {
        outputs.push((p.as_path(), s.as_bytes()));
    }
    export::write_outputs(&outputs)?;
    info!(
        "Ranked {} postal codes ({} events, {} load entries)",
        result.ranked.len(),
        result.stage_counts.events,
        result.stage_counts.load_entries
    );

    Ok(result)
}

pub fn run(args: &Args) -> GapResult<()> {
    let settings = build_settings(args)?;
    run_with_settings(&settings)?;
    Ok(())
}

#[cfg(test)]
fn run_ranking_test(test_name: &str, config_lpath: &str, reference_lpath: &str) {
    let test_dir = option_env!("GAPSCORE_TEST_DIR")
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{}/tests/data", env!("CARGO_MANIFEST_DIR")));
    info!("Running test {}", test_name);
    let args = Args {
        config: Some(format!("{}/{}/{}", test_dir, test_name, config_lpath)),
        reference: Some(format!("{}/{}/{}", test_dir, test_name, reference_lpath)),
        ..Args::default()
    };
    if let Err(e) = run(&args) {
        panic!("Test {} failed: {}", test_name, e);
    }
}

#[cfg(test)]
pub fn test_wrapper(test_name: &str) {
    run_ranking_test(
        test_name,
        format!("{}_config.json", test_name).as_str(),
        format!("{}_expected_ranking.json", test_name).as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn settings_for(root: &Path) -> RunSettings {
        let args = Args {
            input: Some(root.display().to_string()),
            ..Args::default()
        };
        build_settings(&args).unwrap()
    }

    #[test]
    fn two_pincodes() {
        test_wrapper("two_pincodes");
    }

    #[test]
    fn legacy_calendar_decay() {
        test_wrapper("legacy_calendar_decay");
    }

    #[test]
    fn discovers_category_directories() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("Enrolment/a.csv"), b"pincode,Month,age_0_5\n");
        write(&root.join("Biometric/b.csv"), b"pincode,Month,bio_age_5_17\n");
        write(&root.join("notes/c.csv"), b"x\n");
        let settings = settings_for(root);
        let mut categories: Vec<Category> = settings.sources.iter().map(|s| s.category).collect();
        categories.sort();
        assert_eq!(categories, vec![Category::Enrolment, Category::Biometric]);
        assert_eq!(settings.rules, SeverityRules::DEFAULT_RULES);
        assert_eq!(settings.top_n, DEFAULT_TOP_N);
        assert_eq!(settings.ranked_out, None);
    }

    #[test]
    fn end_to_end_with_broken_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("Enrolment/e1.csv"),
            b"date,state,district,pincode,age_0_5,age_5_17,age_18_greater\n\
              01-12-2025,Delhi,New Delhi,110001,20,0,0\n\
              01-11-2025,Delhi,New Delhi,110001.0,10,5,1\n\
              02-12-2025,Goa,North Goa,403001,1,0,0\n\
              02-12-2025,Goa,North Goa,40300A,100,100,100\n",
        );
        // Latin-1 encoded, semicolon separated.
        let mut latin1: Vec<u8> = b"Month;district;pin;demo_age_5_17;demo_age_17_\n".to_vec();
        latin1.extend_from_slice(b"December;Bh\xe9r;560001;4;2\n");
        write(&root.join("Demographics/d1.csv"), &latin1);
        // No postal code anywhere: skipped.
        write(
            &root.join("Demographics/d2.csv"),
            b"Month,demo_age_5_17\nDecember,5\n",
        );
        write(
            &root.join("Campaigns/c1.csv"),
            b"pincode,camp_name\n403001,Camp A\n",
        );

        let out_dir = tempdir().unwrap();
        let mut settings = settings_for(root);
        settings.ranked_out = Some(out_dir.path().join("ranked.json").display().to_string());
        settings.critical_out = Some(out_dir.path().join("top.csv"));
        settings.summary_out = Some(out_dir.path().join("summary.json"));
        settings.top_n = 2;

        let result = run_with_settings(&settings).unwrap();
        let codes: Vec<&str> = result
            .ranked
            .iter()
            .map(|s| s.postal_code.as_str())
            .collect();
        assert_eq!(result.ranked.len(), 3);
        assert!(codes.contains(&"560001"));
        assert!(!codes.iter().any(|c| c.starts_with("40300") && *c != "403001"));
        assert_eq!(result.stage_counts.campaign_entries, 1);

        let ranked: JSValue =
            serde_json::from_str(&fs::read_to_string(out_dir.path().join("ranked.json")).unwrap())
                .unwrap();
        let records = ranked.as_array().unwrap();
        assert_eq!(records.len(), 3);
        for r in records {
            assert!(is_valid_postal_code(r["postal_code"].as_str().unwrap()));
            assert!(r["z_score"].as_f64().unwrap().is_finite());
        }
        assert_eq!(records[0]["postal_code"], "110001");

        let top = fs::read_to_string(out_dir.path().join("top.csv")).unwrap();
        let lines: Vec<&str> = top.lines().collect();
        assert_eq!(lines[0], "pincode,severity,criticality_index");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("110001,"));
        assert!(lines[1].ends_with(",100.00"));

        let summary: JSValue = serde_json::from_str(
            &fs::read_to_string(out_dir.path().join("summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["population"]["count"], 3);
        assert_eq!(summary["severity_distribution"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn runs_are_idempotent() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for (i, code) in ["110001", "110002", "110003", "560001"].iter().enumerate() {
            write(
                &root.join(format!("Enrolment/e{}.csv", i)),
                format!(
                    "Month,pincode,age_0_5,age_18_greater\nJanuary,{},{},3\nMarch,{},2,{}\n",
                    code,
                    i * 7,
                    code,
                    i + 1
                )
                .as_bytes(),
            );
        }
        let settings = settings_for(root);
        let a = score_sources(&settings).unwrap();
        let b = score_sources(&settings).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ranked.len(), 4);
    }

    #[test]
    fn no_valid_records_is_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("Enrolment/e1.csv"),
            b"Month,pincode,age_0_5\nDecember,11000A,3\nDecember,12,4\n",
        );
        let settings = settings_for(root);
        let res = score_sources(&settings);
        assert!(matches!(res, Err(GapError::NoValidRecords { .. })));
    }

    #[test]
    fn missing_input_is_reported() {
        let res = build_settings(&Args::default());
        assert!(matches!(res, Err(GapError::MissingInput {})));
    }

    #[test]
    fn command_line_overrides_config() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("run_config.json");
        write(
            &config,
            br#"{"outputSettings": {"topN": 5}, "rules": {"preset": "legacy"}}"#,
        );
        let args = Args {
            config: Some(config.display().to_string()),
            preset: Some("default".to_string()),
            aggregation: Some("calendarDecay".to_string()),
            positive_only: true,
            top_n: Some(7),
            ..Args::default()
        };
        let settings = build_settings(&args).unwrap();
        assert_eq!(
            settings.rules,
            SeverityRules {
                aggregation: TemporalAggregation::CalendarDecay(CALENDAR_DECAY_WEIGHTS),
                positive_z_only: true,
                ..SeverityRules::DEFAULT_RULES
            }
        );
        assert_eq!(settings.top_n, 7);

        let args = Args {
            config: Some(config.display().to_string()),
            ..Args::default()
        };
        let settings = build_settings(&args).unwrap();
        assert_eq!(settings.rules, SeverityRules::LEGACY_RULES);
        assert_eq!(settings.top_n, 5);
    }

    #[test]
    fn reference_mismatch_writes_nothing() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("Enrolment/e1.csv"),
            b"Month,pincode,age_0_5\nDecember,110001,20\nDecember,400001,0\n",
        );
        let reference = root.join("reference.json");
        write(&reference, b"[]");

        let out_dir = tempdir().unwrap();
        let ranked = out_dir.path().join("ranked.json");
        let summary = out_dir.path().join("summary.json");
        let mut settings = settings_for(root);
        settings.ranked_out = Some(ranked.display().to_string());
        settings.summary_out = Some(summary.clone());
        settings.reference = Some(reference.display().to_string());

        assert!(run_with_settings(&settings).is_err());
        assert!(!ranked.exists());
        assert!(!summary.exists());
        assert_eq!(fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn reference_mismatch_fails() {
        let dir = tempdir().unwrap();
        let reference = dir.path().join("ref.json");
        write(&reference, b"[]");
        assert!(check_reference(reference.to_str().unwrap(), "[]").is_ok());
        assert!(check_reference(reference.to_str().unwrap(), "[\n  1\n]").is_err());
    }
}
