use clap::Parser;

/// This is a service-gap severity scoring program.
#[derive(Parser, Debug, Clone, Default)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path, optional) The JSON file describing the run: sources, rules and outputs.
    /// All the other options override what this file says.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,

    /// (directory path) The root of the input tree. It contains one subdirectory per category
    /// (enrolment, demographics, biometric, campaigns). Setting this option overrides the
    /// directory implied by the --config option.
    #[clap(short, long, value_parser)]
    pub input: Option<String>,

    /// (file path, 'stdout' or empty) If specified, the ranked postal codes will be written in
    /// JSON format to the given location.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// (file path) A reference file containing a ranking in JSON format. If provided, gapscore will
    /// check that the computed ranking matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (file path) If specified, the top-N critical postal codes are written in CSV format to
    /// this location.
    #[clap(long, value_parser)]
    pub critical_out: Option<String>,

    /// (file path) If specified, the severity summary is written in JSON format to this location.
    #[clap(long, value_parser)]
    pub summary_out: Option<String>,

    /// (default 200) The number of postal codes in the critical extract.
    #[clap(long, value_parser)]
    pub top_n: Option<usize>,

    /// (file path) A postal code lookup table (pincode, district, statename, latitude, longitude).
    /// It adds districts and states to the critical extract and to the summary.
    #[clap(long, value_parser)]
    pub geo: Option<String>,

    /// (default or legacy) The set of rules to start from.
    #[clap(long, value_parser)]
    pub preset: Option<String>,

    /// (recursiveEma or calendarDecay) How the monthly loads are collapsed into one score.
    #[clap(long, value_parser)]
    pub aggregation: Option<String>,

    /// (campaignCapacity or transactionVolume) How supply dampens the demand.
    #[clap(long, value_parser)]
    pub denominator: Option<String>,

    /// If passed as an argument, only the postal codes with a positive z-score are kept.
    #[clap(long, takes_value = false)]
    pub positive_only: bool,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
