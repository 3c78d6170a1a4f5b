//! Command line front end for group-based segment generation.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`GROUPSEG_*`), and CLI flags. Reads each `--group` from CSV files, compresses the groups in
//! parallel and prints or persists the finalized segments.

use std::fs::File as StdFile;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::{Config, Environment, File};
use groupseg::source::{CsvFormat, CsvTimeSeries, TimeSeries, TimestampFormat};
use groupseg::telemetry::{IngestEvent, IngestEventListener};
use groupseg::{
    ingest_groups, CollectingSink, Gid, IngestConfig, ModelTypeKind, Tid, TimeSeriesGroup,
};

// ---------- CLI ----------

/// Compresses groups of time series into model-based segments.
#[derive(Parser, Debug)]
#[command(name = "groupseg", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `groupseg.toml` is loaded when it exists.
    #[arg(long, env = "GROUPSEG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Allowed deviation in percent of each value.
    #[arg(long)]
    pub error_bound: Option<f32>,

    /// Maximum rows represented by a lossless model.
    #[arg(long)]
    pub length_bound: Option<usize>,

    /// Rows after which a temporary segment is emitted (0 disables).
    #[arg(long)]
    pub maximum_latency: Option<usize>,

    /// Fraction of the average compression ratio below which groups are split (0 disables).
    #[arg(long)]
    pub dynamic_split_fraction: Option<f32>,

    /// Sampling interval of every series until its file declares another one.
    #[arg(long)]
    pub sampling_interval: Option<i32>,

    /// Group to compress as `gid:tid=path[,tid=path...]`. May be repeated.
    #[arg(long = "group", value_name = "GROUP")]
    pub groups: Vec<String>,

    /// Write the finalized segments to this file (bincode).
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Do not print segments to stdout.
    #[arg(long, default_value_t = false)]
    pub quiet: bool,

    /// Log split, join and generator events to stderr.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,

    /// Print Prometheus exposition text of the run's metrics to stderr.
    #[cfg(feature = "prometheus")]
    #[arg(long, default_value_t = false)]
    pub print_metrics: bool,
}

// ---------- File/env config (all optional for partial config) ----------

/// CSV section in config file.
#[derive(Debug, Default, serde::Deserialize)]
pub struct CsvFileConfig {
    pub separator: Option<String>,
    pub has_header: Option<bool>,
    pub timestamp_column: Option<usize>,
    pub value_column: Option<usize>,
    pub timestamp_format: Option<TimestampFormat>,
}

/// Top-level config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct GroupsegFileConfig {
    pub error_bound: Option<f32>,
    pub length_bound: Option<usize>,
    pub maximum_latency: Option<usize>,
    pub dynamic_split_fraction: Option<f32>,
    pub model_types: Option<Vec<ModelTypeKind>>,
    pub fallback_model_type: Option<ModelTypeKind>,
    pub default_sampling_interval: Option<i32>,
    pub csv: Option<CsvFileConfig>,
}

/// Load merged config. CLI overrides file/env.
fn load_config(cli: &Cli) -> Result<(IngestConfig, CsvFormat), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("groupseg.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("GROUPSEG")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: GroupsegFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut config = IngestConfig::default();
    let mut csv = CsvFormat::default();
    merge_into_config(&mut config, &mut csv, partial);

    if let Some(v) = cli.error_bound {
        config.error_bound = v;
    }
    if let Some(v) = cli.length_bound {
        config.length_bound = v;
    }
    if let Some(v) = cli.maximum_latency {
        config.maximum_latency = v;
    }
    if let Some(v) = cli.dynamic_split_fraction {
        config.dynamic_split_fraction = v;
    }
    if let Some(v) = cli.sampling_interval {
        config.default_sampling_interval = v;
    }
    if cli.verbose {
        config.event_listener = Arc::new(StderrEventListener);
    }

    config.validate().map_err(|e| e.to_string())?;
    if csv.separator.is_empty() {
        return Err("csv.separator must not be empty".to_string());
    }
    Ok((config, csv))
}

/// Merge file/env partial config. Only overwrites fields that are `Some`.
fn merge_into_config(base: &mut IngestConfig, csv: &mut CsvFormat, partial: GroupsegFileConfig) {
    if let Some(v) = partial.error_bound {
        base.error_bound = v;
    }
    if let Some(v) = partial.length_bound {
        base.length_bound = v;
    }
    if let Some(v) = partial.maximum_latency {
        base.maximum_latency = v;
    }
    if let Some(v) = partial.dynamic_split_fraction {
        base.dynamic_split_fraction = v;
    }
    if let Some(v) = partial.model_types {
        base.model_types = v;
    }
    if let Some(v) = partial.fallback_model_type {
        base.fallback_model_type = v;
    }
    if let Some(v) = partial.default_sampling_interval {
        base.default_sampling_interval = v;
    }

    if let Some(c) = partial.csv {
        if let Some(v) = c.separator {
            csv.separator = v;
        }
        if let Some(v) = c.has_header {
            csv.has_header = v;
        }
        if let Some(v) = c.timestamp_column {
            csv.timestamp_column = v;
        }
        if let Some(v) = c.value_column {
            csv.value_column = v;
        }
        if let Some(v) = c.timestamp_format {
            csv.timestamp_format = v;
        }
    }
}

// ---------- Groups ----------

/// Parsed `--group` argument.
#[derive(Debug, Clone, PartialEq)]
struct GroupArg {
    gid: Gid,
    series: Vec<(Tid, PathBuf)>,
}

fn parse_group(arg: &str) -> Result<GroupArg, String> {
    let (gid, members) = arg
        .split_once(':')
        .ok_or_else(|| format!("invalid group {:?}: expected gid:tid=path[,tid=path...]", arg))?;
    let gid = gid
        .trim()
        .parse::<Gid>()
        .map_err(|e| format!("invalid gid in group {:?}: {}", arg, e))?;
    let series = members
        .split(',')
        .map(|member| {
            let (tid, path) = member
                .split_once('=')
                .ok_or_else(|| format!("invalid series {:?} in group {}", member, gid))?;
            let tid = tid
                .trim()
                .parse::<Tid>()
                .map_err(|e| format!("invalid tid {:?} in group {}: {}", tid, gid, e))?;
            Ok((tid, PathBuf::from(path.trim())))
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(GroupArg { gid, series })
}

fn build_group(
    arg: &GroupArg,
    config: &IngestConfig,
    csv: &CsvFormat,
) -> Result<TimeSeriesGroup, String> {
    let series = arg
        .series
        .iter()
        .map(|(tid, path)| {
            if !path.exists() {
                return Err(format!("series file not found: {}", path.display()));
            }
            let series: Box<dyn TimeSeries> = Box::new(CsvTimeSeries::new(
                path,
                *tid,
                config.default_sampling_interval,
                csv.clone(),
            ));
            Ok(series)
        })
        .collect::<Result<Vec<_>, String>>()?;
    TimeSeriesGroup::new(arg.gid, series).map_err(|e| format!("group {}: {}", arg.gid, e))
}

// ---------- Logging ----------

/// Writes ingestion events to stderr, one line each.
#[derive(Debug)]
struct StderrEventListener;

impl IngestEventListener for StderrEventListener {
    fn on_event(&self, event: IngestEvent) {
        match event {
            // Far too frequent for a log line.
            IngestEvent::SegmentEmitted { .. } => {}
            IngestEvent::GroupIngestFailed { gid, error } => {
                eprintln!("group {} failed: {}", gid, error)
            }
            other => eprintln!("{:?}", other),
        }
    }
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (config, csv) = load_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;
    let group_args = cli
        .groups
        .iter()
        .map(|g| parse_group(g))
        .collect::<Result<Vec<_>, String>>()
        .map_err(|e| {
            eprintln!("config error: {}", e);
            e
        })?;

    if cli.validate_config {
        let kinds: Vec<&str> = config.model_types.iter().map(|k| k.name()).collect();
        println!("error_bound={}", config.error_bound);
        println!("length_bound={}", config.length_bound);
        println!("maximum_latency={}", config.maximum_latency);
        println!("dynamic_split_fraction={}", config.dynamic_split_fraction);
        println!("model_types={}", kinds.join(","));
        println!("fallback_model_type={}", config.fallback_model_type);
        println!("default_sampling_interval={}", config.default_sampling_interval);
        println!("csv_separator={}", csv.separator);
        println!("groups={}", group_args.len());
        return Ok(());
    }

    if group_args.is_empty() {
        eprintln!("nothing to do: pass at least one --group");
        return Err("no groups".into());
    }

    #[cfg(feature = "prometheus")]
    let prometheus = if cli.print_metrics {
        Some(groupseg::telemetry::ingest_metrics::InProcessPrometheus::install(
            std::time::Duration::from_secs(5),
        )?)
    } else {
        None
    };

    let groups = group_args
        .iter()
        .map(|arg| build_group(arg, &config, &csv))
        .collect::<Result<Vec<_>, String>>()
        .map_err(|e| {
            eprintln!("startup check failed: {}", e);
            e
        })?;

    let sink = Arc::new(CollectingSink::new());
    let results = ingest_groups(&config, groups, sink.clone())?;
    let segments = sink.take_finalized()?;

    if !cli.quiet {
        for segment in &segments {
            println!("{}", segment);
        }
    }
    if let Some(ref path) = cli.output {
        let writer = BufWriter::new(StdFile::create(path)?);
        bincode::serialize_into(writer, &segments)?;
    }

    #[cfg(feature = "prometheus")]
    if let Some(prometheus) = prometheus {
        eprint!("{}", prometheus.render());
    }

    let mut failed = 0;
    for (gid, result) in &results {
        if let Err(e) = result {
            eprintln!("group {} failed: {}", gid, e);
            failed += 1;
        }
    }
    eprintln!(
        "{} segments from {} groups ({} failed)",
        segments.len(),
        results.len(),
        failed
    );
    if failed > 0 {
        return Err(format!("{} groups failed", failed).into());
    }
    Ok(())
}
