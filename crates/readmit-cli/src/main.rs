//! Readmit: hospital readmission risk scoring.
//! Entry point for the `readmit` binary.

mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use readmit_common::EngineConfig;
use readmit_engine::{
    ArtifactStore, Dataset, RawRecord, RawValue, ScoringService, TemplateSummarizer, TrainingPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "readmit", version, about = "Hospital readmission risk scoring and explanation")]
struct Cli {
    /// Engine configuration file (TOML, or JSON by extension)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Artifact directory; overrides `artifacts.dir`
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `readmit_engine=debug,info`; overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train every model on a labelled CSV and write the artifacts
    Train {
        /// Encounter CSV with an outcome column
        data: PathBuf,
    },
    /// Score one or more patient records
    Predict {
        #[command(flatten)]
        input: RecordArgs,
        /// Add a narrative summary to each prediction
        #[arg(long)]
        explain: bool,
    },
    /// Measure the served model on a labelled CSV
    Evaluate {
        data: PathBuf,
    },
    /// Print gain-based global feature importance
    Importance {
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
    /// Rescore a record with one field changed
    Counterfactual {
        #[command(flatten)]
        input: RecordArgs,
        /// Field to change
        #[arg(long)]
        field: String,
        /// New value; numbers are parsed, `null` clears the field
        #[arg(long)]
        value: String,
    },
}

#[derive(Debug, Args)]
struct RecordArgs {
    /// Inline JSON object or array of objects
    #[arg(long, conflicts_with = "input")]
    record: Option<String>,
    /// File containing a JSON object or array of objects
    #[arg(long)]
    input: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordInput {
    Many(Vec<RawRecord>),
    One(RawRecord),
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // Logs go to stderr so stdout carries only command output
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn read_records(args: &RecordArgs) -> anyhow::Result<Vec<RawRecord>> {
    let text = match (&args.record, &args.input) {
        (Some(inline), _) => inline.clone(),
        (None, Some(path)) => {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
        }
        (None, None) => anyhow::bail!("pass a record with --record or --input"),
    };
    let parsed: RecordInput = serde_json::from_str(&text).context("records must be a JSON object or array of objects")?;
    Ok(match parsed {
        RecordInput::Many(records) => records,
        RecordInput::One(record) => vec![record],
    })
}

fn parse_value(raw: &str) -> RawValue {
    if raw.eq_ignore_ascii_case("null") {
        return RawValue::Null;
    }
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => RawValue::Number(v),
        _ => RawValue::Text(raw.to_string()),
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_service(store: &ArtifactStore, config: &EngineConfig) -> anyhow::Result<ScoringService> {
    ScoringService::load(store, config)
        .with_context(|| format!("loading artifacts from {}", store.dir().display()))
}

fn train(data: &Path, store: &ArtifactStore, config: EngineConfig) -> anyhow::Result<()> {
    let dataset = Dataset::from_csv_path(data, &config.dataset)
        .with_context(|| format!("loading training data from {}", data.display()))?;
    let output = TrainingPipeline::new(config).run_and_save(&dataset, store)?;
    let report = &output.report;
    info!(dir = %store.dir().display(), run_id = %report.identity.run_id, "artifacts written");
    print_json(&json!({
        "run_id": report.identity.run_id,
        "artifacts": store.dir(),
        "rows": report.n_rows,
        "excluded_rows": report.excluded_rows,
        "gbm_auc": report.gbm.validation.auc,
        "linear_auc": report.linear.validation.auc,
        "calibrator_adopted": report.calibration.adopted,
        "stacker_adopted": report.stacking.adopted,
        "served_mode": report.served_mode,
        "served": report.served,
        "bands": report.bands,
    }))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let (mut config, source) = config::discover(cli.config.as_deref())?;
    match source.path() {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No configuration file found; using defaults"),
    }
    if let Some(dir) = &cli.artifacts {
        config.artifacts.dir = dir.to_string_lossy().into_owned();
    }
    let store = ArtifactStore::new(&config.artifacts.dir);

    match cli.command {
        Command::Train { data } => train(&data, &store, config),
        Command::Predict { input, explain } => {
            let service = load_service(&store, &config)?;
            let records = read_records(&input)?;
            if explain {
                let summarizer = TemplateSummarizer::new(config.inference.summary_drivers);
                let explanations: Vec<_> = records.iter().map(|r| service.explain(r, &summarizer)).collect();
                print_json(&explanations)
            } else {
                print_json(&service.predict_batch(&records))
            }
        }
        Command::Evaluate { data } => {
            let service = load_service(&store, &config)?;
            let dataset = Dataset::from_csv_path(&data, &config.dataset)
                .with_context(|| format!("loading evaluation data from {}", data.display()))?;
            let missing: Vec<&str> = service
                .manifest()
                .names()
                .filter(|name| dataset.manifest().index_of(name).is_none())
                .collect();
            if !missing.is_empty() {
                warn!("evaluation data lacks model features {missing:?}; they are scored as missing");
            }
            print_json(&service.evaluate(&dataset, config.calibration.ece_bins)?)
        }
        Command::Importance { top } => {
            let service = load_service(&store, &config)?;
            let ranked: Vec<_> = service.global_importance().into_iter().take(top).collect();
            print_json(&ranked)
        }
        Command::Counterfactual { input, field, value } => {
            let service = load_service(&store, &config)?;
            let replacement = parse_value(&value);
            let results = read_records(&input)?
                .iter()
                .map(|r| service.counterfactual(r, &field, replacement.clone()))
                .collect::<readmit_common::Result<Vec<_>>>()?;
            print_json(&results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("7"), RawValue::Number(7.0));
        assert_eq!(parse_value(" 2.5 "), RawValue::Number(2.5));
        assert_eq!(parse_value("null"), RawValue::Null);
        assert_eq!(parse_value("[70-80)"), RawValue::Text("[70-80)".into()));
        assert_eq!(parse_value("NaN"), RawValue::Text("NaN".into()));
    }

    #[test]
    fn test_read_records_object_and_array() {
        let one = RecordArgs { record: Some(r#"{"age": "[70-80)", "num_medications": 12}"#.into()), input: None };
        let records = read_records(&one).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("num_medications"), Some(&RawValue::Number(12.0)));

        let many = RecordArgs { record: Some(r#"[{"race": "Asian"}, {"race": null}]"#.into()), input: None };
        let records = read_records(&many).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("race"), Some(&RawValue::Null));

        assert!(read_records(&RecordArgs { record: None, input: None }).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "readmit",
            "--artifacts",
            "out",
            "counterfactual",
            "--record",
            "{}",
            "--field",
            "number_inpatient",
            "--value",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.artifacts, Some(PathBuf::from("out")));
        assert!(matches!(cli.command, Command::Counterfactual { ref field, .. } if field == "number_inpatient"));
    }
}
