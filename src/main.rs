use anyhow::{bail, Context, Result};
use spind::{CsvOptions, DiscoveryConfig, PindSink, RelationInput, SpindEngine, TextReportSink};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: spind [--config <file.json>] [--separator <char>] [--quote <char>] \
[--escape <char>|none] [--keep-leading-whitespace] [--no-header] [--null <string>] \
<name>=<file.csv> [<name>=<file.csv> ...]";

fn single_byte(flag: &str, value: &str) -> Result<u8> {
    match value.as_bytes() {
        [byte] => Ok(*byte),
        _ => bail!("{} must be a single byte, got '{}'", flag, value),
    }
}

struct Args {
    config: Option<PathBuf>,
    csv: CsvOptions,
    relations: Vec<(String, PathBuf)>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        csv: CsvOptions::default(),
        relations: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(iter.next().context(USAGE)?)),
            "--separator" => args.csv.separator = single_byte("separator", &iter.next().context(USAGE)?)?,
            "--quote" => args.csv.quote = single_byte("quote", &iter.next().context(USAGE)?)?,
            "--escape" => {
                let escape = iter.next().context(USAGE)?;
                args.csv.escape = match escape.as_str() {
                    "none" => None,
                    other => Some(single_byte("escape", other)?),
                };
            }
            "--keep-leading-whitespace" => args.csv.ignore_leading_whitespace = false,
            "--no-header" => args.csv.has_header = false,
            "--null" => args.csv.null_string = iter.next().context(USAGE)?,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            relation => {
                let (name, path) = relation
                    .split_once('=')
                    .with_context(|| format!("expected <name>=<file>, got '{}'\n{}", relation, USAGE))?;
                args.relations.push((name.to_string(), PathBuf::from(path)));
            }
        }
    }
    if args.relations.is_empty() {
        bail!(USAGE);
    }
    Ok(args)
}

/// Prints to stdout and mirrors to the text report when results are enabled
struct CliSink {
    report: Option<TextReportSink>,
}

impl PindSink for CliSink {
    fn layer_finished(
        &mut self,
        layer: usize,
        relations: &[spind::Relation],
        attributes: &[spind::Attribute],
    ) -> spind::SpindResult<()> {
        if let Some(report) = self.report.as_mut() {
            report.layer_finished(layer, relations, attributes)?;
        }
        for pind in spind::result_format::layer_pinds(relations, attributes) {
            println!("{}", pind);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => DiscoveryConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DiscoveryConfig::default(),
    };

    let inputs = args
        .relations
        .iter()
        .map(|(name, path)| {
            RelationInput::csv(name.clone(), path, &args.csv)
                .with_context(|| format!("failed to open relation {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let report = config.result_dir.as_ref().map(TextReportSink::new);
    let engine = SpindEngine::new(config)?;
    let mut sink = CliSink { report };
    let summary = engine.run(inputs, &mut sink)?;

    info!(
        pinds = summary.pind_count,
        layers = summary.metrics.layers.len(),
        elapsed_ms = summary.metrics.total_ms,
        "Done"
    );
    if let Some(path) = summary.metrics_file {
        info!(metrics = %path.display(), "Wrote run metrics");
    }
    Ok(())
}
