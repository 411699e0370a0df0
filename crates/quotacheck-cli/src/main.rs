//! quotacheck: compare cloud resource usage against service limits.
//!
//! Exit codes for `check`: 0 all OK, 1 any critical, 2 any warning,
//! 3 any usage unknown. Errors before collection also exit with 3.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use quotacheck_core::{CollectionOutcome, CollectionReport, ThresholdStatus, Thresholds};
use quotacheck_runtime::transport::HttpTransportFactory;
use quotacheck_runtime::{Checker, CheckerBuilder, CheckerConfig, LimitStatus};

#[derive(Debug, Parser)]
#[command(name = "quotacheck", about = "Check cloud resource usage against service limits", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Collect every limit and report usage against thresholds
    Check {
        #[command(flatten)]
        target: Target,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        /// Warning threshold percentage
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        warning: Option<u8>,

        /// Critical threshold percentage
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        critical: Option<u8>,
    },

    /// Collect and print current usage
    Usage {
        #[command(flatten)]
        target: Target,

        /// Only collect this limit
        #[arg(long)]
        limit: Option<String>,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List configured limits without contacting the provider
    Limits {
        /// Config file (YAML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

#[derive(Debug, Args)]
struct Target {
    /// Config file (YAML, or JSON by extension)
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured region
    #[arg(long)]
    region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct UsageRow<'a> {
    limit: &'a str,
    usage: Option<u64>,
    exchanges: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(3)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("tracing init failed: {}", e);
    }
}

async fn run(command: Command) -> Result<u8> {
    match command {
        Command::Check {
            target,
            format,
            warning,
            critical,
        } => {
            let config = load_config(&target)?;
            let thresholds = Thresholds::new(
                warning.unwrap_or(config.thresholds.warning),
                critical.unwrap_or(config.thresholds.critical),
            );
            anyhow::ensure!(
                thresholds.warning <= thresholds.critical,
                "warning threshold ({}) above critical threshold ({})",
                thresholds.warning,
                thresholds.critical
            );

            let checker = build_checker(config, Some(thresholds))?;

            let reports = checker.collect_all().await?;
            let statuses = checker.statuses();
            print_statuses(&statuses, &reports, format)?;
            Ok(exit_code(&statuses))
        }

        Command::Usage {
            target,
            limit,
            format,
        } => {
            let checker = build_checker(load_config(&target)?, None)?;
            let reports = match limit {
                Some(name) => vec![checker.collect(&name).await?],
                None => checker.collect_all().await?,
            };
            print_usage(&checker, &reports, format)?;
            Ok(0)
        }

        Command::Limits { config, format } => {
            let config = CheckerConfig::from_file(&config)
                .with_context(|| format!("failed to load config '{}'", config.display()))?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&config.limits)?),
                Format::Text => {
                    for limit in &config.limits {
                        println!(
                            "{:<28} {:<10} {:<28} {}",
                            limit.name,
                            limit.service,
                            limit.action,
                            limit.quota.map(|q| q.to_string()).unwrap_or_else(|| "-".to_string())
                        );
                    }
                }
            }
            Ok(0)
        }
    }
}

fn load_config(target: &Target) -> Result<CheckerConfig> {
    let mut config = CheckerConfig::from_file(&target.config)
        .with_context(|| format!("failed to load config '{}'", target.config.display()))?;
    if let Some(region) = &target.region {
        config.region = Some(region.clone());
    }
    tracing::info!(
        path = %target.config.display(),
        limits = config.limits.len(),
        region = ?config.region,
        "Loaded config"
    );
    Ok(config)
}

fn build_checker(config: CheckerConfig, thresholds: Option<Thresholds>) -> Result<Checker> {
    let mut builder = CheckerBuilder::from_config(config)
        .context("failed to resolve region and credentials")?
        .transport_factory(Arc::new(HttpTransportFactory));
    if let Some(thresholds) = thresholds {
        builder = builder.thresholds(thresholds);
    }
    builder.build().context("failed to build checker")
}

fn print_statuses(statuses: &[LimitStatus], reports: &[CollectionReport], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(statuses)?),
        Format::Text => {
            for status in statuses {
                println!(
                    "{:<28} {:<10} {:>10} / {:<10} {}",
                    status.name,
                    status.service,
                    status.usage.map(|u| u.to_string()).unwrap_or_else(|| "<unknown>".to_string()),
                    status.quota.map(|q| q.to_string()).unwrap_or_else(|| "-".to_string()),
                    status.status
                );
            }
            print_failures(reports);
        }
    }
    Ok(())
}

fn print_usage(checker: &Checker, reports: &[CollectionReport], format: Format) -> Result<()> {
    let rows: Vec<UsageRow<'_>> = reports
        .iter()
        .map(|report| UsageRow {
            limit: &report.limit,
            usage: checker.registry().get(&report.limit).and_then(|u| u.count()),
            exchanges: report.exchanges(),
            error: failure_reason(&report.outcome),
        })
        .collect();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            for row in &rows {
                println!(
                    "{:<28} {}",
                    row.limit,
                    row.usage.map(|u| u.to_string()).unwrap_or_else(|| "<unknown>".to_string())
                );
            }
            print_failures(reports);
        }
    }
    Ok(())
}

fn print_failures(reports: &[CollectionReport]) {
    for report in reports {
        if let Some(reason) = failure_reason(&report.outcome) {
            tracing::debug!(limit = %report.limit, exchanges = report.exchanges(), "Collection failed");
            eprintln!("{}: {}", report.limit, reason);
        }
    }
}

fn failure_reason(outcome: &CollectionOutcome) -> Option<String> {
    match outcome {
        CollectionOutcome::Success(_) => None,
        CollectionOutcome::Failure(e) => Some(e.to_string()),
        CollectionOutcome::PartialUnknown { reason } => Some(reason.clone()),
    }
}

/// Worst status wins; unknown usage only matters when nothing is over a
/// threshold.
fn exit_code(statuses: &[LimitStatus]) -> u8 {
    if statuses.iter().any(|s| s.status == ThresholdStatus::Critical) {
        1
    } else if statuses.iter().any(|s| s.status == ThresholdStatus::Warning) {
        2
    } else if statuses.iter().any(|s| s.usage.is_none()) {
        3
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(usage: Option<u64>, status: ThresholdStatus) -> LimitStatus {
        LimitStatus {
            name: "VPCs".to_string(),
            service: "ec2".to_string(),
            usage,
            quota: Some(5),
            status,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&[]), 0);
        assert_eq!(exit_code(&[status(Some(1), ThresholdStatus::Ok)]), 0);
        assert_eq!(
            exit_code(&[
                status(None, ThresholdStatus::Unknown),
                status(Some(4), ThresholdStatus::Warning)
            ]),
            2
        );
        assert_eq!(
            exit_code(&[
                status(Some(4), ThresholdStatus::Warning),
                status(Some(5), ThresholdStatus::Critical)
            ]),
            1
        );
        assert_eq!(exit_code(&[status(None, ThresholdStatus::Unknown)]), 3);
    }

    #[test]
    fn test_parse_check() {
        let cli = Cli::try_parse_from([
            "quotacheck", "-vv", "check", "-c", "limits.yaml", "--region", "eu-west-1", "--format", "json",
            "--warning", "60",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Check {
                target,
                format,
                warning,
                critical,
            } => {
                assert_eq!(target.config, PathBuf::from("limits.yaml"));
                assert_eq!(target.region.as_deref(), Some("eu-west-1"));
                assert_eq!(format, Format::Json);
                assert_eq!(warning, Some(60));
                assert_eq!(critical, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_threshold_range_enforced() {
        assert!(Cli::try_parse_from(["quotacheck", "check", "-c", "x.yaml", "--critical", "150"]).is_err());
    }

    #[test]
    fn test_load_config_overrides_region() {
        let target = Target {
            config: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/limits.example.yaml")),
            region: Some("eu-west-1".to_string()),
        };

        let config = load_config(&target).unwrap();

        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.limits.len(), 4);
    }

    #[test]
    fn test_failure_reason() {
        assert_eq!(failure_reason(&CollectionOutcome::Success(1)), None);
        assert_eq!(
            failure_reason(&CollectionOutcome::PartialUnknown {
                reason: "pass exceeded 1s".to_string()
            }),
            Some("pass exceeded 1s".to_string())
        );
    }
}
