//! CLI entrypoint for the mheap harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mheap_core::{HeapConfig, HeapLogLevel};
use mheap_harness::churn::{ChurnConfig, ChurnSpace, parse_seed, run_churn};
use mheap_harness::scenarios::{self, SCENARIOS};
use mheap_harness::structured_log::{ArtifactIndex, LogEmitter, LogEntry, Outcome};

/// Scenario and churn tooling for mheap.
#[derive(Debug, Parser)]
#[command(name = "mheap-harness")]
#[command(about = "Scenario runner and diagnostics for the mheap allocation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one scenario, or `all`.
    Run {
        #[arg(long, default_value = "all")]
        scenario: String,
        /// JSONL evidence log path; heap decision records are forwarded into it.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Artifact index path (requires `--log`).
        #[arg(long, requires = "log")]
        artifact_index: Option<PathBuf>,
        /// Run identifier stamped on every log line.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// List scenario names and summaries.
    List,
    /// Seeded random alloc/free churn against a large-object space.
    Churn {
        #[arg(long, value_enum, default_value = "free-list")]
        space: ChurnSpace,
        #[arg(long, default_value_t = 10_000)]
        ops: u64,
        /// Seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Largest request in pages.
        #[arg(long, default_value_t = 8)]
        max_pages: usize,
    },
    /// Print the heap configuration resolved from `MHEAP_*` variables.
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            scenario,
            log,
            artifact_index,
            run_id,
        } => {
            let reports = if scenario == "all" {
                scenarios::run_all()?
            } else {
                vec![scenarios::run_scenario(&scenario)?]
            };

            if let Some(path) = &log {
                let mut emitter = LogEmitter::to_file(path, &run_id)?;
                for report in &reports {
                    for record in &report.heap_log {
                        emitter.emit_entry(LogEntry::from_heap_record(record).with_scenario(report.name))?;
                    }
                    let outcome = if report.passed { Outcome::Pass } else { Outcome::Fail };
                    let level = if report.passed { HeapLogLevel::Info } else { HeapLogLevel::Error };
                    emitter.emit_entry(
                        LogEntry::new(String::new(), level, "scenario_result")
                            .with_scenario(report.name)
                            .with_outcome(outcome)
                            .with_duration_us(report.duration_us)
                            .with_details(serde_json::to_value(report)?),
                    )?;
                }
                emitter.flush()?;
                eprintln!("Wrote {} log entries to {}", emitter.written(), path.display());

                if let Some(index_path) = &artifact_index {
                    let mut index = ArtifactIndex::new(&run_id);
                    index.add_file(path, "log")?;
                    std::fs::write(index_path, index.to_json()?)?;
                    eprintln!("Wrote artifact index to {}", index_path.display());
                }
            }

            println!("{}", serde_json::to_string_pretty(&reports)?);
            let failed: Vec<&str> = reports.iter().filter(|r| !r.passed).map(|r| r.name).collect();
            if !failed.is_empty() {
                for report in reports.iter().filter(|r| !r.passed) {
                    for check in report.failed_checks() {
                        eprintln!("FAIL {}: {}: {}", report.name, check.name, check.detail);
                    }
                }
                return Err(format!("{} scenario(s) failed: {}", failed.len(), failed.join(", ")).into());
            }
            eprintln!("{} scenario(s) passed", reports.len());
        }
        Command::List => {
            for spec in SCENARIOS {
                println!("{:<24} {}", spec.name, spec.summary);
            }
        }
        Command::Churn {
            space,
            ops,
            seed,
            max_pages,
        } => {
            let config = ChurnConfig {
                max_pages,
                ..ChurnConfig::new(space, ops, parse_seed(&seed)?)
            };
            let report = run_churn(&config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Config => {
            let config = HeapConfig::from_env()?;
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
