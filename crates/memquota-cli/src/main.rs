//! memquota CLI: run, validate and explain quota-instrumented programs.

use clap::{Args, Parser, Subcommand};
use memquota_core::config::EngineConfig;
use memquota_core::manifest::RunOutcome;
use memquota_exec::{Engine, HandlerRegistry};
use memquota_mem::{CountingAllocator, ThreadAllocCounter};
use memquota_planner::{
    parse_yaml_program, strip_instrumentation, to_yaml_program, ParsedProgram, QuotaSection,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator::system();

#[derive(Parser)]
#[command(name = "memquota")]
#[command(about = "Run scripts under a per-thread memory allocation quota", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument and execute a program
    Run {
        /// Path to the program YAML file
        #[arg(short, long)]
        program: PathBuf,

        #[command(flatten)]
        quota: QuotaArgs,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that a program parses, its quota is valid and its handler resolves
    Validate {
        /// Path to the program YAML file
        #[arg(short, long)]
        program: PathBuf,

        #[command(flatten)]
        quota: QuotaArgs,
    },

    /// List every point where a quota check would be injected
    Explain {
        /// Path to the program YAML file
        #[arg(short, long)]
        program: PathBuf,

        #[command(flatten)]
        quota: QuotaArgs,

        /// Also print the instrumented program as YAML
        #[arg(long)]
        emit: bool,
    },
}

/// Command-line quota overrides; highest precedence.
#[derive(Args, Debug, Default, Clone)]
struct QuotaArgs {
    /// Allocation limit in bytes, net of the baseline
    #[arg(long)]
    limit: Option<i64>,

    /// Type that owns the infringement handler
    #[arg(long)]
    handler_type: Option<String>,

    /// Handler method name on that type
    #[arg(long)]
    handler_method: Option<String>,

    /// Entry routine name on the script class
    #[arg(long)]
    entry: Option<String>,

    /// Accept output of `explain --emit`: drop its quota statements and
    /// instrument again with the resolved quota
    #[arg(long)]
    instrumented: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            program,
            quota,
            json,
        } => match run_program(&program, &quota, json) {
            Ok(true) => {}
            Ok(false) => std::process::exit(2),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Validate { program, quota } => {
            if let Err(e) = validate_program(&program, &quota) {
                eprintln!("Validation failed: {}", e);
                std::process::exit(1);
            }
            println!("✓ Program is valid");
        }
        Commands::Explain {
            program,
            quota,
            emit,
        } => {
            if let Err(e) = explain_program(&program, &quota, emit) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

/// Defaults < environment < the program's `quota:` section < command line.
fn resolve_config(mut cfg: EngineConfig, doc: &QuotaSection, cli: &QuotaArgs) -> EngineConfig {
    doc.apply(&mut cfg.quota);
    if let Some(limit) = cli.limit {
        cfg.quota.limit_bytes = limit;
    }
    if let Some(t) = &cli.handler_type {
        cfg.quota.handler_type = t.clone();
    }
    if let Some(m) = &cli.handler_method {
        cfg.quota.handler_method = m.clone();
    }
    if let Some(entry) = &cli.entry {
        cfg.entry_method = entry.clone();
    }
    cfg
}

fn load(
    path: &Path,
    quota: &QuotaArgs,
) -> Result<(ParsedProgram, Engine), Box<dyn std::error::Error>> {
    let yaml_content = fs::read_to_string(path)?;
    let mut parsed = parse_yaml_program(&yaml_content)?;
    if quota.instrumented {
        let removed = strip_instrumentation(&mut parsed.program);
        tracing::debug!(removed, path = %path.display(), "stripped quota statements");
    }
    let cfg = resolve_config(EngineConfig::from_env(), &parsed.quota, quota);
    let engine = Engine::new(cfg, HandlerRegistry::builtin(), Arc::new(ThreadAllocCounter));
    Ok((parsed, engine))
}

/// Returns `Ok(false)` when the quota handler stopped the script.
fn run_program(
    path: &Path,
    quota: &QuotaArgs,
    json: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let (parsed, engine) = load(path, quota)?;
    let prepared = engine.prepare(parsed.program)?;
    let (result, report) = engine.run_with_report(&prepared);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    match result {
        Ok(value) => {
            if !json {
                println!("✓ Script completed: {}", value);
                print_stats(&report);
            }
            Ok(true)
        }
        Err(e) if matches!(report.outcome, RunOutcome::Stopped { .. }) => {
            eprintln!("✗ {}", e);
            if !json {
                print_stats(&report);
            }
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_stats(report: &memquota_core::manifest::RunReport) {
    println!("  Duration: {}ms", report.duration_ms());
    println!("  Program hash: {}", report.program_hash);
    println!("  Injection points: {}", report.injection_points);
    if let Some(q) = &report.quota {
        println!(
            "  Limit: {} bytes ({:.2} MB)",
            q.limit,
            q.limit as f64 / 1_048_576.0
        );
        println!("  Baseline: {} bytes", q.base_usage);
        println!("  Checks: {}", q.checks);
        println!("  Maximum: {} bytes", q.maximum);
        println!("  Average: {} bytes", q.average);
    }
}

fn validate_program(path: &Path, quota: &QuotaArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (parsed, engine) = load(path, quota)?;
    let _ = engine.prepare(parsed.program)?;
    Ok(())
}

fn explain_program(
    path: &Path,
    quota: &QuotaArgs,
    emit: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (parsed, engine) = load(path, quota)?;
    let prepared = engine.prepare(parsed.program)?;
    let cfg = engine.config();

    println!("Quota Instrumentation Plan");
    println!("==========================");
    println!();
    println!(
        "Limit: {} bytes ({:.2} MB)",
        cfg.quota.limit_bytes,
        cfg.quota.limit_bytes as f64 / 1_048_576.0
    );
    println!(
        "Handler: {}.{}",
        cfg.quota.handler_type, cfg.quota.handler_method
    );
    println!(
        "Entry: {}::{}",
        prepared.entry.class, prepared.entry.method
    );
    println!("Program hash: {}", prepared.hash);
    println!();
    println!(
        "Injection Points ({} checks):",
        prepared.report.check_count()
    );
    for (i, point) in prepared.report.iter().enumerate() {
        println!("  {}. {}", i + 1, point);
    }

    if emit {
        println!();
        print!("{}", to_yaml_program(&prepared.program, Some(&cfg.quota))?);
    }

    Ok(())
}
