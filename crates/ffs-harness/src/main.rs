#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffs::MountConfig;
use ffs_harness::{SCENARIOS, ScenarioConfig, load_scenario_config, run_scenario};
use std::env;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("scenarios") => {
            for name in SCENARIOS {
                println!("{name}");
            }
            Ok(())
        }
        Some("run") => run_cmd(&args[1..]),
        Some("run-all") => run_all_cmd(&args[1..]),
        Some("check-config") => {
            let path = args.get(1).context("check-config requires <path>")?;
            let config = MountConfig::load(Path::new(path))
                .with_context(|| format!("invalid mount config {path}"))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn parse_options(args: &[String]) -> Result<ScenarioConfig> {
    let mut config = ScenarioConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                let raw = args.get(index + 1).context("--config requires a value")?;
                // Replaces everything parsed so far; later flags override it.
                config = load_scenario_config(Path::new(raw))?;
                index += 2;
            }
            "--threads" => {
                let raw = args.get(index + 1).context("--threads requires a value")?;
                config.threads = raw.parse().context("invalid --threads value")?;
                index += 2;
            }
            "--iterations" => {
                let raw = args.get(index + 1).context("--iterations requires a value")?;
                config.iterations = raw.parse().context("invalid --iterations value")?;
                index += 2;
            }
            "--timeout-ms" => {
                let raw = args.get(index + 1).context("--timeout-ms requires a value")?;
                config.timeout_ms = raw.parse().context("invalid --timeout-ms value")?;
                index += 2;
            }
            "--max-writer-bypass" => {
                let raw = args
                    .get(index + 1)
                    .context("--max-writer-bypass requires a value")?;
                config.mount.lock.max_writer_bypass =
                    raw.parse().context("invalid --max-writer-bypass value")?;
                index += 2;
            }
            "--trace" => {
                config.mount.trace_transitions = true;
                index += 1;
            }
            other => bail!("unknown option: {other}"),
        }
    }
    if config.threads == 0 {
        bail!("--threads must be at least 1");
    }
    Ok(config)
}

fn run_cmd(args: &[String]) -> Result<()> {
    let name = args.first().context("run requires <scenario>")?;
    let config = parse_options(&args[1..])?;
    let report = run_scenario(name, &config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        bail!("scenario {name} failed: {}", report.failures.join("; "));
    }
    Ok(())
}

fn run_all_cmd(args: &[String]) -> Result<()> {
    let config = parse_options(args)?;
    let mut reports = Vec::with_capacity(SCENARIOS.len());
    for name in SCENARIOS {
        reports.push(run_scenario(name, &config)?);
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);
    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.scenario.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn print_usage() {
    println!("ffs-harness: threaded scenarios for the FFS lock manager and write barrier");
    println!();
    println!("USAGE:");
    println!("  ffs-harness scenarios");
    println!("  ffs-harness run <scenario> [OPTIONS]");
    println!("  ffs-harness run-all [OPTIONS]");
    println!("  ffs-harness check-config <mount-config.json>");
    println!();
    println!("OPTIONS:");
    println!("  --config PATH            scenario config JSON (threads, iterations, timeout_ms, mount)");
    println!("  --threads N              worker threads (default 4)");
    println!("  --iterations N           operations per worker (default 200)");
    println!("  --timeout-ms N           watchdog deadline (default 10000)");
    println!("  --max-writer-bypass N    reader batches allowed past a waiting writer");
    println!("  --trace                  log every lock transition at TRACE");
    println!();
    println!("Each report is printed as JSON. A scenario whose watchdog fires is");
    println!("reported as failed instead of hanging.");
    println!();
    println!("EXAMPLES:");
    println!("  ffs-harness run pair-cross-order --threads 16 --iterations 10000");
    println!("  ffs-harness run-all --max-writer-bypass 0");
}
