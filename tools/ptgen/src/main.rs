//! Generate RISC-V page-table test cases from a JSON configuration.
//!
//! ```text
//! ptgen --config cases.json --seed 42 --format json -vv > cases.out.json
//! ```

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, ValueEnum};
use env_logger::Env;
use log::{LevelFilter, info};
use mmu_testgen::{Config, GenerationReport, Generator};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum Format {
    /// One line per walk, then the page tables.
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(version, about = "RISC-V page-table test-case generator", long_about = None)]
struct Cli {
    /// Strict JSON configuration file.
    #[arg(long, short)]
    config: PathBuf,

    /// Seed of the run; the same seed reproduces the same output.
    #[arg(long, short, default_value_t = 0)]
    seed: u64,

    #[arg(long, short, value_enum, default_value_t)]
    format: Format,

    /// Write to this file instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Exit with an error if any request failed.
    #[arg(long)]
    deny_failures: bool,

    /// Incremental verbosity (`-v`, `-vv`, `-vvv`).
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level.as_str()));
    builder.format_timestamp_millis();
    builder.init();
}

fn load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
}

fn render(report: &GenerationReport, format: Format) -> Result<String> {
    Ok(match format {
        Format::Text => report.to_string(),
        Format::Json => {
            let mut json =
                serde_json::to_string_pretty(report).context("failed to serialize report")?;
            json.push('\n');
            json
        }
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load(&cli.config)?;
    let report = Generator::new(config, cli.seed)
        .run()
        .with_context(|| format!("invalid config {}", cli.config.display()))?;
    let out = render(&report, cli.format)?;

    match &cli.output {
        Some(path) => {
            fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
            info!("wrote {}", path.display());
        }
        None => io::stdout()
            .lock()
            .write_all(out.as_bytes())
            .context("failed to write to stdout")?,
    }

    let failed = report.failures().count();
    if cli.deny_failures && failed > 0 {
        bail!("{failed} of {} requests failed", report.cases.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from(["ptgen", "-c", "cases.json", "--seed", "9", "-f", "json", "-vv"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("cases.json"));
        assert_eq!(cli.seed, 9);
        assert!(matches!(cli.format, Format::Json));
        assert_eq!(cli.verbose, 2);
        assert!(!cli.deny_failures);
    }

    #[test]
    fn bundled_config_runs() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/sv39.json");
        let config = load(&path).unwrap();
        let report = Generator::new(config, 42).run().unwrap();
        assert_eq!(report.cases.len(), 24);
    }

    #[test]
    fn renders_both_formats() {
        let config: Config = serde_json::from_str(
            r#"{ "mode": "Sv39", "lower_bound": "0x8000_0000", "memory_size": "0x100_0000",
                 "test_cases": [{ "repeats": 2 }] }"#,
        )
        .unwrap();
        let report = Generator::new(config, 1).run().unwrap();

        let text = render(&report, Format::Text).unwrap();
        assert!(text.starts_with("Mode: Sv39"));
        assert_eq!(text.lines().filter(|l| l.contains("SATP:")).count(), 2);

        let json: serde_json::Value =
            serde_json::from_str(&render(&report, Format::Json).unwrap()).unwrap();
        assert_eq!(json["seed"], 1);
        assert_eq!(json["cases"].as_array().unwrap().len(), 2);
    }
}
