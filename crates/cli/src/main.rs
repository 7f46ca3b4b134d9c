use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use komp_api::{default_manifest_path, init_workspace, EnvOutcome, InProcApi, KompApi};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kompctl", version, about = "Keep Kubernetes overlays in sync with docker-compose sources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Workspace manifest (default: $KOMP_MANIFEST or ./komp.yaml)
    #[arg(long = "manifest", global = true)]
    manifest: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the manifest and mint one overlay per environment
    Init {
        /// Compose file; repeat to merge several, later files win
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
        /// Environment name; repeat for several
        #[arg(short = 'e', long = "env", required = true)]
        envs: Vec<String>,
        /// Overwrite existing overlay files
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Print the overlay derived from the compose sources
    Extract,
    /// Show what reconcile would change, without saving
    Plan {
        /// Restrict to these environments (default: all)
        #[arg(short = 'e', long = "env")]
        envs: Vec<String>,
    },
    /// Reconcile environments with the compose sources and save them
    Reconcile {
        /// Restrict to these environments (default: all)
        #[arg(short = 'e', long = "env")]
        envs: Vec<String>,
    },
    /// Print the compose project with an environment's overlay applied
    Render {
        #[arg(short = 'e', long = "env")]
        env: String,
    },
}

/// Log filter from a `KOMP_LOG` value; unset or unparsable falls back to `info`.
fn log_filter(raw: Option<&str>) -> tracing_subscriber::EnvFilter {
    raw.and_then(|s| tracing_subscriber::EnvFilter::from_str(s).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"))
}

fn init_tracing() {
    let raw = std::env::var("KOMP_LOG").ok();
    tracing_subscriber::fmt().with_env_filter(log_filter(raw.as_deref())).with_target(true).with_writer(std::io::stderr).init();
}

/// Exporter address from a `KOMP_METRICS_ADDR` value. `Ok(None)` disables the exporter.
fn metrics_addr(raw: Option<&str>) -> Result<Option<SocketAddr>, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|_| format!("invalid KOMP_METRICS_ADDR `{}`; expected host:port", s)),
    }
}

fn init_metrics() {
    let raw = std::env::var("KOMP_METRICS_ADDR").ok();
    match metrics_addr(raw.as_deref()) {
        Ok(None) => {}
        Ok(Some(sock)) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %sock, "metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(msg) => warn!("{}", msg),
    }
}

fn print_outcomes(outcomes: &[EnvOutcome], output: Output, dry_run: bool) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(outcomes)?),
        Output::Human => {
            for o in outcomes {
                println!("» {} ({})", o.env, o.path.display());
                if let Some(err) = &o.error {
                    println!("  ✗ {}", err);
                    continue;
                }
                for pass in &o.report {
                    for msg in &pass.messages {
                        println!("  [{}] {}", pass.pass, msg);
                    }
                }
                let verdict = match (o.applied.is_empty(), dry_run, o.saved) {
                    (true, _, _) => "up to date".to_string(),
                    (false, true, _) => format!("{} change(s) pending", o.applied.len()),
                    (false, false, true) => format!("{} change(s) saved", o.applied.len()),
                    (false, false, false) => format!("{} change(s) not saved", o.applied.len()),
                };
                println!("  ✓ {}", verdict);
            }
        }
    }
    Ok(())
}

fn failures(outcomes: &[EnvOutcome]) -> usize {
    outcomes.iter().filter(|o| o.failed()).count()
}

fn run(cli: Cli) -> Result<ExitCode> {
    let manifest = cli.manifest.clone().unwrap_or_else(default_manifest_path);
    match cli.command {
        Commands::Init { files, envs, force } => {
            info!(files = files.len(), envs = ?envs, force, "init invoked");
            let minted = init_workspace(&manifest, &files, &envs, force)?;
            match cli.output {
                Output::Human => {
                    for m in &minted { println!("minted {} -> {}", m.env, m.path.display()); }
                    println!("wrote {}", manifest.display());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&minted)?),
            }
        }
        Commands::Extract => {
            let api = InProcApi::open(&manifest)?;
            let overlay = api.extract()?;
            match cli.output {
                Output::Human => print!("{}", overlay.to_yaml().context("serializing overlay")?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&overlay)?),
            }
        }
        Commands::Plan { envs } => {
            let api = InProcApi::open(&manifest)?;
            let outcomes = api.plan(&envs)?;
            print_outcomes(&outcomes, cli.output, true)?;
            if failures(&outcomes) > 0 { return Ok(ExitCode::FAILURE); }
        }
        Commands::Reconcile { envs } => {
            let api = InProcApi::open(&manifest)?;
            let outcomes = api.reconcile(&envs)?;
            print_outcomes(&outcomes, cli.output, false)?;
            let failed = failures(&outcomes);
            if failed > 0 {
                error!(failed, "some environments were not reconciled");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Render { env } => {
            let api = InProcApi::open(&manifest)?;
            let project = api.render(&env)?;
            match cli.output {
                Output::Human => print!("{}", project.to_yaml().context("serializing compose project")?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&project)?),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
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
    fn parses_repeated_flags_and_global_output() {
        let cli = Cli::try_parse_from(["kompctl", "init", "-f", "a.yaml", "-f", "b.yaml", "-e", "dev", "-e", "prod", "-o", "json"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Init { files, envs, force } => {
                assert_eq!(files, vec![PathBuf::from("a.yaml"), PathBuf::from("b.yaml")]);
                assert_eq!(envs, vec!["dev".to_string(), "prod".to_string()]);
                assert!(!force);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["kompctl", "render"]).is_err());
    }

    #[test]
    fn metrics_addr_is_optional_and_checked() {
        assert_eq!(metrics_addr(None), Ok(None));
        assert_eq!(metrics_addr(Some("  ")), Ok(None));
        assert_eq!(metrics_addr(Some("127.0.0.1:9898")), Ok(Some("127.0.0.1:9898".parse().unwrap())));
        assert!(metrics_addr(Some("localhost")).unwrap_err().contains("host:port"));
    }

    #[test]
    fn log_filter_falls_back_to_info() {
        assert_eq!(log_filter(None).to_string(), "info");
        assert_eq!(log_filter(Some("komp_apply=debug")).to_string(), "komp_apply=debug");
    }
}
