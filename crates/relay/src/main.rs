use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use rr_relay::{Factory, RelayConfig, classify_change, select_transport};

const USAGE: &str = "\
Usage:
  rr-relay check [--config <file.json>]
  rr-relay diff <old.json> <new.json>

Commands:
  check    Load a relay config (file, or RR_RELAY/RR_RELAY_TIMEOUT/RR_POOL) and
           verify its transport can be built
  diff     Print whether moving from <old> to <new> is transport-affecting
           or pool-only";

enum Cmd {
    Check { config: Option<PathBuf> },
    Diff { old: PathBuf, new: PathBuf },
}

/// Initialize tracing with RR_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(log_directives(std::env::var("RR_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Filter directives for an `RR_LOG` level, defaulting to info.
fn log_directives(rr_log: Option<&str>) -> String {
    let level = match rr_log {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("rr_relay={level}")
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let cmd = match parse_args(&args) {
        Ok(cmd) => cmd,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(cmd).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Cmd, String> {
    let mut rest = args.iter().skip(1);
    let cmd = rest.next().ok_or("missing command")?;

    match cmd.as_str() {
        "check" => {
            let mut config = None;
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--config" => {
                        let path = rest.next().ok_or("--config requires a value")?;
                        config = Some(PathBuf::from(path));
                    }
                    "--help" | "-h" => return Err(String::new()),
                    other => return Err(format!("unexpected argument: {other}")),
                }
            }
            Ok(Cmd::Check { config })
        }
        "diff" => {
            let old = rest.next().ok_or("diff requires <old.json>")?;
            let new = rest.next().ok_or("diff requires <new.json>")?;
            if let Some(extra) = rest.next() {
                return Err(format!("unexpected argument: {extra}"));
            }
            Ok(Cmd::Diff {
                old: PathBuf::from(old),
                new: PathBuf::from(new),
            })
        }
        "--help" | "-h" => Err(String::new()),
        other => Err(format!("unknown command: {other}")),
    }
}

fn load(path: &Path) -> anyhow::Result<RelayConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    RelayConfig::from_json_str(&json).with_context(|| format!("in {}", path.display()))
}

async fn run(cmd: Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::Check { config } => {
            let config = match config {
                Some(path) => load(&path)?,
                None => RelayConfig::from_env().context("from environment")?,
            };
            let transport = select_transport(&config).await?;
            let kind = if transport.is_pipe() { "pipes" } else { "socket" };
            println!("{kind} {}", transport.address());
            transport.close().await;
        }
        Cmd::Diff { old, new } => {
            let change = classify_change(&load(&old)?, &load(&new)?);
            println!("{change}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("rr-relay")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_check_with_config() {
        match parse_args(&args(&["check", "--config", "relay.json"])) {
            Ok(Cmd::Check { config }) => assert_eq!(config, Some(PathBuf::from("relay.json"))),
            _ => panic!("expected check"),
        }
    }

    #[test]
    fn parses_diff() {
        match parse_args(&args(&["diff", "a.json", "b.json"])) {
            Ok(Cmd::Diff { old, new }) => {
                assert_eq!(old, PathBuf::from("a.json"));
                assert_eq!(new, PathBuf::from("b.json"));
            }
            _ => panic!("expected diff"),
        }
    }

    #[test]
    fn log_level_applies_to_the_whole_crate() {
        assert_eq!(log_directives(Some("trace")), "rr_relay=trace");
        assert_eq!(log_directives(Some("warning")), "rr_relay=warn");
        assert_eq!(log_directives(None), "rr_relay=info");
        assert_eq!(log_directives(Some("loud")), "rr_relay=info");
    }

    #[test]
    fn rejects_bad_usage() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["diff", "a.json"])).is_err());
        assert!(parse_args(&args(&["check", "--config"])).is_err());
        assert!(parse_args(&args(&["serve"])).is_err());
    }

    #[tokio::test]
    async fn diff_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.json");
        let new = dir.path().join("new.json");
        std::fs::write(&old, r#"{"relay": "pipes", "pool": {"num_workers": 1}}"#).unwrap();
        std::fs::write(&new, r#"{"relay": "pipes", "pool": {"num_workers": 2}}"#).unwrap();

        assert_eq!(
            classify_change(&load(&old).unwrap(), &load(&new).unwrap()),
            rr_relay::ChangeKind::PoolOnly
        );
        assert!(run(Cmd::Diff { old, new }).await.is_ok());
    }

    #[test]
    fn load_reports_path_on_error() {
        let err = load(Path::new("/nonexistent/relay.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/relay.json"));
    }
}
