use tracing_subscriber::EnvFilter;

use hubsyncd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!("hubsyncd - offline sync daemon for a content hub");
    println!();
    println!("Configuration comes from the environment (or a .env file):");
    println!("  HUBSYNC_SERVER_URL           hub base URL (required)");
    println!("  HUBSYNC_TOKEN                bearer token (required)");
    println!("  HUBSYNC_ACCOUNT_ID           local account identifier");
    println!("  HUBSYNC_REPOSITORY_ID        remote repository identifier");
    println!("  HUBSYNC_DATA_DIR             database and queue location");
    println!("  HUBSYNC_CONTENT_DIR          synced content location");
    println!("  HUBSYNC_PASS_INTERVAL_SECS   seconds between sync passes");
    println!("  HUBSYNC_UPLOAD_DRAIN_SECS    seconds between upload drains");
    println!("  HUBSYNC_TRANSFER_WORKERS     concurrent node transfers");
    println!("  HUBSYNC_ENABLE_LOCAL_WATCHER watch content for local edits");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_usage();
            Ok(())
        }
        CliMode::Run => {
            let config = DaemonConfig::from_env()?;
            let runtime = DaemonRuntime::bootstrap(config).await?;
            runtime.run().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run_mode() {
        let mode = parse_cli_mode(vec!["hubsyncd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn help_flag_selects_help_mode() {
        let mode = parse_cli_mode(vec!["hubsyncd".to_string(), "--help".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn unknown_argument_is_rejected() {
        assert!(parse_cli_mode(vec!["hubsyncd".to_string(), "--bogus".to_string()]).is_err());
    }
}
