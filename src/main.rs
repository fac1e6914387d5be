use anyhow::{Context, Result};
use std::env;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bltz_pool::account::{VerifyReport, verify_account};
use bltz_pool::config::{AccountConfig, Config};
use bltz_pool::constants::{ENV_PASSWORD, LOG_FILE_NAME};
use bltz_pool::mail::{ImapConnection, ImapEndpoint, ImapPool};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bltz_pool=debug"));

    // Try to create a log file in the config directory
    let log_file = Config::config_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| dir.join(LOG_FILE_NAME))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        // Log to file
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fallback to stderr if file logging fails
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"bltz-pool - IMAP connection pool check for bltz accounts

Usage: bltz-pool [command]

Commands:
    check [email]   Verify every configured account, or just one, through the pool (default)
    help            Show this help message

Configuration file: ~/.config/bltz-pool/config.toml (override with BLTZ_POOL_CONFIG)
Password / OAuth2 access token: BLTZ_PASSWORD
"#
    );
}

/// Verify accounts concurrently, then shut the pool down.
async fn run_check(only: Option<&str>) -> Result<()> {
    setup_logging();

    let config = Config::load()?;
    if config.accounts.is_empty() {
        anyhow::bail!("No accounts configured in {}", Config::config_path()?.display());
    }
    let accounts: Vec<&AccountConfig> = match only {
        Some(email) => vec![
            config
                .account_by_email(email)
                .with_context(|| format!("No account configured for {}", email))?,
        ],
        None => config.accounts.iter().collect(),
    };

    let secret = env::var(ENV_PASSWORD)
        .with_context(|| format!("Set {} to the account password or access token", ENV_PASSWORD))?;

    let pool = ImapPool::from_config(&config.pool);
    // One probe more than the pool allows, so the check also waits in line.
    let probes = pool.max_per_key() + 1;

    let checks = accounts.into_iter().map(|account| {
        let pool = &pool;
        let endpoint = ImapEndpoint::for_account(account, secret.clone());
        async move {
            let report = verify_account(pool, account.account_id(), &endpoint, probes).await;
            if !report.is_ok() {
                // Stale credentials: drop whatever the account still holds.
                close_all(pool.evict(&report.account_id)).await;
            }
            report
        }
    });

    let reports = tokio::select! {
        reports = futures::future::join_all(checks) => reports,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, shutting down pool");
            Vec::new()
        }
    };

    close_all(pool.shutdown()).await;

    let mut failed = 0;
    for report in &reports {
        print_report(report, probes);
        if !report.is_ok() {
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} account(s) failed verification", failed, reports.len());
    }
    Ok(())
}

/// Log out of connections the pool handed back.
async fn close_all(connections: Vec<ImapConnection>) {
    for conn in connections {
        let server = conn.server().to_string();
        if let Err(e) = conn.logout().await {
            tracing::debug!("Logout from {} failed: {}", server, e);
        }
    }
}

fn print_report(report: &VerifyReport, probes: usize) {
    let status = if report.is_ok() { "ok" } else { "FAILED" };
    println!(
        "{}: {} ({}/{} checkouts, {} connection(s) live before shutdown)",
        report.account_id, status, report.succeeded, probes, report.live_connections
    );
    if let Some(messages) = report.inbox_messages {
        println!("    INBOX: {} message(s)", messages);
    }
    if !report.folders.is_empty() {
        println!("    folders: {}", report.folders.join(", "));
    }
    for error in &report.errors {
        println!("    error: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("check") => run_check(args.get(2).map(|s| s.as_str())).await,
        None => run_check(None).await,
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
