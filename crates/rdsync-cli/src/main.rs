//! rdsync: command-line client for an rdsync daemon
//!
//! Commands:
//!   status                          daemon health and running synchronizations
//!   config show                     display current configuration
//!   upload <local> [--name] [-m k=v] store a local file on the daemon
//!   download <name> [<local>]       fetch a file from the daemon
//!   mv <from> <to> / rm <name>      rename or delete, leaving a tombstone
//!   sync <name> --to <url>          push a file to a peer daemon
//!   conflicts / resolve / finished  inspect and settle synchronization results

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use rdsync_core::config::RdsyncConfig;
use rdsync_core::{ConflictItem, SynchronizationReport};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "rdsync",
    version,
    about = "rdsync file synchronization client",
    long_about = "rdsync: store files on an rdsync daemon and synchronize them with its peers"
)]
struct Cli {
    /// Path to rdsync.toml configuration file
    #[arg(long, short = 'c', env = "RDSYNC_CONFIG", default_value = "/etc/rdsync/config.toml")]
    config: PathBuf,

    /// Daemon URL (default: server.url from the config)
    #[arg(long, short = 's', env = "RDSYNC_SERVER")]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show daemon health and running synchronizations
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Store a local file on the daemon
    Upload {
        local: PathBuf,
        /// Name on the daemon (default: the local file name)
        #[arg(long, short = 'n')]
        name: Option<String>,
        /// Metadata entry, repeatable
        #[arg(long = "meta", short = 'm', value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },

    /// Fetch a file from the daemon
    Download {
        name: String,
        /// Local destination (default: ./<name>)
        local: Option<PathBuf>,
    },

    /// Rename a file
    Mv { from: String, to: String },

    /// Delete a file
    Rm { name: String },

    /// Push a file to a peer daemon
    Sync {
        name: String,
        /// Destination daemon URL
        #[arg(long)]
        to: String,
    },

    /// List unresolved conflicts
    Conflicts {
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 25)]
        take: usize,
    },

    /// Resolve a conflict
    Resolve {
        name: String,
        #[arg(long, value_enum)]
        strategy: Strategy,
        /// Peer whose next push is accepted (theirs)
        #[arg(long)]
        remote: Option<String>,
    },

    /// Reports of finished incoming synchronizations
    Finished {
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 25)]
        take: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Debug, ValueEnum)]
enum Strategy {
    Ours,
    Theirs,
}

impl Strategy {
    fn as_str(&self) -> &'static str {
        match self {
            Strategy::Ours => "ours",
            Strategy::Theirs => "theirs",
        }
    }
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    let daemon = Daemon::new(
        cli.server.as_deref().unwrap_or(&config.server.url),
        Duration::from_secs(config.sync.request_timeout_secs.max(1)),
    )?;

    match cli.command {
        Commands::Status => cmd_status(&daemon).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::Upload { local, name, meta } => cmd_upload(&daemon, &local, name.as_deref(), &meta).await,
        Commands::Download { name, local } => cmd_download(&daemon, &name, local.as_deref()).await,
        Commands::Mv { from, to } => cmd_mv(&daemon, &from, &to).await,
        Commands::Rm { name } => cmd_rm(&daemon, &name).await,
        Commands::Sync { name, to } => cmd_sync(&daemon, &name, &to).await,
        Commands::Conflicts { skip, take } => cmd_conflicts(&daemon, skip, take).await,
        Commands::Resolve { name, strategy, remote } => {
            cmd_resolve(&daemon, &name, &strategy, remote.as_deref()).await
        }
        Commands::Finished { skip, take } => cmd_finished(&daemon, skip, take).await,
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<RdsyncConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(RdsyncConfig::default())
    }
}

// ── Daemon client ─────────────────────────────────────────────────────────────

struct Daemon {
    client: Client,
    url: String,
}

impl Daemon {
    fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Daemon {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("connecting to rdsyncd at {}", self.url))?;
        check(response).await
    }

    async fn json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        self.send(request)
            .await?
            .json()
            .await
            .context("decoding daemon response")
    }
}

/// Turn a non-success status into an error carrying the daemon's message.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    bail!("rdsyncd answered {status}: {message}")
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style =
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `rdsync status` ───────────────────────────────────────────────────────────

async fn cmd_status(daemon: &Daemon) -> Result<()> {
    let live = daemon.client.get(daemon.endpoint("/healthz")).send().await;
    let Ok(live) = live else {
        eprintln!("rdsyncd: not reachable at {}", daemon.url);
        eprintln!("         Is rdsyncd running?  Try: rdsyncd --config /etc/rdsync/config.toml");
        std::process::exit(1);
    };
    let ready = daemon
        .client
        .get(daemon.endpoint("/readyz"))
        .send()
        .await
        .map(|r| r.status() == StatusCode::OK)
        .unwrap_or(false);
    let active: Vec<serde_json::Value> = daemon.json(daemon.client.get(daemon.endpoint("/synchronization/active"))).await?;

    println!("rdsyncd at {}", daemon.url);
    println!("  alive:   {}", if live.status().is_success() { "ok" } else { "NOT OK" });
    println!("  storage: {}", if ready { "ok" } else { "UNREACHABLE" });
    println!("  active synchronizations: {}", active.len());
    for sync in &active {
        println!(
            "    {} {} {} [{}]",
            sync.get("direction").and_then(|v| v.as_str()).unwrap_or("?"),
            sync.get("fileName").and_then(|v| v.as_str()).unwrap_or("?"),
            sync.get("peer").and_then(|v| v.as_str()).unwrap_or("?"),
            sync.get("state").and_then(|v| v.as_str()).unwrap_or("?"),
        );
    }
    Ok(())
}

// ── `rdsync config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &RdsyncConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `rdsync upload` / `download` ──────────────────────────────────────────────

async fn cmd_upload(daemon: &Daemon, local: &Path, name: Option<&str>, meta: &[(String, String)]) -> Result<()> {
    let name = match name {
        Some(name) => name.to_string(),
        None => local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", local.display()))?,
    };
    let content = tokio::fs::read(local)
        .await
        .with_context(|| format!("reading {}", local.display()))?;
    let size = content.len() as u64;

    let spinner = make_spinner("upload");
    spinner.set_message(format!("{name} ({})", fmt_bytes(size)));
    let mut request = daemon.client.put(daemon.endpoint(&format!("/files/{name}"))).body(content);
    for (key, value) in meta {
        request = request.header(key.as_str(), value.as_str());
    }
    let stored: serde_json::Value = daemon.json(request).await?;
    spinner.finish_and_clear();

    println!(
        "uploaded {name}: {} (version {})",
        fmt_bytes(size),
        stored.get("sync-version").and_then(|v| v.as_str()).unwrap_or("?")
    );
    Ok(())
}

async fn cmd_download(daemon: &Daemon, name: &str, local: Option<&Path>) -> Result<()> {
    let target = local.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(name));
    let response = daemon
        .send(daemon.client.get(daemon.endpoint(&format!("/files/{name}"))))
        .await?;

    let pb = make_progress_bar(response.content_length().unwrap_or(0), "download");
    pb.set_message(name.to_string());
    let mut file = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("creating {}", target.display()))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading download")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;
    pb.finish_and_clear();

    println!("downloaded {name} -> {} ({})", target.display(), fmt_bytes(pb.position()));
    Ok(())
}

async fn cmd_mv(daemon: &Daemon, from: &str, to: &str) -> Result<()> {
    daemon
        .send(
            daemon
                .client
                .post(daemon.endpoint(&format!("/files/{from}/rename")))
                .query(&[("to", to)]),
        )
        .await?;
    println!("renamed {from} -> {to}");
    Ok(())
}

async fn cmd_rm(daemon: &Daemon, name: &str) -> Result<()> {
    daemon
        .send(daemon.client.delete(daemon.endpoint(&format!("/files/{name}"))))
        .await?;
    println!("deleted {name}");
    Ok(())
}

// ── `rdsync sync` ─────────────────────────────────────────────────────────────

async fn cmd_sync(daemon: &Daemon, name: &str, to: &str) -> Result<()> {
    let spinner = make_spinner("sync");
    spinner.set_message(format!("{name} -> {to}"));
    let report: SynchronizationReport = daemon
        .json(
            daemon
                .client
                .post(daemon.endpoint("/synchronization/start"))
                .query(&[("fileName", name), ("destination", to)]),
        )
        .await?;
    spinner.finish_and_clear();

    if let Some(conflict) = &report.conflict {
        println!("{name}: CONFLICT (ours {}, theirs {})", conflict.ours, conflict.theirs);
        println!("  resolve on {to} with: rdsync -s {to} resolve {name} --strategy ours|theirs");
        std::process::exit(2);
    }
    if let Some(exception) = &report.exception {
        bail!("{name}: synchronization failed: {exception}");
    }
    let total = report.bytes_copied + report.bytes_transferred;
    println!(
        "{name}: {} synchronized ({} reused, {} sent, {:.0}% saved)",
        report.sync_type.as_str(),
        fmt_bytes(report.bytes_copied),
        fmt_bytes(report.bytes_transferred),
        if total == 0 { 100.0 } else { report.bytes_copied as f64 * 100.0 / total as f64 }
    );
    Ok(())
}

// ── conflicts / resolve / finished ────────────────────────────────────────────

async fn cmd_conflicts(daemon: &Daemon, skip: usize, take: usize) -> Result<()> {
    let items: Vec<ConflictItem> = daemon
        .json(
            daemon
                .client
                .get(daemon.endpoint("/synchronization/conflicts"))
                .query(&[("skip", skip), ("take", take)]),
        )
        .await?;
    if items.is_empty() {
        println!("no conflicts");
    }
    for item in items {
        println!(
            "{}  ours {}  theirs {}  from {}",
            item.file_name,
            item.ours,
            item.theirs,
            item.remote_server_url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_resolve(daemon: &Daemon, name: &str, strategy: &Strategy, remote: Option<&str>) -> Result<()> {
    let mut query = vec![("fileName", name), ("strategy", strategy.as_str())];
    if let Some(remote) = remote {
        query.push(("remoteServerUrl", remote));
    }
    let item: ConflictItem = daemon
        .json(
            daemon
                .client
                .post(daemon.endpoint("/synchronization/ResolveConflict"))
                .query(&query),
        )
        .await?;
    match strategy {
        Strategy::Ours => println!("{name}: kept local version {}", item.ours),
        Strategy::Theirs => println!(
            "{name}: next push from {} will be accepted",
            item.remote_server_url.as_deref().unwrap_or(&item.theirs.server_id)
        ),
    }
    Ok(())
}

async fn cmd_finished(daemon: &Daemon, skip: usize, take: usize) -> Result<()> {
    let reports: Vec<SynchronizationReport> = daemon
        .json(
            daemon
                .client
                .get(daemon.endpoint("/synchronization/finished"))
                .query(&[("skip", skip), ("take", take)]),
        )
        .await?;
    for report in reports {
        let outcome = if report.is_conflicted() {
            "conflict".to_string()
        } else if let Some(exception) = &report.exception {
            format!("failed: {exception}")
        } else {
            "ok".to_string()
        };
        println!(
            "{}  {}  {} reused, {} sent  {outcome}",
            report.file_name,
            report.sync_type.as_str(),
            fmt_bytes(report.bytes_copied),
            fmt_bytes(report.bytes_transferred),
        );
    }
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_arguments_split_on_first_equals() {
        assert_eq!(parse_meta("owner=alice").unwrap(), ("owner".into(), "alice".into()));
        assert_eq!(parse_meta("q=a=b").unwrap(), ("q".into(), "a=b".into()));
        assert!(parse_meta("novalue").is_err());
        assert!(parse_meta("=x").is_err());
    }

    #[test]
    fn byte_sizes_are_human_readable() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn daemon_url_is_trimmed() {
        let daemon = Daemon::new("http://127.0.0.1:9090/", Duration::from_secs(1)).unwrap();
        assert_eq!(daemon.endpoint("/healthz"), "http://127.0.0.1:9090/healthz");
    }
}
