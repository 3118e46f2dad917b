//! # hlbackup CLI - Versioned backups with hard-link deduplication
//!
//! Runs one backup session from a source directory into a target root.
//!
//! ## Features
//! - Full browsable tree per session, unchanged files hard-linked
//! - Remote targets on a mounted share, with links created over ssh
//! - Optional `.tar.lz4` archive next to or instead of the tree
//! - Btrfs snapshots of the source when available
//!
//! ## Usage
//! ```bash
//! # Local backup
//! hlbackup --source ~/projects --target /mnt/backup
//!
//! # Short prefix form
//! hlbackup -s:/home/me/projects -t:/mnt/backup
//!
//! # Remote target mounted at /mnt/nas
//! hlbackup -s:/data -t:/mnt/nas/backups -sl:backup -sp:secret -sh:nas.local \
//!     -sr:/volume1/backups -spp:22
//!
//! # Archive only, verify afterwards
//! hlbackup -s /data -t /mnt/backup --archive-only --verify
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use hlbackup::log_sink::{ChannelSink, FanoutSink, FileLogSink, SinkMessage};
use hlbackup::snapshot::BtrfsSnapshotProvider;
use hlbackup::utils::format_bytes;
use hlbackup::{
    BackupBuilder, BackupError, BackupReport, FingerprintPolicy, LogCategory, LogEvent,
    LogSink, OutputMode, RemoteConfig, SessionStore, SessionVerifier,
};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Prefix flags accepted for compatibility, longest first
const LEGACY_PREFIXES: &[(&str, &str)] = &[
    ("-spp:", "--ssh-port"),
    ("-sl:", "--ssh-login"),
    ("-sp:", "--ssh-password"),
    ("-sh:", "--ssh-host"),
    ("-sr:", "--ssh-root"),
    ("-s:", "--source"),
    ("-t:", "--target"),
];

/// hlbackup - Versioned backups that hard-link unchanged files
#[derive(Parser)]
#[command(name = "hlbackup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Source directory to back up (also `-s:<path>`)
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Target root holding the sessions (also `-t:<path>`)
    #[arg(short, long)]
    target: Option<PathBuf>,

    /// Remote login (also `-sl:<login>`)
    #[arg(long)]
    ssh_login: Option<String>,

    /// Remote password; never written to disk (also `-sp:<password>`)
    #[arg(long)]
    ssh_password: Option<String>,

    /// Remote host (also `-sh:<host>`)
    #[arg(long)]
    ssh_host: Option<String>,

    /// Target root as seen by the remote host (also `-sr:<path>`)
    #[arg(long)]
    ssh_root: Option<String>,

    /// Remote ssh port (also `-spp:<port>`)
    #[arg(long)]
    ssh_port: Option<String>,

    /// Number of hashing and commit workers each
    #[arg(short, long)]
    workers: Option<usize>,

    /// Also write a .tar.lz4 archive at this path
    #[arg(long, conflicts_with = "archive_only")]
    archive: Option<PathBuf>,

    /// Write only the archive, no file tree
    #[arg(long)]
    archive_only: bool,

    /// Glob patterns to exclude (repeatable)
    #[arg(short = 'x', long = "exclude")]
    exclude: Vec<String>,

    /// Compare bytes before linking to a matching file
    #[arg(long)]
    verify_matches: bool,

    /// Hash large files by sampled windows instead of fully
    #[arg(long)]
    sampled: bool,

    /// Follow symbolic links in the source
    #[arg(long)]
    follow_symlinks: bool,

    /// Source snapshot strategy
    #[arg(long, value_enum, default_value = "btrfs")]
    snapshot: SnapshotMode,

    /// Abort the run after this long (e.g. "2h", "90m")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Verify the new session after the run
    #[arg(long)]
    verify: bool,

    /// Append user-facing events to this file
    #[arg(long, default_value = "log.txt")]
    log_file: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SnapshotMode {
    /// Snapshot btrfs subvolumes, fall back to live reads elsewhere
    Btrfs,
    /// Always read the live source
    None,
}

/// Rewrite `-s:<value>` style arguments into their long form
fn normalize_legacy_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            for (prefix, long) in LEGACY_PREFIXES {
                if let Some(value) = text.strip_prefix(prefix) {
                    return OsString::from(format!("{}={}", long, value));
                }
            }
            arg
        })
        .collect()
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_legacy_args(std::env::args_os()));

    // Set up logging
    let filter = if cli.verbose {
        Some(EnvFilter::new("hlbackup=debug"))
    } else {
        EnvFilter::try_from_default_env().ok()
    };
    if let Some(filter) = filter {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<BackupError>() {
                Some(backup_error) => {
                    eprintln!("{}: {}", "Error".red().bold(), backup_error.user_message());
                    ExitCode::from(exit_code_for(backup_error))
                }
                None => {
                    eprintln!("{}: {:#}", "Error".red().bold(), e);
                    ExitCode::from(1)
                }
            }
        }
    }
}

/// 2 for problems found before work started, 1 for everything else
fn exit_code_for(error: &BackupError) -> u8 {
    if error.is_startup() || matches!(error, BackupError::RemoteUnreachable(_)) {
        2
    } else {
        1
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let source = cli
        .source
        .ok_or_else(|| BackupError::configuration("Missing source: pass -s:<path> or --source"))?;
    let target = cli
        .target
        .ok_or_else(|| BackupError::configuration("Missing target: pass -t:<path> or --target"))?;
    let remote = RemoteConfig::from_parts(
        cli.ssh_login,
        cli.ssh_password,
        cli.ssh_host,
        cli.ssh_root,
        cli.ssh_port,
    )?;

    let (channel, events) = ChannelSink::new();
    let file_log = FileLogSink::open(&cli.log_file)
        .with_context(|| format!("Cannot open log file {:?}", cli.log_file))?;
    let sink: Arc<dyn LogSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(channel))
            .with(Arc::new(file_log)),
    );

    let mut builder = BackupBuilder::new()
        .exclude_patterns(cli.exclude)
        .verify_matches(cli.verify_matches)
        .follow_symlinks(cli.follow_symlinks)
        .log_sink(sink);
    if let Some(workers) = cli.workers {
        builder = builder.parallel_workers(workers);
    }
    if cli.sampled {
        builder = builder.fingerprint_policy(FingerprintPolicy::sampled_default());
    }
    if cli.archive_only {
        builder = builder.output(OutputMode::Archive);
    } else if let Some(path) = cli.archive {
        builder = builder.output(OutputMode::TreeAndArchive).archive_path(path);
    }
    if let SnapshotMode::Btrfs = cli.snapshot {
        builder = builder.snapshot_provider(Arc::new(BtrfsSnapshotProvider::default()));
    }
    if let Some(timeout) = cli.timeout {
        builder = builder.run_timeout(timeout);
    }
    if let Some(remote) = remote {
        builder = builder.remote(remote);
    }

    let engine = builder.build(source, target.clone())?;

    let token = engine.cancellation_token().clone();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        tracing::warn!("Cannot install Ctrl-C handler: {}", e);
    }

    println!("{}", "Starting backup...".blue().bold());
    let renderer = thread::spawn(move || ConsoleRenderer::new().drain(events));

    let result = engine.run();
    // Dropping the engine drops the last sender, which ends the renderer
    drop(engine);
    if renderer.join().is_err() {
        tracing::warn!("Console renderer panicked");
    }

    let report = result?;
    print_report(&report);

    if cli.verify {
        return verify_session(target, &report);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &BackupReport) {
    let stats = &report.stats;
    println!(
        "{} Session {} completed",
        "✓".green().bold(),
        report.session_name.bright_white()
    );
    println!("  {}: {}", "Files seen".bright_black(), stats.files_seen);
    println!(
        "  {}: {} ({})",
        "Copied".bright_black(),
        stats.files_copied,
        format_bytes(stats.bytes_copied)
    );
    println!(
        "  {}: {} ({})",
        "Linked".bright_black(),
        stats.files_linked,
        format_bytes(stats.bytes_linked)
    );
    if let Some(archive) = &report.archive_path {
        println!(
            "  {}: {} files in {}",
            "Archived".bright_black(),
            stats.files_archived,
            archive.display()
        );
    }
    if stats.files_failed > 0 {
        println!("  {}: {}", "Failed".yellow(), stats.files_failed);
    }
    if !report.snapshot_used {
        println!("  {}", "Source was read live (no snapshot)".bright_black());
    }
    for warning in &report.warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
    println!(
        "  {}: {}",
        "Duration".bright_black(),
        format_duration(Duration::from_millis(report.duration_ms))
    );
}

fn verify_session(target: PathBuf, report: &BackupReport) -> anyhow::Result<ExitCode> {
    println!("{}", "Verifying session...".blue().bold());

    let session = SessionStore::new(target)
        .load_sessions()?
        .into_iter()
        .find(|session| session.name == report.session_name)
        .ok_or_else(|| BackupError::persistence(format!("Session {} not found", report.session_name)))?;

    let verification = SessionVerifier::new().rehash(true).verify(&session)?;
    if verification.is_valid() {
        println!("{} {}", "✓".green().bold(), verification.summary());
        for orphan in &verification.orphaned_files {
            println!("  {} untracked file {}", "⚠".yellow(), orphan);
        }
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{} {}", "✗".red().bold(), verification.summary());
        for error in &verification.errors {
            println!("  {} {}", "•".red(), error);
        }
        Ok(ExitCode::from(1))
    }
}

/// Renders sink messages on the terminal
///
/// Consecutive events of one category rewrite a single line; a new category
/// starts a new line. Status text goes to a spinner below the event lines.
struct ConsoleRenderer {
    multi: MultiProgress,
    spinner: ProgressBar,
    line: Option<(LogCategory, ProgressBar)>,
}

impl ConsoleRenderer {
    fn new() -> Self {
        let multi = MultiProgress::new();
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(120));
        Self {
            multi,
            spinner,
            line: None,
        }
    }

    fn drain(mut self, events: Receiver<SinkMessage>) {
        for message in events {
            match message {
                SinkMessage::Event(event) => self.show(&event),
                SinkMessage::Status(text) => self.spinner.set_message(text),
            }
        }
        if let Some((_, line)) = self.line.take() {
            line.finish();
        }
        self.spinner.finish_and_clear();
    }

    fn show(&mut self, event: &LogEvent) {
        let text = format!("{} {}", label(event.category), event.message);

        if self.spinner.is_hidden() {
            // Not a terminal: one plain line per event
            println!("{}", text);
            return;
        }

        match &self.line {
            Some((category, line)) if *category == event.category => line.set_message(text),
            _ => {
                if let Some((_, previous)) = self.line.take() {
                    previous.finish();
                }
                let line = self.multi.insert_before(&self.spinner, ProgressBar::new_spinner());
                line.set_style(
                    ProgressStyle::default_spinner()
                        .template("{msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                line.set_message(text);
                self.line = Some((event.category, line));
            }
        }
    }
}

fn label(category: LogCategory) -> ColoredString {
    let name = format!("[{}]", category);
    match category {
        LogCategory::Info => name.blue(),
        LogCategory::Scan => name.cyan(),
        LogCategory::Link => name.green(),
        LogCategory::Copy => name.bright_blue(),
        LogCategory::Warning => name.yellow().bold(),
        LogCategory::Error => name.red().bold(),
        LogCategory::Summary => name.bright_white().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_legacy_prefixes_are_normalized() {
        let normalized = normalize_legacy_args(args(&[
            "hlbackup",
            "-s:/data",
            "-t:/mnt/backup",
            "-spp:2222",
            "-sp:pw",
            "--verify",
        ]));
        assert_eq!(
            normalized,
            args(&[
                "hlbackup",
                "--source=/data",
                "--target=/mnt/backup",
                "--ssh-port=2222",
                "--ssh-password=pw",
                "--verify",
            ])
        );
    }

    #[test]
    fn test_cli_parses_both_forms() {
        let cli = Cli::parse_from(normalize_legacy_args(args(&[
            "hlbackup",
            "-s:/data",
            "--target",
            "/backup",
            "-sl:me",
            "-sh:nas",
            "-x",
            "*.tmp",
            "--timeout",
            "90m",
        ])));
        assert_eq!(cli.source, Some(PathBuf::from("/data")));
        assert_eq!(cli.target, Some(PathBuf::from("/backup")));
        assert_eq!(cli.ssh_login.as_deref(), Some("me"));
        assert_eq!(cli.ssh_host.as_deref(), Some("nas"));
        assert_eq!(cli.exclude, vec!["*.tmp".to_string()]);
        assert_eq!(cli.timeout, Some(Duration::from_secs(90 * 60)));
        assert!(matches!(cli.snapshot, SnapshotMode::Btrfs));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&BackupError::configuration("bad")), 2);
        assert_eq!(exit_code_for(&BackupError::RemoteUnreachable("down".into())), 2);
        assert_eq!(exit_code_for(&BackupError::Cancelled), 1);
    }
}
