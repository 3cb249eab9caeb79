//! Queue driver for the command line.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use dagflow_transfer::{
    FileSource, FingerprintStore, JsonFingerprintStore, MemoryEndpoint, MemoryFingerprintStore,
    UploadEndpoint, default_store_path,
};
use dagflow_tus_client::TusClient;
use dagflow_upload_queue::{HistoryEntry, HistoryLog, QueueEvent, QueueManager};
use tracing::{error, info, warn};

use crate::Args;
use crate::config::Config;

/// Applies command-line flags on top of the loaded configuration.
pub fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(group) = &args.group {
        config.queue.group_id = group.clone();
    }
    if let Some(mb) = args.chunk_size_mb {
        config.queue = config.queue.with_chunk_size_mb(mb);
    }
    if let Some(n) = args.parallel_chunks {
        config.queue.parallel_chunks = n;
    }
    if args.upload_data_during_creation {
        config.queue.upload_data_during_creation = true;
    }
    if let Some(n) = args.concurrency {
        config.queue.concurrency_limit = n;
    }
    config.queue = config.queue.clamped();
    config
}

/// Uploads every file named in `args` and prints the resulting history.
pub async fn run(config: Config, args: Args) -> anyhow::Result<()> {
    let endpoint: Arc<dyn UploadEndpoint>;
    let store: Arc<dyn FingerprintStore>;
    if args.dry_run {
        info!("dry run: uploading into memory");
        endpoint = Arc::new(MemoryEndpoint::discarding());
        store = Arc::new(MemoryFingerprintStore::new());
    } else {
        let client = TusClient::new(&config.endpoint)
            .with_context(|| format!("invalid endpoint {}", config.endpoint))?;
        let Some(store_path) = config.store_path.clone().or_else(default_store_path) else {
            bail!("cannot determine the fingerprint store location");
        };
        let json_store = JsonFingerprintStore::new(store_path.clone())
            .with_context(|| format!("opening fingerprint store {}", store_path.display()))?;
        endpoint = Arc::new(client);
        store = Arc::new(json_store);
    }

    let mut queue = QueueManager::new(config.queue, endpoint, store);
    for path in &args.files {
        let source = FileSource::open(path).with_context(|| format!("opening {}", path.display()))?;
        queue.enqueue(Arc::new(source));
    }

    drive(&mut queue).await;

    let history = queue.history();
    println!("{}", history.to_json()?);
    if let Some(path) = &args.history {
        append_history(path, history)?;
    }

    let failed = queue.status_counts().error;
    if failed > 0 {
        bail!("{failed} upload(s) failed");
    }
    if !queue.items().is_empty() {
        bail!("interrupted with {} upload(s) unfinished", queue.items().len());
    }
    Ok(())
}

/// Runs the dispatcher until idle. Ctrl-C pauses everything, leaving the
/// transfers resumable on the next invocation.
async fn drive(queue: &mut QueueManager) {
    loop {
        let next = tokio::select! {
            event = queue.next_event() => Some(event),
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(next) = next else {
            warn!("interrupted, pausing uploads");
            queue.pause_all();
            return;
        };
        let Some(event) = next else {
            return;
        };

        match event {
            QueueEvent::Progress {
                id,
                percent,
                bytes_per_second,
            } => {
                let speed = bytes_per_second.map(format_speed).unwrap_or_else(|| "-".into());
                info!(item = id, percent, speed = %speed, total = queue.total_progress(), "progress");
            }
            QueueEvent::Completed {
                id,
                file_name,
                resource_url,
            } => info!(item = id, file = %file_name, url = %resource_url, "uploaded"),
            QueueEvent::Failed { id, error } => error!(item = id, error = %error, "upload failed"),
        }
    }
}

/// Merges `history` in front of the entries already stored at `path`.
fn append_history(path: &Path, history: &HistoryLog) -> anyhow::Result<()> {
    let mut merged: Vec<HistoryEntry> = history.entries().to_vec();
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        if !content.trim().is_empty() {
            let existing: Vec<HistoryEntry> = serde_json::from_str(&content)
                .with_context(|| format!("parsing history file {}", path.display()))?;
            merged.extend(existing);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&merged)?)?;
    info!(path = %path.display(), entries = merged.len(), "history written");
    Ok(())
}

fn format_speed(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_second;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["dagflow-uploader"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn flags_override_config() {
        let args = args(&[
            "--endpoint",
            "https://up.example.com/files/",
            "--group",
            "task-7",
            "--chunk-size-mb",
            "2",
            "--parallel-chunks",
            "0",
            "--concurrency",
            "40",
            "a.bin",
        ]);
        let config = apply_overrides(Config::default(), &args);
        assert_eq!(config.endpoint, "https://up.example.com/files/");
        assert_eq!(config.queue.group_id, "task-7");
        assert_eq!(config.queue.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.queue.parallel_chunks, 1);
        assert_eq!(config.queue.concurrency_limit, 10);
        assert!(!config.queue.upload_data_during_creation);
    }

    #[test]
    fn creation_data_flag_turns_option_on() {
        let args = args(&["--upload-data-during-creation", "a.bin"]);
        let config = apply_overrides(Config::default(), &args);
        assert!(config.queue.upload_data_during_creation);
    }

    #[test]
    fn formats_speed() {
        assert_eq!(format_speed(512.0), "512.0 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KiB/s");
        assert_eq!(format_speed(5.0 * 1024.0 * 1024.0), "5.0 MiB/s");
    }

    #[test]
    fn history_is_prepended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");

        let mut first = HistoryLog::new();
        first.record(HistoryEntry::now("old.bin", 1, "u/1"));
        append_history(&path, &first).unwrap();

        let mut second = HistoryLog::new();
        second.record(HistoryEntry::now("new.bin", 2, "u/2"));
        append_history(&path, &second).unwrap();

        let stored: Vec<HistoryEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let names: Vec<_> = stored.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, ["new.bin", "old.bin"]);
    }

    #[tokio::test]
    async fn dry_run_uploads_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("report.txt");
        std::fs::write(&file, vec![b'x'; 3000]).unwrap();
        let history = dir.path().join("history.json");

        let args = args(&[
            "--dry-run",
            "--history",
            history.to_str().unwrap(),
            file.to_str().unwrap(),
        ]);
        let mut config = apply_overrides(Config::default(), &args);
        config.queue.chunk_size = 1024;

        run(config, args).await.unwrap();

        let stored: Vec<HistoryEntry> =
            serde_json::from_str(&std::fs::read_to_string(&history).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].file_name, "report.txt");
        assert_eq!(stored[0].size, 3000);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let args = args(&["--dry-run", dir.path().join("nope.bin").to_str().unwrap()]);
        assert!(run(Config::default(), args).await.is_err());
    }
}
