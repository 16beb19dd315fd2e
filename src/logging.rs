//! Diagnostic logging (via `tracing`) and the per-connection common-log
//! line specified in SPEC_FULL.md §7, kept on a separate buffered/rotated
//! writer since its field layout is fixed and parseable rather than a
//! human-readable tracing span.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    pub common_log: CommonLogConfig,
    pub rotation: LogRotationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonLogConfig {
    pub enabled: bool,
    pub path: String,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogRotationConfig {
    pub enabled: bool,
    pub max_size_mb: u64,
    pub max_backups: u32,
    pub compress: bool,
}

/// One line per completed or rejected connection (SPEC_FULL.md §7).
#[derive(Debug, Clone, Serialize)]
pub struct CommonLogEntry {
    pub timestamp: DateTime<Utc>,
    pub peer: String,
    pub peer_pid: Option<u32>,
    pub protocol: String,
    pub proxy_name: Option<String>,
    pub request_line: String,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub content_length: Option<u64>,
    pub ttfb_ms: Option<u64>,
    pub total_ms: u64,
    pub status: u16,
    pub app_name: Option<String>,
    /// `,` for a keep-alive boundary, `.` for connection close.
    pub mark: char,
}

impl CommonLogEntry {
    fn format(&self) -> String {
        format!(
            "{} {} {} {} {} \"{}\" up={} down={} cl={} ttfb={} total={}ms status={} app={}{}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.peer,
            self.peer_pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.protocol,
            self.proxy_name.as_deref().unwrap_or("-"),
            self.request_line,
            self.upload_bytes,
            self.download_bytes,
            self.content_length
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.ttfb_ms
                .map(|t| format!("{}ms", t))
                .unwrap_or_else(|| "-".to_string()),
            self.total_ms,
            self.status,
            self.app_name.as_deref().unwrap_or("-"),
            self.mark,
        )
    }
}

pub struct LogManager {
    config: LogConfig,
    writer: Arc<RwLock<Option<File>>>,
    buffer: Arc<RwLock<Vec<CommonLogEntry>>>,
}

impl LogManager {
    pub fn new(config: LogConfig) -> Result<Self> {
        let writer = if config.common_log.enabled {
            Some(Self::open_log_file(&config.common_log.path)?)
        } else {
            None
        };

        let manager = Self {
            config,
            writer: Arc::new(RwLock::new(writer)),
            buffer: Arc::new(RwLock::new(Vec::new())),
        };

        manager.start_flush_task();
        if manager.config.rotation.enabled {
            manager.start_rotation_task();
        }

        Ok(manager)
    }

    fn open_log_file(path: &str) -> Result<File> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    pub async fn log(&self, entry: CommonLogEntry) {
        if !self.config.common_log.enabled {
            return;
        }
        let mut buffer = self.buffer.write().await;
        buffer.push(entry);
        if buffer.len() >= self.config.common_log.buffer_size {
            drop(buffer);
            self.flush().await;
        }
    }

    async fn flush(&self) {
        let mut buffer = self.buffer.write().await;
        if buffer.is_empty() {
            return;
        }
        let entries = buffer.drain(..).collect::<Vec<_>>();
        drop(buffer);

        let mut writer = self.writer.write().await;
        if let Some(file) = writer.as_mut() {
            for entry in entries {
                if let Err(e) = writeln!(file, "{}", entry.format()) {
                    error!("failed to write common log: {}", e);
                }
            }
            let _ = file.flush();
        }
    }

    fn start_flush_task(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                manager.flush().await;
            }
        });
    }

    fn start_rotation_task(&self) {
        let config = self.config.clone();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                if let Err(e) =
                    Self::rotate_log_file(&config.common_log.path, &config.rotation, writer.clone())
                        .await
                {
                    error!("failed to rotate common log: {}", e);
                }
            }
        });
    }

    async fn rotate_log_file(
        path: &str,
        config: &LogRotationConfig,
        writer: Arc<RwLock<Option<File>>>,
    ) -> Result<()> {
        let path = Path::new(path);
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };

        let size_mb = metadata.len() / (1024 * 1024);
        if size_mb < config.max_size_mb {
            return Ok(());
        }

        info!("rotating common log: {:?}", path);

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotation_path = path.with_extension(format!("{}.log", timestamp));
        fs::rename(path, &rotation_path)?;

        if config.compress {
            Self::compress_log_file(&rotation_path)?;
        }

        let new_file = Self::open_log_file(path.to_str().unwrap())?;
        *writer.write().await = Some(new_file);

        Self::cleanup_old_logs(path, config)?;
        Ok(())
    }

    fn compress_log_file(path: &Path) -> Result<()> {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut input = File::open(path)?;
        let output_path = path.with_extension("gz");
        let output = File::create(&output_path)?;

        let mut encoder = GzEncoder::new(output, Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;

        fs::remove_file(path)?;
        info!("compressed common log to {:?}", output_path);
        Ok(())
    }

    fn cleanup_old_logs(base_path: &Path, config: &LogRotationConfig) -> Result<()> {
        let parent = base_path.parent().unwrap_or(Path::new("."));
        let base_name = base_path.file_stem().unwrap_or_default().to_string_lossy();

        let mut rotated: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            let path = entry.path();
            let file_name = path.file_name().unwrap_or_default().to_string_lossy();
            if file_name.starts_with(base_name.as_ref()) && file_name != base_path.file_name().unwrap_or_default().to_string_lossy() {
                if let Ok(metadata) = entry.metadata() {
                    if let Ok(modified) = metadata.modified() {
                        rotated.push((path, modified));
                    }
                }
            }
        }
        rotated.sort_by_key(|k| k.1);
        while rotated.len() > config.max_backups as usize {
            let (path, _) = rotated.remove(0);
            fs::remove_file(&path)?;
            info!("removed old common log: {:?}", path);
        }
        Ok(())
    }
}

impl Clone for LogManager {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            writer: self.writer.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            common_log: CommonLogConfig {
                enabled: true,
                path: "logs/common.log".to_string(),
                buffer_size: 100,
            },
            rotation: LogRotationConfig {
                enabled: true,
                max_size_mb: 100,
                max_backups: 10,
                compress: true,
            },
        }
    }
}

/// Installs the `tracing` subscriber for stderr diagnostics. Controlled
/// by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
