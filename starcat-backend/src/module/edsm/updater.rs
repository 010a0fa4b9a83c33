///! EDSM updater - scheduled dump download and ingest
///!
///! Each cycle downloads the systems dump, ingests it on the blocking pool,
///! records the newest record timestamp in the Register table and, when
///! configured, refreshes the EDDB enrichment table the same way.

use super::download::{build_client, download_to_file};
use crate::module::catalog::{
    EddbReport, IngestOptions, IngestReport, Store, ingest_eddb_file, ingest_file,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use starcat_common::parse_edsm_date;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECONDS: u64 = 60;

/// Register key holding the newest EDSM record timestamp ingested
pub const SETTING_LAST_SYSTEMS: &str = "EDSMLastSystems";

/// Register key holding the time of the last EDDB refresh
pub const SETTING_LAST_EDDB: &str = "EDDBLastUpdate";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdsmConfig {
    #[serde(default = "default_systems_url")]
    pub systems_url: String,

    /// EDDB populated systems dump; no EDDB refresh when unset
    #[serde(default)]
    pub eddb_url: Option<String>,

    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    #[serde(default = "default_update_interval_minutes")]
    pub update_interval_minutes: u64,

    #[serde(default = "default_perform_initial_update")]
    pub perform_initial_update: bool,

    #[serde(default = "default_download_timeout_seconds")]
    pub download_timeout_seconds: u64,
}

fn default_systems_url() -> String {
    "https://www.edsm.net/dump/systemsWithCoordinates7days.json".to_string()
}

fn default_download_dir() -> String {
    "data/dumps".to_string()
}

fn default_update_interval_minutes() -> u64 {
    24 * 60
}

fn default_perform_initial_update() -> bool {
    true
}

fn default_download_timeout_seconds() -> u64 {
    3600
}

impl Default for EdsmConfig {
    fn default() -> Self {
        Self {
            systems_url: default_systems_url(),
            eddb_url: None,
            download_dir: default_download_dir(),
            update_interval_minutes: default_update_interval_minutes(),
            perform_initial_update: default_perform_initial_update(),
            download_timeout_seconds: default_download_timeout_seconds(),
        }
    }
}

/// Result of one update cycle
#[derive(Debug, Clone, Default)]
pub struct UpdateSummary {
    pub downloaded_bytes: u64,
    pub systems: IngestReport,
    pub eddb: Option<EddbReport>,
}

/// Keeps the catalog in step with the EDSM dumps
pub struct EdsmUpdater {
    store: Arc<Store>,
    config: EdsmConfig,
    ingest: IngestOptions,
    client: Client,
    shutdown: Arc<AtomicBool>,
}

impl EdsmUpdater {
    pub fn new(store: Arc<Store>, config: EdsmConfig, ingest: IngestOptions) -> Result<Self> {
        let client = build_client(config.download_timeout_seconds)?;
        Ok(Self {
            store,
            config,
            ingest,
            client,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the scheduled loop and cancels an ingest in progress
    /// after its current batch
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Newest EDSM record timestamp stored so far
    pub fn last_systems_update(&self) -> Result<Option<DateTime<Utc>>> {
        let value = self
            .store
            .get_setting(SETTING_LAST_SYSTEMS)
            .context("Failed to read last systems update")?;
        Ok(value.as_deref().and_then(parse_edsm_date))
    }

    fn record_last_systems_update(&self, max_date: DateTime<Utc>) -> Result<()> {
        if self.last_systems_update()?.is_some_and(|last| last >= max_date) {
            return Ok(());
        }
        self.store
            .put_setting(SETTING_LAST_SYSTEMS, &max_date.to_rfc3339())
            .context("Failed to store last systems update")?;
        tracing::info!("EDSM systems now current to {}", max_date);
        Ok(())
    }

    /// Ingest a local systems dump on the blocking pool
    pub async fn ingest_systems_file(&self, path: impl AsRef<Path>) -> Result<IngestReport> {
        let path = path.as_ref().to_path_buf();
        let store = Arc::clone(&self.store);
        let options = self.ingest.clone();
        let shutdown = Arc::clone(&self.shutdown);

        let report = tokio::task::spawn_blocking(move || {
            ingest_file(&store, &path, &options, || shutdown.load(Ordering::SeqCst))
        })
        .await
        .context("Systems ingest task panicked")?
        .context("Systems ingest failed")?;

        if let Some(max_date) = report.max_date {
            self.record_last_systems_update(max_date)?;
        }
        Ok(report)
    }

    /// Ingest a local EDDB dump on the blocking pool
    pub async fn ingest_eddb_file(&self, path: impl AsRef<Path>) -> Result<EddbReport> {
        let path = path.as_ref().to_path_buf();
        let store = Arc::clone(&self.store);

        let report = tokio::task::spawn_blocking(move || ingest_eddb_file(&store, &path))
            .await
            .context("EDDB ingest task panicked")?
            .context("EDDB ingest failed")?;

        self.store
            .put_setting(SETTING_LAST_EDDB, &Utc::now().to_rfc3339())
            .context("Failed to store last EDDB update")?;
        Ok(report)
    }

    fn dump_path(&self, file_name: &str) -> PathBuf {
        Path::new(&self.config.download_dir).join(file_name)
    }

    /// Download and ingest once
    pub async fn update_once(&self) -> Result<UpdateSummary> {
        if let Some(last) = self.last_systems_update()? {
            tracing::info!("Last EDSM record ingested: {}", last);
        }

        let systems_path = self.dump_path("systems.json");
        let mut downloaded_bytes = download_to_file(&self.client, &self.config.systems_url, &systems_path)
            .await
            .context("Failed to download systems dump")?;
        let systems = self.ingest_systems_file(&systems_path).await?;

        let mut eddb = None;
        if let Some(url) = &self.config.eddb_url {
            if systems.cancelled {
                tracing::info!("Skipping EDDB refresh after cancelled systems ingest");
            } else {
                let eddb_path = self.dump_path("eddb_systems.jsonl");
                downloaded_bytes += download_to_file(&self.client, url, &eddb_path)
                    .await
                    .context("Failed to download EDDB dump")?;
                eddb = Some(self.ingest_eddb_file(&eddb_path).await?);
            }
        }

        Ok(UpdateSummary {
            downloaded_bytes,
            systems,
            eddb,
        })
    }

    /// Start updater with immediate initial update
    ///
    /// Performs one update immediately, then starts the scheduled loop.
    pub async fn start_with_initial_update(self) -> Result<JoinHandle<()>> {
        tracing::info!("Starting EDSM updater (initial update + schedule)");
        self.run_update_cycle().await;

        let handle = tokio::spawn(async move {
            self.run_scheduled_loop().await;
        });
        Ok(handle)
    }

    /// Start updater without initial update
    pub async fn start(self) -> Result<JoinHandle<()>> {
        tracing::info!("Starting EDSM updater (scheduled only)");
        let handle = tokio::spawn(async move {
            self.run_scheduled_loop().await;
        });
        Ok(handle)
    }

    async fn run_scheduled_loop(&self) {
        let interval = Duration::from_secs(self.config.update_interval_minutes.max(1) * 60);
        while !self.is_shutdown() {
            let next = Utc::now() + chrono::Duration::seconds(interval.as_secs() as i64);
            tracing::info!(
                "Next EDSM update scheduled at: {} (in {:.1} minutes)",
                next.format("%Y-%m-%d %H:%M:%S UTC"),
                interval.as_secs_f64() / 60.0
            );

            tokio::time::sleep(interval).await;
            if self.is_shutdown() {
                break;
            }
            self.run_update_cycle().await;
        }
        tracing::info!("EDSM updater stopped");
    }

    /// Run a single update cycle with retries
    async fn run_update_cycle(&self) {
        for attempt in 1..=MAX_RETRIES {
            if self.is_shutdown() {
                return;
            }
            tracing::info!("Starting EDSM update (attempt {}/{})", attempt, MAX_RETRIES);

            match self.update_once().await {
                Ok(summary) => {
                    tracing::info!(
                        "✓ EDSM update completed: {} bytes, {} inserted, {} updated, {} skipped, {:.2}s",
                        summary.downloaded_bytes,
                        summary.systems.inserted,
                        summary.systems.updated,
                        summary.systems.skipped.len(),
                        summary.systems.duration_seconds
                    );
                    if let Some(eddb) = &summary.eddb {
                        tracing::info!("✓ EDDB refresh completed: {} upserted", eddb.upserted);
                    }
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        "✗ EDSM update failed (attempt {}/{}): {:#}",
                        attempt,
                        MAX_RETRIES,
                        e
                    );
                }
            }

            if attempt < MAX_RETRIES {
                let delay = Duration::from_secs(RETRY_DELAY_SECONDS * attempt as u64);
                tracing::info!("Retrying in {:?}...", delay);
                tokio::time::sleep(delay).await;
            } else {
                tracing::error!("EDSM update failed after {} attempts, giving up", MAX_RETRIES);
            }
        }
    }
}

/// Helper function to create and start updater
pub async fn start_edsm_updater(
    store: Arc<Store>,
    config: EdsmConfig,
    ingest: IngestOptions,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>)> {
    let initial_update = config.perform_initial_update;
    let updater = EdsmUpdater::new(store, config, ingest)?;
    let shutdown = updater.shutdown_handle();

    let handle = if initial_update {
        updater.start_with_initial_update().await?
    } else {
        updater.start().await?
    };
    Ok((handle, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::catalog::testutil::edsm_line;

    fn temp_dump(name: &str, lines: &[String]) -> PathBuf {
        let dir = std::env::temp_dir().join("starcat_updater_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("[\n{}\n]\n", lines.join(",\n"))).unwrap();
        path
    }

    fn updater(batch_size: usize) -> EdsmUpdater {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ingest = IngestOptions {
            batch_size,
            ..Default::default()
        };
        let config = EdsmConfig {
            systems_url: "http://127.0.0.1:9/systems.json".to_string(),
            download_dir: std::env::temp_dir()
                .join("starcat_updater_test_dl")
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        };
        EdsmUpdater::new(store, config, ingest).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_records_last_update() {
        let updater = updater(1000);
        assert_eq!(updater.last_systems_update().unwrap(), None);

        let newer = temp_dump(
            "newer.json",
            &[
                edsm_line(1, "Sol", 0.0, 0.0, 0.0, "2021-06-01 12:00:00"),
                edsm_line(2, "Wolf 359", 3.875, 6.46875, -1.90625, "2021-06-02 12:00:00"),
            ],
        );
        let report = updater.ingest_systems_file(&newer).await.unwrap();
        assert_eq!(report.inserted, 2);

        let last = updater.last_systems_update().unwrap().unwrap();
        assert_eq!(last.to_rfc3339(), "2021-06-02T12:00:00+00:00");

        // an older dump never moves the marker back
        let older = temp_dump(
            "older.json",
            &[edsm_line(3, "Sirius", 6.25, -1.28125, -5.75, "2020-01-01 00:00:00")],
        );
        updater.ingest_systems_file(&older).await.unwrap();
        assert_eq!(updater.last_systems_update().unwrap(), Some(last));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_ingest() {
        let updater = updater(1);
        updater.shutdown_handle().store(true, Ordering::SeqCst);

        let dump = temp_dump(
            "cancel.json",
            &[
                edsm_line(1, "Sol", 0.0, 0.0, 0.0, "2021-06-01 12:00:00"),
                edsm_line(2, "Wolf 359", 3.875, 6.46875, -1.90625, "2021-06-02 12:00:00"),
            ],
        );
        let report = updater.ingest_systems_file(&dump).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn test_update_once_reports_download_failure() {
        let updater = updater(1000);
        let result = updater.update_once().await;
        assert!(result.is_err());
        assert_eq!(updater.last_systems_update().unwrap(), None);
    }

    #[test]
    fn test_config_defaults() {
        let config: EdsmConfig = toml::from_str("").unwrap();
        assert_eq!(config.update_interval_minutes, 1440);
        assert!(config.perform_initial_update);
        assert!(config.eddb_url.is_none());
    }
}
