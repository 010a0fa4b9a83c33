///! Dump file download
///!
///! Dumps are large, so the body is streamed to a `.part` file chunk by chunk
///! and renamed into place once complete.

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Build the HTTP client used for dump downloads
pub fn build_client(timeout_seconds: u64) -> Result<Client> {
    Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .timeout(std::time::Duration::from_secs(timeout_seconds))
        .user_agent(concat!("starcat/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build reqwest client")
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Download `url` to `dest`, returning the number of bytes written
pub async fn download_to_file(client: &Client, url: &str, dest: impl AsRef<Path>) -> Result<u64> {
    let dest = dest.as_ref();
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create download directory {:?}", parent))?;
        }
    }

    tracing::info!("Downloading {} to {:?}", url, dest);

    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to GET {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP error: {} ({})", response.status(), url);
    }

    let part = part_path(dest);
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("Failed to create {:?}", part))?;

    let mut written: u64 = 0;
    let mut next_report: u64 = 256 * 1024 * 1024;
    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed to read response body")?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {:?}", part))?;
        written += chunk.len() as u64;

        if written >= next_report {
            tracing::info!("Downloaded {} MiB of {}", written / (1024 * 1024), url);
            next_report += 256 * 1024 * 1024;
        }
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&part, dest)
        .await
        .with_context(|| format!("Failed to move {:?} into place", part))?;

    tracing::info!("Downloaded {} bytes to {:?}", written, dest);
    Ok(written)
}
