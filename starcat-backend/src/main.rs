use starcat_backend::config::StarcatConfig;
use starcat_backend::module::catalog::{QueryEngine, Store, ingest_eddb_file, ingest_file};
use starcat_backend::module::edsm::start_edsm_updater;

use anyhow::{Context, Result};
use starcat_common::Position;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const CONFIG_PATH: &str = "starcat.toml";
const WILDCARD_LIMIT: usize = 50;
const NEAR_LIMIT: usize = 50;

const USAGE: &str = "usage: starcat-backend [ingest <file> | eddb <file> | find <name> | wildcard <name> | near <x> <y> <z> <dist> | stats]";

fn parse_f64(value: Option<&String>, what: &str) -> Result<f64> {
    value
        .with_context(|| format!("missing {}\n{}", what, USAGE))?
        .parse()
        .with_context(|| format!("invalid {}", what))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("STARCAT_CONFIG").unwrap_or_else(|_| CONFIG_PATH.to_string());
    let config = StarcatConfig::load_or_default(&config_path)?;

    // Initialize logging
    let _logging_guard = starcat_backend::logging::init_logging(&config.log_settings())?;

    tracing::info!("Starcat backend starting...");
    let store = Arc::new(Store::open(&config.database_path).context("Failed to open catalog store")?);
    tracing::info!("{}", store.stats()?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str);
    let rest = args.get(1..).unwrap_or_default();

    match command {
        Some("ingest") => {
            let path = rest.first().context(USAGE)?.clone();
            let options = config.ingest.clone();
            let blocking_store = Arc::clone(&store);
            let report = tokio::task::spawn_blocking(move || {
                ingest_file(&blocking_store, &path, &options, || false)
            })
            .await??;
            for skipped in &report.skipped {
                println!("skipped {:?} {:?} {:?}: {}", skipped.line, skipped.edsm_id, skipped.name, skipped.cause);
            }
            println!(
                "{} read, {} inserted, {} updated, {} unchanged, {} skipped",
                report.records_read,
                report.inserted,
                report.updated,
                report.unchanged,
                report.skipped.len()
            );
        }
        Some("eddb") => {
            let path = rest.first().context(USAGE)?.clone();
            let blocking_store = Arc::clone(&store);
            let report = tokio::task::spawn_blocking(move || ingest_eddb_file(&blocking_store, &path)).await??;
            println!("{} read, {} upserted", report.records_read, report.upserted);
        }
        Some("find") => {
            let engine = QueryEngine::new(Arc::clone(&store));
            for system in engine.find_exact(&rest.join(" "))? {
                println!("{}", system);
                if let Some(info) = engine.eddb_info(system.edsm_id)? {
                    println!("    population {} ({:?}, {:?})", info.population, info.government, info.allegiance);
                }
            }
        }
        Some("wildcard") => {
            let engine = QueryEngine::new(Arc::clone(&store));
            for system in engine.find_wildcard(&rest.join(" "), WILDCARD_LIMIT)? {
                println!("{}", system);
            }
        }
        Some("near") => {
            let centre = Position::new(
                parse_f64(rest.first(), "x")?,
                parse_f64(rest.get(1), "y")?,
                parse_f64(rest.get(2), "z")?,
            );
            let max_dist = parse_f64(rest.get(3), "distance")?;
            let engine = QueryEngine::new(Arc::clone(&store));
            for nearby in engine.k_nearest(&centre, NEAR_LIMIT, 0.0, max_dist, true)? {
                println!("{:>10.2} ly  {}", nearby.distance, nearby.system);
            }
        }
        Some("stats") => {
            println!("{}", store.stats()?);
        }
        Some(other) => {
            anyhow::bail!("unknown command '{}'\n{}", other, USAGE);
        }
        None => {
            let (handle, shutdown) =
                start_edsm_updater(Arc::clone(&store), config.edsm.clone(), config.ingest.clone()).await?;
            tracing::info!("EDSM updater running, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down...");
            shutdown.store(true, Ordering::SeqCst);
            handle.abort();
        }
    }

    Ok(())
}
