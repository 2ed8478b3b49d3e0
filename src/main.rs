use anyhow::{Context, Result};
use axum::Router;
use datalake::{
    config::{AppConfig, Mode},
    models::data::Location,
    routes,
    services::{
        BlobService,
        bucket::DiskBucket,
        cache::ResponseCache,
        db::MetadataStore,
        location::{LocationSelector, Shard},
        signer::UrlSigner,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting datalake with config: {:?}", cfg);
    if cfg.ephemeral_secret {
        tracing::warn!(
            "DATALAKE_SIGNING_SECRET is not set; signed URLs will not survive a restart"
        );
    }

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("invalid database url {}", db_url))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    let db = MetadataStore::new(Arc::new(pool));

    // --- Handle migration mode ---
    let applied = db.migrate().await?;
    if mode == Mode::Migrate {
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(()); // exit after migration
    }

    // --- Initialize buckets, one per location ---
    let mut shards = Vec::with_capacity(cfg.locations.len());
    for loc in &cfg.locations {
        let root = Path::new(&cfg.storage_dir).join(loc);
        let bucket = DiskBucket::open(format!("datalake-{}", loc), root).await?;
        shards.push(Shard {
            location: Location::new(loc.as_str()),
            bucket: Arc::new(bucket),
        });
    }
    let locations = LocationSelector::new(shards).context("no storage locations configured")?;

    // --- Initialize core service ---
    let service = BlobService::new(
        db,
        locations,
        UrlSigner::new(&cfg.signing_secret.0, &cfg.public_url, cfg.signed_url_ttl()),
        ResponseCache::new(cfg.cache_entries, cfg.cache_max_object_bytes),
        cfg.settings(),
    );

    if mode == Mode::Sweep {
        let report = service.sweep().await?;
        tracing::info!(?report, "Sweep complete.");
        service.wait_background().await;
        return Ok(());
    }

    if let Some(secs) = cfg.sweep_interval_secs.filter(|s| *s > 0) {
        let sweeper = service.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                match sweeper.sweep().await {
                    Ok(report) => tracing::info!(?report, "Periodic sweep complete"),
                    Err(err) => tracing::error!(error = %err, "Periodic sweep failed"),
                }
            }
        });
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let pending cleanup and media copies finish.
    service.wait_background().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", err);
    }
    tracing::info!("Shutting down");
}
