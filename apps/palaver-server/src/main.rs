#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use palaver_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let database_url = std::env::var("PALAVER_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("PALAVER_DATABASE_URL is required for runtime"))?;
    let notify_url = std::env::var("PALAVER_NOTIFY_URL").ok();
    let notify_timeout_secs = std::env::var("PALAVER_NOTIFY_TIMEOUT_SECS").map_or_else(
        |_| Ok(AppConfig::default().notify_timeout.as_secs()),
        |value| {
            value.parse::<u64>().map_err(|e| {
                anyhow::anyhow!("invalid PALAVER_NOTIFY_TIMEOUT_SECS value {value:?}: {e}")
            })
        },
    )?;
    let page_size = std::env::var("PALAVER_PAGE_SIZE").map_or_else(
        |_| Ok(AppConfig::default().page_size),
        |value| {
            value
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("invalid PALAVER_PAGE_SIZE value {value:?}: {e}"))
        },
    )?;
    let max_upload_bytes = std::env::var("PALAVER_MAX_UPLOAD_BYTES").map_or_else(
        |_| Ok(AppConfig::default().max_upload_bytes),
        |value| {
            value.parse::<usize>().map_err(|e| {
                anyhow::anyhow!("invalid PALAVER_MAX_UPLOAD_BYTES value {value:?}: {e}")
            })
        },
    )?;

    let app_config = AppConfig {
        upload_root: std::env::var("PALAVER_UPLOAD_ROOT")
            .map_or_else(|_| PathBuf::from("./data/uploads"), PathBuf::from),
        notify_url,
        notify_timeout: Duration::from_secs(notify_timeout_secs),
        page_size,
        max_upload_bytes,
        database_url: Some(database_url),
        ..AppConfig::default()
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("PALAVER_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid PALAVER_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "palaver-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
