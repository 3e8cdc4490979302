//! Stand-in storefront application
//!
//! Serves the landing page and static assets the harness validates. Used
//! by the integration tests and for local smoke runs of the runner.

use std::net::SocketAddr;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use clap::Parser;
use tracing::{error, info};

const FAVICON_ETAG: &str = "\"storefront-favicon-1\"";

// Minimal 1x1 ICO
const FAVICON: &[u8] = &[
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x20, 0x00, 0x30, 0x00,
    0x00, 0x00, 0x16, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const SITE_CSS: &str = "body { padding-top: 50px; padding-bottom: 20px; }\n\
.body-content { padding-left: 15px; padding-right: 15px; }\n";

#[derive(Parser)]
#[command(name = "storefront-stub")]
#[command(about = "Stand-in storefront application for the publish-and-run harness")]
struct Cli {
    /// Base URL to listen on
    #[arg(long, default_value = "http://localhost:5025/")]
    urls: String,

    /// Server type label, shown on the landing page
    #[arg(long, default_value = "standalone")]
    server: String,

    /// Exit with an error instead of serving
    #[arg(long, env = "STOREFRONT_FAIL_STARTUP", value_parser = clap::builder::BoolishValueParser::new())]
    fail_startup: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.fail_startup {
        error!("Startup failure requested");
        anyhow::bail!("startup failure requested");
    }

    let addr = listen_addr(&cli.urls)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Storefront ({}) listening on http://{}", cli.server, addr);

    axum::serve(listener, router(cli.server))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Storefront stopped");
    Ok(())
}

fn listen_addr(urls: &str) -> anyhow::Result<SocketAddr> {
    let url = reqwest::Url::parse(urls)?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("no port in '{}'", urls))?;
    let host = match url.host_str() {
        Some("localhost") | None => "127.0.0.1",
        Some(host) => host.trim_start_matches('[').trim_end_matches(']'),
    };
    Ok(SocketAddr::new(host.parse()?, port))
}

fn router(server: String) -> Router {
    Router::new()
        .route("/", get(move || home_handler(server.clone())))
        .route("/favicon.ico", get(favicon_handler))
        .route("/Content/site.css", get(css_handler))
        .route("/health", get(|| async { "ok" }))
}

async fn home_handler(server: String) -> impl IntoResponse {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8" />
    <title>Home Page – Storefront</title>
    <link rel="stylesheet" href="/Content/site.css" />
</head>
<body>
    <nav>
        <a href="/">Home</a>
        <a href="/Account/Register">Register</a>
        <a href="/Account/Login">Login</a>
    </nav>
    <div class="body-content">
        <img src="/Images/home-showcase.png" alt="Showcase" />
        <footer>Served by {}</footer>
    </div>
</body>
</html>
"#,
        server
    ))
}

async fn favicon_handler(headers: HeaderMap) -> impl IntoResponse {
    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tag| tag.trim() == FAVICON_ETAG))
        .unwrap_or(false);

    if matches {
        (StatusCode::NOT_MODIFIED, [(header::ETAG, FAVICON_ETAG)]).into_response()
    } else {
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/x-icon"),
                (header::ETAG, FAVICON_ETAG),
            ],
            FAVICON,
        )
            .into_response()
    }
}

async fn css_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css")], SITE_CSS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
