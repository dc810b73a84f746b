//! `inference-router health`: check the health of a running instance.
//!
//! Sends a `GET /health` request to the specified URL and displays the
//! response as formatted text or raw JSON.

use std::time::Duration;

use http_body_util::BodyExt;

use crate::cli::HealthArgs;
use crate::error::RouterError;
use crate::health::HealthResponse;
use crate::server::build_http_client;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn execute(args: HealthArgs) -> Result<(), RouterError> {
    let url = format!("{}/health", args.url.trim_end_matches('/'));
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| RouterError::UriParse {
            source: Box::new(e),
        })?;

    let client = build_http_client();
    let req = hyper::Request::builder()
        .uri(uri)
        .body(http_body_util::Full::new(bytes::Bytes::new()))
        .map_err(|e| RouterError::HttpRequest {
            source: Box::new(e),
        })?;

    let response = tokio::time::timeout(HEALTH_TIMEOUT, client.request(req))
        .await
        .map_err(|_| RouterError::HttpRequest {
            source: "health check timed out after 10s".into(),
        })?
        .map_err(|e| RouterError::HttpRequest {
            source: Box::new(e),
        })?;

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| RouterError::HttpRequest {
            source: Box::new(e),
        })?
        .to_bytes();

    if !status.is_success() {
        return Err(RouterError::HealthCheckFailed(status));
    }

    if args.json {
        println!("{}", String::from_utf8_lossy(&body));
        return Ok(());
    }

    match serde_json::from_slice::<HealthResponse>(&body) {
        Ok(health) => print_report(&args.url, &health),
        Err(e) => {
            eprintln!("Failed to parse health response: {e}");
            println!("{}", String::from_utf8_lossy(&body));
        }
    }

    Ok(())
}

fn print_report(url: &str, health: &HealthResponse) {
    println!("\u{2713} inference-router is {} ({url})", health.status);
    println!("  version:   {}", health.version);
    println!("  uptime:    {}", format_uptime(health.uptime_seconds));
    println!(
        "  policies:  {} loaded from {} (store: {})",
        health.policies.count,
        health.policies.origin.as_deref().unwrap_or("nowhere"),
        health.policies.store.as_deref().unwrap_or("none"),
    );
    println!(
        "  backends:  {} total, {} healthy, {} unhealthy",
        health.backends.total, health.backends.healthy, health.backends.unhealthy
    );
    println!(
        "  usage:     {} pending, publisher {}",
        health.usage.pending_records, health.usage.publisher
    );
    println!(
        "  requests:  {} dispatched, {} failed, {} rejected",
        health.stats.requests_dispatched,
        health.stats.requests_failed,
        health.stats.requests_rejected
    );
    if health.stats.rate_limit_fail_open + health.stats.budget_fail_open > 0 {
        println!(
            "  fail-open: {} rate limit, {} budget",
            health.stats.rate_limit_fail_open, health.stats.budget_fail_open
        );
    }
}

fn format_uptime(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
