use crate::config::MAX_HEADER_BYTES;
use crate::upstream::node::{LocationInfo, ProxyNode};
use crate::upstream::registry::UpstreamRegistry;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Dial and per-read ceiling for a single probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Known-good CONNECT target used to verify a proxy actually tunnels.
const PROBE_TARGET: &str = "httpbin.org:443";

/// Budget for one geolocation lookup through the proxy.
const LOCATION_TIMEOUT: Duration = Duration::from_secs(10);

/// How many nodes are probed concurrently per round.
const PROBE_CONCURRENCY: usize = 16;

/// Run one round of probes across the whole pool, resolving location for
/// nodes that still lack one. The caller owns the loop / scheduling.
pub async fn run_probe_round(registry: &UpstreamRegistry) {
    let nodes = registry.proxies();
    if nodes.is_empty() {
        return;
    }

    stream::iter(nodes.iter().cloned())
        .map(|node| async move {
            probe(&node).await;
            if node.location_unknown() {
                resolve_location(&node).await;
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

/// Run a CONNECT health check against a single node.
///
/// A real handshake to a known target is the only signal that counts: a
/// proxy that accepts TCP but refuses CONNECT is just as dead as one that
/// never answers. Every failure mode collapses to unhealthy + unknown
/// latency; `last_checked` is stamped no matter what.
pub async fn probe(node: &Arc<ProxyNode>) {
    let start = Instant::now();

    match probe_handshake(node, start).await {
        Ok(latency_ms) => {
            node.mark_probe_success(latency_ms);
            metrics::gauge!("pg_upstream_health_status", "proxy" => node.host.clone()).set(1.0);
            metrics::counter!("pg_health_check_total", "result" => "success").increment(1);
            debug!(
                "health: check passed, node={}:{}, latency_ms={}",
                node.host, node.port, latency_ms
            );
        }
        Err(e) => {
            node.mark_probe_failure();
            metrics::gauge!("pg_upstream_health_status", "proxy" => node.host.clone()).set(0.0);
            metrics::counter!("pg_health_check_total", "result" => "failure").increment(1);
            debug!("health: check failed, node={}:{}, error={}", node.host, node.port, e);
        }
    }

    node.touch_last_checked(epoch_secs());
}

async fn probe_handshake(node: &ProxyNode, start: Instant) -> std::io::Result<i64> {
    let mut stream = timeout(
        PROBE_TIMEOUT,
        TcpStream::connect((node.host.as_str(), node.port)),
    )
    .await
    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

    let mut req = format!("CONNECT {PROBE_TARGET} HTTP/1.1\r\nHost: {PROBE_TARGET}\r\n");
    if let Some(cred) = &node.basic_credential {
        req.push_str(&format!("Proxy-Authorization: Basic {cred}\r\n"));
    }
    req.push_str("\r\n");

    stream.write_all(req.as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    while !contains(&response, b"\r\n\r\n") {
        let n = timeout(PROBE_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() > MAX_HEADER_BYTES {
            break;
        }
    }

    if contains(first_line(&response), b"200") {
        Ok(start.elapsed().as_millis() as i64)
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "probe refused",
        ))
    }
}

/// Best-effort lookup of the node's exit IP and location, routed through
/// the node itself. Never influences selection; every error is swallowed.
pub async fn resolve_location(node: &ProxyNode) {
    let Ok(proxy) = reqwest::Proxy::all(&node.url) else {
        return;
    };
    let Ok(client) = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(LOCATION_TIMEOUT)
        .build()
    else {
        return;
    };
    let Ok(resp) = client.get("http://ip-api.com/json/").send().await else {
        return;
    };
    if !resp.status().is_success() {
        return;
    }
    let Ok(data) = resp.json::<serde_json::Value>().await else {
        return;
    };

    let country_code = data
        .get("countryCode")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let exit_ip = data
        .get("query")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let city = data
        .get("city")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown");

    node.set_location(LocationInfo {
        label: format!("{}, {}", city, country_code.as_deref().unwrap_or("Unknown")),
        country_code,
        exit_ip,
    });
}

pub(crate) fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

pub(crate) fn first_line(buf: &[u8]) -> &[u8] {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => &buf[..pos],
        None => buf,
    }
}
