use crate::config::{HEADER_READ_CHUNK, MAX_HEADER_BYTES, MAX_RETRIES};
use crate::error::UpstreamError;
use crate::server::ServerState;
use crate::upstream::health::{contains, first_line};
use crate::upstream::{ActiveGuard, ProxyNode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const RESP_200: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESP_405: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
const RESP_407: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"ProxyGuard\"\r\n\r\n";
const RESP_413: &[u8] = b"HTTP/1.1 413 Payload Too Large\r\n\r\n";
const RESP_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const RESP_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";
const RESP_504: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";

/// Enable TCP_NODELAY and SO_KEEPALIVE; failures are ignored because
/// neither knob is load-bearing for correctness.
pub(crate) fn set_fast_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let _ = socket2::SockRef::from(stream).set_keepalive(true);
}

/// Handle a single accepted client connection from header read to tunnel
/// teardown. Never returns an error: every failure path replies (or closes
/// silently) and converges on the same teardown.
pub async fn handle_client(stream: TcpStream, state: ServerState) {
    state.active_clients.fetch_add(1, Ordering::Relaxed);
    metrics::gauge!("pg_active_connections").increment(1.0);
    set_fast_socket(&stream);

    tunnel(stream, &state).await;

    state.active_clients.fetch_sub(1, Ordering::Relaxed);
    metrics::gauge!("pg_active_connections").decrement(1.0);
}

enum HeaderRead {
    Block(Vec<u8>),
    TooLarge,
    Closed,
}

async fn read_header_block(stream: &mut TcpStream) -> std::io::Result<HeaderRead> {
    let mut buffer = Vec::with_capacity(HEADER_READ_CHUNK);
    let mut chunk = vec![0u8; HEADER_READ_CHUNK];
    while !contains(&buffer, b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(HeaderRead::Closed);
        }
        buffer.extend_from_slice(&chunk[..n]);
        if !contains(&buffer, b"\r\n\r\n") && buffer.len() >= MAX_HEADER_BYTES {
            return Ok(HeaderRead::TooLarge);
        }
    }
    Ok(HeaderRead::Block(buffer))
}

async fn respond(stream: &mut TcpStream, response: &[u8]) {
    let _ = stream.write_all(response).await;
    let _ = stream.flush().await;
}

async fn tunnel(mut client: TcpStream, state: &ServerState) {
    // ---------- 1. read client headers ----------
    let header_block = match read_header_block(&mut client).await {
        Ok(HeaderRead::Block(block)) => block,
        Ok(HeaderRead::TooLarge) => {
            warn!("client header too large");
            respond(&mut client, RESP_413).await;
            return;
        }
        // EOF before the delimiter, or an unreadable socket: close silently.
        Ok(HeaderRead::Closed) | Err(_) => return,
    };

    // ---------- 2. parse request line and user-agent ----------
    let Some(request) = state.parser.parse(&header_block) else {
        respond(&mut client, RESP_405).await;
        return;
    };

    // ---------- 3. authentication ----------
    let mut cid = String::from("unknown");
    if state.config.enable_auth {
        let Some(auth_val) = state.auth.parse(&header_block) else {
            warn!("auth header missing");
            respond(&mut client, RESP_407).await;
            return;
        };

        let (is_valid, extracted) = state.auth.verify(&auth_val);
        if let Some(extracted) = extracted {
            cid = extracted;
        }
        if !is_valid {
            respond(&mut client, RESP_407).await;
            return;
        }
    }

    // ---------- 4. pick an upstream, with retries ----------
    let mut tried: Vec<Arc<ProxyNode>> = Vec::new();
    let mut last_error: Option<UpstreamError> = None;
    let mut established: Option<(TcpStream, Arc<ProxyNode>, ActiveGuard)> = None;
    let mut pool_exhausted = false;

    for attempt in 0..MAX_RETRIES {
        let active_count = state.active_clients.load(Ordering::Relaxed);
        let Some(node) = state.registry.select(active_count, Some(&cid), &tried) else {
            pool_exhausted = true;
            break;
        };

        let guard = ActiveGuard::acquire(node.clone());
        match try_upstream(
            &node,
            &request.target,
            request.user_agent.as_deref(),
            state.config.connect_timeout,
        )
        .await
        {
            Ok(upstream) => {
                node.record_success();
                established = Some((upstream, node, guard));
                break;
            }
            Err(err) => {
                error!(
                    "upstream connection failed: {} (node={}, attempt {}/{})",
                    err,
                    node.host,
                    attempt + 1,
                    MAX_RETRIES
                );
                drop(guard);
                node.record_failure();
                metrics::counter!("pg_upstream_failures_total", "proxy" => node.host.clone())
                    .increment(1);
                tried.push(node);
                last_error = Some(err);
            }
        }
    }

    let Some((upstream, node, guard)) = established else {
        if pool_exhausted {
            respond(&mut client, RESP_503).await;
        } else if last_error.as_ref().is_some_and(UpstreamError::is_timeout) {
            respond(&mut client, RESP_504).await;
        } else {
            respond(&mut client, RESP_502).await;
        }
        return;
    };

    // ---------- 5. confirm tunnel to client ----------
    respond(&mut client, RESP_200).await;

    // ---------- 6. metrics and sample logging ----------
    metrics::counter!("pg_tunnels", "client" => cid.clone()).increment(1);
    let count = state.log_counter.fetch_add(1, Ordering::Relaxed) + 1;
    if state.config.log_sample_rate > 0 && count % state.config.log_sample_rate == 0 {
        info!(
            client = %cid,
            dst = %request.target,
            proxy = %node.host,
            "tunnel sample"
        );
    }

    // ---------- 7. bidirectional pumping ----------
    relay(client, upstream, node, state.config.buffer_size).await;
    drop(guard);
}

/// Attempt the CONNECT handshake through one upstream proxy.
///
/// Both the dial and every header read run under `connect_timeout`;
/// success is the substring `200` in the first response line — deliberately
/// lenient toward slightly non-standard upstreams.
async fn try_upstream(
    node: &ProxyNode,
    target: &str,
    user_agent: Option<&str>,
    connect_timeout: Duration,
) -> Result<TcpStream, UpstreamError> {
    let mut stream = timeout(
        connect_timeout,
        TcpStream::connect((node.host.as_str(), node.port)),
    )
    .await
    .map_err(|_| UpstreamError::Timeout)??;
    set_fast_socket(&stream);

    let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(ua) = user_agent {
        req.push_str(&format!("User-Agent: {ua}\r\n"));
    }
    req.push_str("Proxy-Connection: Keep-Alive\r\n");
    if let Some(cred) = &node.basic_credential {
        req.push_str(&format!("Proxy-Authorization: Basic {cred}\r\n"));
    }
    req.push_str("\r\n");

    stream.write_all(req.as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    while !contains(&response, b"\r\n\r\n") {
        let n = timeout(connect_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        if n == 0 {
            return Err(UpstreamError::Other("upstream closed connection".into()));
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() > MAX_HEADER_BYTES {
            return Err(UpstreamError::Other(
                "upstream response headers too large".into(),
            ));
        }
    }

    let status = first_line(&response);
    if !contains(status, b"200") {
        return Err(UpstreamError::Other(format!(
            "upstream refused: {}",
            String::from_utf8_lossy(status)
        )));
    }

    Ok(stream)
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Pump both directions until either side finishes, then cancel the other
/// and wait for it before the sockets drop. The first EOF (or error) tears
/// down the whole tunnel; half-close is not propagated.
async fn relay(client: TcpStream, upstream: TcpStream, node: Arc<ProxyNode>, buffer_size: usize) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut up = tokio::spawn(pump(
        client_read,
        upstream_write,
        node.clone(),
        Direction::Up,
        buffer_size,
    ));
    let mut down = tokio::spawn(pump(
        upstream_read,
        client_write,
        node,
        Direction::Down,
        buffer_size,
    ));

    tokio::select! {
        _ = &mut up => {
            down.abort();
            let _ = down.await;
        }
        _ = &mut down => {
            up.abort();
            let _ = up.await;
        }
    }
}

/// One direction of a tunnel: read up to `buffer_size` bytes, account them,
/// write them through, flush. Errors just end the pump — teardown is the
/// caller's job.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    node: Arc<ProxyNode>,
    direction: Direction,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("pipe error: {}", e);
                break;
            }
        };
        match direction {
            Direction::Up => node.add_bytes_sent(n as u64),
            Direction::Down => node.add_bytes_received(n as u64),
        }
        metrics::counter!("pg_bytes_total", "direction" => direction.label())
            .increment(n as u64);
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
