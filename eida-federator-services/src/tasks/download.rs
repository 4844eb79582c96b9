//! Download task (spec §4.E): one outbound POST to a data-centre endpoint,
//! spooling a successful body to a temp file.

use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use eida_federator_core::{GatewayError, StreamEpoch};
use http::Uri;
use monoio_transports::connectors::{Connector, TcpConnector};
use monoio_transports::http::HttpConnector;
use tracing::{debug, warn};

use crate::request_handlers::{GranularFdsnRequestHandler, QueryParams};

type DownloadConnector = HttpConnector<TcpConnector, SocketAddr, monoio::net::TcpStream>;

/// Where a download's payload lives once the task has completed.
#[derive(Debug)]
pub enum Payload {
    /// 204/empty, or a non-200 terminal status: nothing was spooled.
    None,
    /// 200: the full body, spooled to this temp file.
    SpooledFile(PathBuf),
}

/// Result of one download task (spec §4.E).
#[derive(Debug)]
pub struct DownloadResult {
    pub status: u16,
    pub length: u64,
    pub payload: Payload,
}

/// Per-fetch connect/read timeouts (SPEC_FULL §3's `GatewayConfig`),
/// grounded on the teacher's `HttpUpstreamTimeout`.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl DownloadResult {
    fn empty(status: u16) -> Self {
        Self {
            status,
            length: 0,
            payload: Payload::None,
        }
    }
}

/// Executes one POST to `url` for `epoch`, retrying transport-level
/// failures up to `num_retries` times with `retry_wait` between attempts.
/// Any 4xx other than 413 is terminal and not retried.
#[tracing::instrument(skip(params, epoch, tmpdir), fields(stream = %epoch.format_line()))]
pub async fn download(
    url: &str,
    params: QueryParams,
    epoch: StreamEpoch,
    tmpdir: &Path,
    num_retries: usize,
    retry_wait: Duration,
    timeouts: Timeouts,
) -> Result<DownloadResult, GatewayError> {
    let mut attempt = 0;
    loop {
        match try_download(url, &params, epoch.clone(), tmpdir, timeouts).await {
            Ok(result) => return Ok(result),
            Err(TransportFailure::Terminal(status)) => return Ok(DownloadResult::empty(status)),
            Err(TransportFailure::Transport(err)) => {
                attempt += 1;
                if attempt > num_retries {
                    warn!("download from {url} failed after {attempt} attempts: {err}");
                    return Ok(DownloadResult::empty(502));
                }
                debug!("retrying download from {url} (attempt {attempt}): {err}");
                monoio::time::sleep(retry_wait).await;
            }
        }
    }
}

enum TransportFailure {
    /// A 4xx/5xx that must not be retried (413, or any non-200 other status).
    Terminal(u16),
    Transport(anyhow::Error),
}

async fn try_download(
    url: &str,
    params: &QueryParams,
    epoch: StreamEpoch,
    tmpdir: &Path,
    timeouts: Timeouts,
) -> Result<DownloadResult, TransportFailure> {
    let handler = GranularFdsnRequestHandler::new(url, params.clone(), epoch);
    let request = handler
        .post()
        .map_err(TransportFailure::Transport)?;

    let uri: Uri = url.parse().map_err(|e| TransportFailure::Transport(anyhow::anyhow!(e)))?;
    let addr = resolve(&uri).map_err(TransportFailure::Transport)?;

    let mut connector = DownloadConnector::build_tcp_http1_only();
    connector.set_read_timeout(Some(timeouts.read));
    let mut conn = match monoio::time::timeout(timeouts.connect, connector.connect(addr)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return Err(TransportFailure::Transport(anyhow::anyhow!("{e:?}"))),
        Err(_) => return Err(TransportFailure::Transport(anyhow::anyhow!(
            "connect to {url} timed out after {:?}",
            timeouts.connect
        ))),
    };

    let (result, _) = conn.send_request(request).await;
    let response = result.map_err(|e| TransportFailure::Transport(anyhow::anyhow!("{e:?}")))?;

    let status = response.status().as_u16();
    match status {
        200 => {
            let (length, path) = spool(response, tmpdir)
                .await
                .map_err(TransportFailure::Transport)?;
            Ok(DownloadResult {
                status: 200,
                length,
                payload: Payload::SpooledFile(path),
            })
        }
        204 => Ok(DownloadResult::empty(204)),
        other => Err(TransportFailure::Terminal(other)),
    }
}

async fn spool(
    mut response: http::Response<monoio_http::common::body::HttpBody>,
    tmpdir: &Path,
) -> anyhow::Result<(u64, PathBuf)> {
    use monoio_http::common::body::Body;

    let file = tempfile::Builder::new()
        .prefix("eida-federator-")
        .tempfile_in(tmpdir)?;
    let (mut file, path) = file.keep()?;
    let mut total = 0u64;

    while let Some(chunk) = response.body_mut().next_data().await {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        total += chunk.len() as u64;
    }
    file.flush()?;
    Ok((total, path))
}

fn resolve(uri: &Uri) -> anyhow::Result<SocketAddr> {
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("endpoint URL has no host: {uri}"))?;
    let port = uri.port_u16().unwrap_or(80);
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_result_carries_no_payload() {
        let result = DownloadResult::empty(413);
        assert_eq!(result.status, 413);
        assert_eq!(result.length, 0);
        assert!(matches!(result.payload, Payload::None));
    }
}
