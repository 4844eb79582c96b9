//! Routing client (spec §4.C): invokes the routing service and parses its
//! line-oriented "POST format" reply into a [`RoutingTable`].

use std::net::{SocketAddr, ToSocketAddrs};

use bytes::{Bytes, BytesMut};
use eida_federator_core::{GatewayError, StreamEpoch};
use http::Uri;
use monoio_transports::connectors::{Connector, TcpConnector};
use monoio_transports::http::HttpConnector;
use tracing::{info, warn};

use crate::request_handlers::{QueryParams, RoutingRequestHandler};
use crate::route::{Route, RoutingTable};
use crate::tasks::download::Timeouts;

type RoutingConnector = HttpConnector<TcpConnector, SocketAddr, monoio::net::TcpStream>;

/// Invokes the routing service and returns its parsed routing table.
///
/// The gateway always POSTs (SPEC_FULL §4.C Open Question resolution): a
/// client request always carries at least one stream epoch, and the POST
/// form avoids any practical limit on query-string length.
#[tracing::instrument(skip(params, epochs), fields(epochs = epochs.len()))]
pub async fn route(
    routing_service: &Uri,
    params: QueryParams,
    epochs: Vec<StreamEpoch>,
    timeouts: Timeouts,
) -> Result<RoutingTable, GatewayError> {
    let handler = RoutingRequestHandler::new(routing_service.to_string(), params, epochs);
    let request = handler.post().map_err(GatewayError::UpstreamUnavailable)?;

    let addr = resolve(routing_service).map_err(GatewayError::UpstreamUnavailable)?;
    // The routing service is plain HTTP/1.1, never TLS or HTTP/2.
    let mut connector = RoutingConnector::build_tcp_http1_only();
    connector.set_read_timeout(Some(timeouts.read));
    let mut conn = match monoio::time::timeout(timeouts.connect, connector.connect(addr)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            return Err(GatewayError::UpstreamUnavailable(anyhow::anyhow!("{e:?}")))
        }
        Err(_) => {
            return Err(GatewayError::UpstreamUnavailable(anyhow::anyhow!(
                "connect to routing service timed out after {:?}",
                timeouts.connect
            )))
        }
    };

    let (result, _) = conn.send_request(request).await;
    let response = result.map_err(|e| GatewayError::UpstreamUnavailable(anyhow::anyhow!("{e:?}")))?;

    match response.status().as_u16() {
        204 => {
            info!("routing service returned 204, no data for this selector");
            Err(GatewayError::NoData)
        }
        200 => {
            let body = collect_body(response).await?;
            parse_post_format(&body)
        }
        other => {
            warn!("routing service returned unexpected status {other}");
            Err(GatewayError::UpstreamUnavailable(anyhow::anyhow!(
                "routing service status {other}"
            )))
        }
    }
}

async fn collect_body(
    mut response: http::Response<monoio_http::common::body::HttpBody>,
) -> Result<Bytes, GatewayError> {
    use monoio_http::common::body::Body;

    let mut buf = BytesMut::new();
    while let Some(chunk) = response.body_mut().next_data().await {
        let chunk =
            chunk.map_err(|e| GatewayError::UpstreamUnavailable(anyhow::anyhow!("{e:?}")))?;
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn resolve(uri: &Uri) -> anyhow::Result<SocketAddr> {
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("routing service URL has no host: {uri}"))?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        });
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {host}:{port}"))
}

/// Parses the routing service's "POST format" reply: blocks separated by a
/// blank line, the first non-blank line of each block an endpoint URL,
/// subsequent lines stream-epoch lines. A blank line followed by EOF closes
/// the last block.
pub fn parse_post_format(body: &[u8]) -> Result<RoutingTable, GatewayError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| GatewayError::UpstreamUnavailable(anyhow::anyhow!(e)))?;

    let mut routes = Vec::new();
    let mut current_url: Option<String> = None;
    let mut current_epochs: Vec<StreamEpoch> = Vec::new();

    let flush = |url: &mut Option<String>, epochs: &mut Vec<StreamEpoch>, routes: &mut Vec<Route>| {
        if let Some(url) = url.take() {
            if !epochs.is_empty() {
                routes.push(Route::new(url, std::mem::take(epochs)));
            }
        }
    };

    for line in text.lines() {
        if line.trim().is_empty() {
            flush(&mut current_url, &mut current_epochs, &mut routes);
            continue;
        }
        if current_url.is_none() {
            current_url = Some(line.trim().to_string());
            continue;
        }
        let epoch = StreamEpoch::parse_line(line)?;
        current_epochs.push(epoch);
    }
    flush(&mut current_url, &mut current_epochs, &mut routes);

    Ok(RoutingTable::new(routes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_blocks() {
        let body = b"http://node1.example/fdsnws/dataselect/1/query\n\
                      NL HGN -- BHZ 2020-01-01T00:00:00.000 2020-01-02T00:00:00.000\n\
                      \n\
                      http://node2.example/fdsnws/dataselect/1/query\n\
                      NL HGN -- BHN 2020-01-01T00:00:00.000 2020-01-02T00:00:00.000\n\
                      NL HGN -- BHE 2020-01-01T00:00:00.000 2020-01-02T00:00:00.000\n";
        let table = parse_post_format(body).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.routes[0].epochs.len(), 1);
        assert_eq!(table.routes[1].epochs.len(), 2);
    }

    #[test]
    fn idempotent_for_identical_input() {
        let body = b"http://node1.example/query\nNL HGN -- BHZ 2020-01-01T00:00:00.000\n";
        let a = parse_post_format(body).unwrap();
        let b = parse_post_format(body).unwrap();
        assert_eq!(a.routes[0].url, b.routes[0].url);
        assert_eq!(a.routes[0].epochs, b.routes[0].epochs);
    }

    #[test]
    fn rejects_bad_epoch_line() {
        let body = b"http://node1.example/query\nnot a valid epoch line\n";
        assert!(parse_post_format(body).is_err());
    }
}
