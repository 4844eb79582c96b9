//! Ingress HTTP server (SPEC_FULL §4.J): accepts client connections, decodes
//! HTTP via hyper, and dispatches to the three service front-ends.

use std::rc::Rc;

use bytes::Bytes;
use eida_federator_core::{GatewayConfig, GatewayError, Level, ServiceKind, StationFormat};
use eida_federator_services::processor::ProcessorVariant;
use eida_federator_services::request_handlers::QueryParams;
use eida_federator_services::{RequestProcessor, SlotPool};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use rand::RngCore;
use tracing::{error, info, Instrument};

/// `monoio` tasks are `!Send`, so the streamed response body can't use
/// `http-body-util`'s `Send + Sync` `BoxBody`.
pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, std::convert::Infallible>;

fn empty_status(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::new())
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .expect("status-only response is always valid")
}

/// Worker-local shared state: one `GatewayConfig` and one `SlotPool` per
/// monoio worker thread (spec §5: the slot pool is process-wide, which this
/// gateway interprets as per-worker-thread since monoio tasks never
/// migrate).
#[derive(Clone)]
pub struct Ctx {
    pub config: Rc<GatewayConfig>,
    pub slot_pool: SlotPool,
}

/// Generates a short per-request id for the tracing span (spec expansion,
/// §6/L: "each request handling gets a tracing span carrying a generated
/// request id"), the same `rand::thread_rng` idiom the inherited rewrite
/// handler uses for picking an upstream.
fn generate_request_id() -> u64 {
    rand::thread_rng().next_u64()
}

pub async fn handle(
    req: Request<Incoming>,
    ctx: Ctx,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let request_id = generate_request_id();
    let span = tracing::info_span!("request", request_id = %format!("{request_id:016x}"), path = %req.uri().path());
    handle_inner(req, ctx).instrument(span).await
}

async fn handle_inner(
    req: Request<Incoming>,
    ctx: Ctx,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let path = req.uri().path().to_string();
    if !is_known_path(&path) {
        return Ok(empty_status(StatusCode::NOT_FOUND));
    }

    let (parts, body) = req.into_parts();
    let query_string = parts.uri.query().unwrap_or("").to_string();
    let mut params = parse_query_string(&query_string);

    let body_bytes = match parts.method {
        http::Method::POST => match body.collect().await {
            Ok(collected) => Some(collected.to_bytes()),
            Err(e) => {
                error!("failed reading request body: {e}");
                return Ok(empty_status(StatusCode::BAD_REQUEST));
            }
        },
        _ => None,
    };

    let epochs = match &body_bytes {
        Some(bytes) => match parse_post_body(bytes, &mut params) {
            Ok(epochs) => epochs,
            Err(e) => return Ok(error_response(&e)),
        },
        None => match parse_stream_params(&params) {
            Ok(epochs) => epochs,
            Err(e) => return Ok(error_response(&e)),
        },
    };

    let kind = match service_kind(&path, &params) {
        Ok(kind) => kind,
        Err(e) => return Ok(error_response(&e)),
    };
    let variant = processor_variant(kind);

    if epochs.is_empty() {
        return Ok(error_response(&GatewayError::BadSelector(
            "request carries no stream epoch".to_string(),
        )));
    }

    run_processor(variant, params, epochs, ctx).await
}

const DATASELECT_PATH: &str = "/fdsnws/dataselect/1/query";
const STATION_PATH: &str = "/fdsnws/station/1/query";
const WFCATALOG_PATH: &str = "/eidaws/wfcatalog/1/query";

fn is_known_path(path: &str) -> bool {
    matches!(path, DATASELECT_PATH | STATION_PATH | WFCATALOG_PATH)
}

fn service_kind(path: &str, params: &QueryParams) -> Result<ServiceKind, GatewayError> {
    match path {
        DATASELECT_PATH => Ok(ServiceKind::Dataselect),
        WFCATALOG_PATH => Ok(ServiceKind::WfCatalog),
        STATION_PATH => {
            let level = find_param(params, "level")
                .map(|v| {
                    Level::parse(v)
                        .ok_or_else(|| GatewayError::BadSelector(format!("unknown level: {v}")))
                })
                .transpose()?
                .unwrap_or_default();
            let format = find_param(params, "format")
                .map(|v| {
                    StationFormat::parse(v)
                        .ok_or_else(|| GatewayError::BadSelector(format!("unknown format: {v}")))
                })
                .transpose()?
                .unwrap_or_default();
            Ok(ServiceKind::Station { level, format })
        }
        _ => unreachable!("unknown paths are rejected by is_known_path before this is called"),
    }
}

fn processor_variant(kind: ServiceKind) -> ProcessorVariant {
    match kind {
        ServiceKind::Dataselect => ProcessorVariant::Raw,
        ServiceKind::WfCatalog => ProcessorVariant::WfCatalog,
        ServiceKind::Station {
            level,
            format: StationFormat::Xml,
        } => ProcessorVariant::StationXml { level },
        ServiceKind::Station {
            level,
            format: StationFormat::Text,
        } => ProcessorVariant::StationText { level },
    }
}

fn find_param<'a>(params: &'a QueryParams, key: &str) -> Option<&'a str> {
    params.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn parse_query_string(query: &str) -> QueryParams {
    QueryParams(
        url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
    )
}

/// `key=value\n...` lines followed by a blank line then stream-epoch lines,
/// matching the body format B's handlers build for outbound requests.
fn parse_post_body(
    body: &[u8],
    params: &mut QueryParams,
) -> Result<Vec<eida_federator_core::StreamEpoch>, GatewayError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| GatewayError::BadSelector(format!("request body is not UTF-8: {e}")))?;

    let mut in_epochs = false;
    let mut epochs = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            in_epochs = true;
            continue;
        }
        if !in_epochs {
            if let Some((k, v)) = line.split_once('=') {
                params.0.push((k.to_string(), v.to_string()));
            }
        } else {
            epochs.push(eida_federator_core::StreamEpoch::parse_line(line)?);
        }
    }
    Ok(epochs)
}

/// A bare GET request carries its stream epoch as `stream=NET STA LOC CHA START END`
/// query parameters (mirroring `RoutingRequestHandler::get_uri`'s `stream` key).
fn parse_stream_params(
    params: &QueryParams,
) -> Result<Vec<eida_federator_core::StreamEpoch>, GatewayError> {
    params
        .0
        .iter()
        .filter(|(k, _)| k == "stream")
        .map(|(_, v)| eida_federator_core::StreamEpoch::parse_line(v))
        .collect()
}

fn error_response(err: &GatewayError) -> Response<BoxBody> {
    info!("request rejected: {err}");
    empty_status(err.status())
}

async fn run_processor(
    variant: ProcessorVariant,
    params: QueryParams,
    epochs: Vec<eida_federator_core::StreamEpoch>,
    ctx: Ctx,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let (gate_tx, gate_rx) = local_sync::oneshot::channel();
    let (body_tx, body_rx) = local_sync::mpsc::unbounded::channel();

    let processor = RequestProcessor::new(variant, ctx.config.clone(), ctx.slot_pool.clone());
    // `monoio::spawn` starts a detached task that does not inherit the
    // current span automatically; carry it across explicitly so download/
    // combiner task logs still show the originating request id.
    let processor_span = tracing::Span::current();
    monoio::spawn(
        async move {
            processor.run(params, epochs, gate_tx, body_tx).await;
        }
        .instrument(processor_span),
    );

    match gate_rx.await {
        Ok(Ok(())) => {
            let stream = local_sync_stream(body_rx);
            let body = StreamBody::new(stream).boxed_unsync();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, variant.mime_type())
                .body(body)
                .expect("streaming response is always valid"))
        }
        Ok(Err(e)) => Ok(error_response(&e)),
        Err(_) => Ok(empty_status(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

fn local_sync_stream(
    rx: local_sync::mpsc::unbounded::Rx<Bytes>,
) -> impl futures::Stream<Item = Result<Frame<Bytes>, std::convert::Infallible>> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok(Frame::data(bytes)), rx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_string_decodes_pairs() {
        let params = parse_query_string("service=dataselect&level=network");
        assert_eq!(find_param(&params, "service"), Some("dataselect"));
        assert_eq!(find_param(&params, "level"), Some("network"));
    }

    #[test]
    fn station_kind_defaults_to_xml_station_level() {
        let params = QueryParams(vec![]);
        let kind = service_kind(STATION_PATH, &params).unwrap();
        assert!(matches!(
            kind,
            ServiceKind::Station { level: Level::Station, format: StationFormat::Xml }
        ));
    }

    #[test]
    fn station_kind_rejects_unknown_format() {
        let params = QueryParams(vec![("format".to_string(), "csv".to_string())]);
        assert!(service_kind(STATION_PATH, &params).is_err());
    }

    #[test]
    fn dataselect_path_maps_to_raw_variant() {
        let kind = service_kind(DATASELECT_PATH, &QueryParams(vec![])).unwrap();
        assert!(matches!(processor_variant(kind), ProcessorVariant::Raw));
    }

    #[test]
    fn parse_post_body_splits_params_from_epochs() {
        let body = b"service=dataselect\nquality=B\n\nNL HGN -- BHZ 2020-01-01T00:00:00.000\n";
        let mut params = QueryParams(vec![]);
        let epochs = parse_post_body(body, &mut params).unwrap();
        assert_eq!(epochs.len(), 1);
        assert_eq!(find_param(&params, "quality"), Some("B"));
    }
}
