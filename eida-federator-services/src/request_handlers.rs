//! Request handlers (spec §4.B): build outbound HTTP requests for the
//! routing service and for data-centre endpoints.

use bytes::Bytes;
use eida_federator_core::StreamEpoch;
use http::{Request, Uri};

const USER_AGENT: &str = concat!("EIDA-Federator/", env!("CARGO_PKG_VERSION"));

/// Query parameters recognised by the routing service (spec §4.B).
const ROUTING_PARAMS: &[&str] = &[
    "service",
    "level",
    "minlatitude",
    "minlat",
    "maxlatitude",
    "maxlat",
    "minlongitude",
    "minlon",
    "maxlongitude",
    "maxlon",
];

/// Query parameters that belong to the routing layer, not the endpoint
/// (spec §4.B: `FdsnRequestHandler` excludes these).
const FDSN_EXCLUDED_PARAMS: &[&str] = &[
    "service",
    "nodata",
    "minlatitude",
    "minlat",
    "maxlatitude",
    "maxlat",
    "minlongitude",
    "minlon",
    "maxlongitude",
    "maxlon",
];

/// Order-preserving `key=value` query parameters, as parsed from the
/// client's request.
#[derive(Debug, Clone, Default)]
pub struct QueryParams(pub Vec<(String, String)>);

impl QueryParams {
    pub fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| keep(k))
                .cloned()
                .collect(),
        )
    }

    /// Drops every existing `key` entry and appends exactly one `key=value`,
    /// so a value the processor needs to pin (e.g. `level`, `format`) can't
    /// end up duplicated alongside whatever the client itself sent.
    pub fn with_override(&self, key: &str, value: impl Into<String>) -> Self {
        let mut params = self.filtered(|k| k != key);
        params.0.push((key.to_string(), value.into()));
        params
    }

    fn post_body_prefix(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn post_body(params: &QueryParams, epochs: &[StreamEpoch]) -> Bytes {
    let lines = epochs
        .iter()
        .map(StreamEpoch::format_line)
        .collect::<Vec<_>>()
        .join("\n");
    Bytes::from(format!("{}\n\n{}", params.post_body_prefix(), lines))
}

fn base_request_builder() -> http::request::Builder {
    Request::post("")
        .header(http::header::USER_AGENT, USER_AGENT)
        .header(http::header::ACCEPT_ENCODING, "")
}

/// Builds the routing-service request (`format=post` is always forced in).
pub struct RoutingRequestHandler {
    url: String,
    params: QueryParams,
    epochs: Vec<StreamEpoch>,
}

impl RoutingRequestHandler {
    pub fn new(url: impl Into<String>, params: QueryParams, epochs: Vec<StreamEpoch>) -> Self {
        let mut filtered = params.filtered(|k| ROUTING_PARAMS.contains(&k));
        filtered.0.push(("format".to_string(), "post".to_string()));
        Self {
            url: url.into(),
            params: filtered,
            epochs,
        }
    }

    pub fn get_uri(&self) -> anyhow::Result<Uri> {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.params.0 {
            serializer.append_pair(k, v);
        }
        for epoch in &self.epochs {
            // GET form of routing requests is exposed for parity with the
            // original implementation; the processor always uses POST
            // (SPEC_FULL §4.C).
            serializer.append_pair("stream", &epoch.format_line());
        }
        Ok(format!("{}?{}", self.url, serializer.finish()).parse()?)
    }

    pub fn post(&self) -> anyhow::Result<Request<Bytes>> {
        let body = post_body(&self.params, &self.epochs);
        Ok(base_request_builder()
            .uri(self.url.parse::<Uri>()?)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(body)?)
    }
}

/// Builds a bulk FDSN endpoint request, excluding routing-only parameters.
pub struct FdsnRequestHandler {
    url: String,
    params: QueryParams,
    epochs: Vec<StreamEpoch>,
}

impl FdsnRequestHandler {
    pub fn new(url: impl Into<String>, params: QueryParams, epochs: Vec<StreamEpoch>) -> Self {
        Self {
            url: url.into(),
            params: params.filtered(|k| !FDSN_EXCLUDED_PARAMS.contains(&k)),
            epochs,
        }
    }

    pub fn post(&self) -> anyhow::Result<Request<Bytes>> {
        let body = post_body(&self.params, &self.epochs);
        Ok(base_request_builder()
            .uri(self.url.parse::<Uri>()?)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(body)?)
    }
}

/// Single-stream variant used by download tasks (spec §4.B).
pub struct GranularFdsnRequestHandler {
    inner: FdsnRequestHandler,
}

impl GranularFdsnRequestHandler {
    pub fn new(url: impl Into<String>, params: QueryParams, epoch: StreamEpoch) -> Self {
        Self {
            inner: FdsnRequestHandler::new(url, params, vec![epoch]),
        }
    }

    pub fn post(&self) -> anyhow::Result<Request<Bytes>> {
        self.inner.post()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eida_federator_core::StreamEpoch;

    fn epoch() -> StreamEpoch {
        StreamEpoch::parse_line("NL HGN -- BHZ 2020-01-01T00:00:00.000").unwrap()
    }

    #[test]
    fn routing_request_forwards_only_recognised_params() {
        let params = QueryParams(vec![
            ("level".into(), "network".into()),
            ("format".into(), "xml".into()),
            ("bogus".into(), "x".into()),
        ]);
        let handler = RoutingRequestHandler::new("http://routing.example/", params, vec![epoch()]);
        let req = handler.post().unwrap();
        let body = String::from_utf8(req.body().to_vec()).unwrap();
        assert!(body.contains("level=network"));
        assert!(body.contains("format=post"));
        assert!(!body.contains("bogus"));
        assert!(!body.contains("format=xml"));
    }

    #[test]
    fn fdsn_request_excludes_routing_only_params() {
        let params = QueryParams(vec![
            ("service".into(), "dataselect".into()),
            ("nodata".into(), "204".into()),
            ("quality".into(), "B".into()),
        ]);
        let handler = FdsnRequestHandler::new("http://node1.example/", params, vec![epoch()]);
        let req = handler.post().unwrap();
        let body = String::from_utf8(req.body().to_vec()).unwrap();
        assert!(body.contains("quality=B"));
        assert!(!body.contains("service="));
        assert!(!body.contains("nodata="));
    }

    #[test]
    fn granular_handler_carries_exactly_one_epoch() {
        let handler =
            GranularFdsnRequestHandler::new("http://node1.example/", QueryParams::default(), epoch());
        let req = handler.post().unwrap();
        let body = String::from_utf8(req.body().to_vec()).unwrap();
        assert_eq!(body.lines().filter(|l| l.contains("NL HGN")).count(), 1);
    }

    #[test]
    fn every_request_sets_user_agent_and_empty_accept_encoding() {
        let handler =
            FdsnRequestHandler::new("http://node1.example/", QueryParams::default(), vec![epoch()]);
        let req = handler.post().unwrap();
        assert!(req
            .headers()
            .get(http::header::USER_AGENT)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("EIDA-Federator/"));
        assert_eq!(
            req.headers().get(http::header::ACCEPT_ENCODING).unwrap(),
            ""
        );
    }
}
