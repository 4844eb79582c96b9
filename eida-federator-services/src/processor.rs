//! Request processor (spec §4.H): the template that drives routing, task
//! fan-out, the concurrency limiter, and the streamed, format-aware merge
//! of partial results back to the client.
//!
//! Task fan-out is driven the same way the inherited HTTP/2 server loop
//! drives its request/response futures: push owned futures into a
//! [`FuturesUnordered`] and scan it from a `monoio::select!` loop, draining
//! whichever completes first.

use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use eida_federator_core::{GatewayConfig, GatewayError, Level, StreamEpoch};
use futures::stream::FuturesUnordered;
use futures::{Future, StreamExt};
use local_sync::mpsc::unbounded::Tx;
use local_sync::oneshot;
use tracing::{info, warn};

use crate::request_handlers::QueryParams;
use crate::route::Route;
use crate::route_transforms::{demux, reduce_for_level};
use crate::routing_client;
use crate::slot_pool::SlotPool;
use crate::tasks::download;

const HEADER_NETWORK: &str = "#Network|Description|StartTime|EndTime|TotalStations";
const HEADER_STATION: &str =
    "#Network|Station|Latitude|Longitude|Elevation|SiteName|StartTime|EndTime";
const HEADER_CHANNEL: &str = "#Network|Station|Location|Channel|Latitude|Longitude|Elevation|\
Depth|Azimuth|Dip|SensorDescription|Scale|ScaleFreq|ScaleUnits|SampleRate|StartTime|EndTime";

/// Which processor variant handles a parsed ingress request (spec §4.H).
#[derive(Debug, Clone, Copy)]
pub enum ProcessorVariant {
    Raw,
    StationXml { level: Level },
    StationText { level: Level },
    WfCatalog,
}

impl ProcessorVariant {
    fn pool_size(self, config: &GatewayConfig) -> usize {
        match self {
            ProcessorVariant::Raw => config.threads_dataselect,
            ProcessorVariant::StationXml { .. } => config.pool_size,
            ProcessorVariant::StationText { .. } => config.threads_station_text,
            ProcessorVariant::WfCatalog => config.threads_wfcatalog,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ProcessorVariant::Raw => "application/vnd.fdsn.mseed",
            ProcessorVariant::StationXml { .. } => "application/xml",
            ProcessorVariant::StationText { .. } => "text/plain",
            ProcessorVariant::WfCatalog => "application/json",
        }
    }

    fn header(self) -> Option<Vec<u8>> {
        match self {
            ProcessorVariant::Raw => None,
            ProcessorVariant::StationXml { .. } => {
                let created = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
                Some(format!(
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<FDSNStationXML xmlns=\"http://www.fdsn.org/xml/station/1\" schemaVersion=\"1.0\">\
<Source>EIDA</Source><Created>{created}</Created>"
                )
                .into_bytes())
            }
            ProcessorVariant::StationText { level } => {
                let header = match level {
                    Level::Network => HEADER_NETWORK,
                    Level::Station => HEADER_STATION,
                    _ => HEADER_CHANNEL,
                };
                Some(format!("{header}\n").into_bytes())
            }
            ProcessorVariant::WfCatalog => Some(b"[".to_vec()),
        }
    }

    fn footer(self) -> Option<Vec<u8>> {
        match self {
            ProcessorVariant::Raw => None,
            ProcessorVariant::StationXml { .. } => Some(b"</FDSNStationXML>".to_vec()),
            ProcessorVariant::StationText { .. } => None,
            ProcessorVariant::WfCatalog => Some(b"]".to_vec()),
        }
    }

    fn is_wfcatalog(self) -> bool {
        matches!(self, ProcessorVariant::WfCatalog)
    }
}

/// One outstanding job's outcome, normalised across download/combiner tasks.
struct JobResult {
    status: u16,
    payload: Payload,
}

enum Payload {
    None,
    File(PathBuf),
    Bytes(Vec<u8>),
}

type Job = Pin<Box<dyn Future<Output = JobResult>>>;

/// The per-request orchestrator. Holds only owned/Rc data so it can be
/// driven inside a `monoio::spawn`ed future (spec §4.H's "lifetime equals
/// the handling of one client request").
pub struct RequestProcessor {
    variant: ProcessorVariant,
    config: Rc<GatewayConfig>,
    slot_pool: SlotPool,
}

impl RequestProcessor {
    pub fn new(variant: ProcessorVariant, config: Rc<GatewayConfig>, slot_pool: SlotPool) -> Self {
        Self {
            variant,
            config,
            slot_pool,
        }
    }

    /// Runs the full pipeline. `gate` resolves once with either `Ok(())`
    /// (at least one 200 was observed; the caller may start a 200 response
    /// and read from `tx`) or `Err(GatewayError)` (no data was ever
    /// produced; the caller should respond with the mapped status and never
    /// touch `tx`). `tx` is only ever written to after the gate resolves
    /// `Ok`, and is dropped (closing the stream) once the footer has been
    /// sent or the connection should be truncated.
    pub async fn run(
        self,
        params: QueryParams,
        epochs: Vec<StreamEpoch>,
        gate: oneshot::Sender<Result<(), GatewayError>>,
        tx: Tx<Bytes>,
    ) {
        let timeouts = download::Timeouts {
            connect: self.config.connect_timeout,
            read: self.config.read_timeout,
        };
        let table = match routing_client::route(
            &self.config.routing_service,
            params.clone(),
            epochs,
            timeouts,
        )
        .await
        {
            Ok(table) => table,
            Err(e) => {
                let _ = gate.send(Err(e));
                return;
            }
        };

        let jobs = self.build_jobs(&params, table);
        if jobs.is_empty() {
            let _ = gate.send(Err(GatewayError::NoData));
            return;
        }

        let mut pending: FuturesUnordered<Job> = jobs.into_iter().collect();
        let mut gate = Some(gate);
        let mut last_status = 204u16;
        let mut emitted_body = false;
        let deadline = Instant::now() + self.config.streaming_timeout;

        loop {
            if gate.is_some() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                monoio::select! {
                    item = pending.next() => {
                        match item {
                            Some(result) => {
                                last_status = result.status;
                                self.handle_result(result, &mut gate, &mut emitted_body, &tx).await;
                            }
                            None => break,
                        }
                    }
                    _ = monoio::time::sleep(remaining) => {
                        info!("streaming timeout elapsed before any task completed");
                        break;
                    }
                }
            } else {
                match pending.next().await {
                    Some(result) => {
                        self.handle_result(result, &mut gate, &mut emitted_body, &tx).await;
                    }
                    None => break,
                }
            }
        }

        if let Some(gate) = gate.take() {
            warn!("no task ever returned 200 (last status {last_status})");
            let _ = gate.send(Err(GatewayError::NoData));
            return;
        }

        if let Some(footer) = self.variant.footer() {
            let _ = tx.send(Bytes::from(footer));
        }
    }

    async fn handle_result(
        &self,
        result: JobResult,
        gate: &mut Option<oneshot::Sender<Result<(), GatewayError>>>,
        emitted_body: &mut bool,
        tx: &Tx<Bytes>,
    ) {
        if result.status != 200 {
            if result.status == 413 {
                warn!("413 from upstream, dropping sub-request (splitting not implemented)");
            } else {
                warn!("sub-request failed with status {}", result.status);
            }
            return;
        }

        if let Some(sender) = gate.take() {
            let _ = sender.send(Ok(()));
            if let Some(header) = self.variant.header() {
                let _ = tx.send(Bytes::from(header));
            }
        }

        // Completion order is unspecified (spec §4.H): a non-200 task can
        // drain after the last successful one, so the wfcatalog separator
        // must be emitted before each body except the first, never based on
        // whether further tasks are still pending.
        if self.variant.is_wfcatalog() && *emitted_body {
            let _ = tx.send(Bytes::from_static(b","));
        }

        self.stream_payload(result.payload, tx).await;
        *emitted_body = true;
    }

    async fn stream_payload(&self, payload: Payload, tx: &Tx<Bytes>) {
        let strip_brackets = self.variant.is_wfcatalog();
        match payload {
            Payload::None => {}
            Payload::Bytes(bytes) => {
                let bytes = if strip_brackets {
                    strip_outer_brackets(&bytes)
                } else {
                    bytes
                };
                for chunk in bytes.chunks(self.config.chunk_size) {
                    let _ = tx.send(Bytes::copy_from_slice(chunk));
                }
            }
            Payload::File(path) => {
                if let Err(e) =
                    stream_file(&path, self.config.chunk_size, strip_brackets, tx).await
                {
                    warn!("failed streaming spooled file {path:?}: {e}");
                }
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    fn build_jobs(&self, params: &QueryParams, table: crate::route::RoutingTable) -> Vec<Job> {
        match self.variant {
            ProcessorVariant::Raw | ProcessorVariant::WfCatalog => {
                let routes = demux(table);
                routes
                    .into_iter()
                    .map(|route| self.download_job(params.clone(), route))
                    .collect()
            }
            ProcessorVariant::StationText { level } => {
                let routes = demux(table);
                let reduced = reduce_for_level(&routes, level.as_str()).unwrap_or_default();
                reduced
                    .into_iter()
                    .flat_map(|(_, group)| group)
                    .map(|route| {
                        let params = params
                            .with_override("level", level.as_str())
                            .with_override("format", "text");
                        self.download_job(params, route)
                    })
                    .collect()
            }
            ProcessorVariant::StationXml { level } => {
                let routes = demux(table);
                let reduced = reduce_for_level(&routes, level.as_str()).unwrap_or_default();
                reduced
                    .into_iter()
                    .map(|(network_code, group)| {
                        self.combiner_job(params.clone(), level, network_code, group)
                    })
                    .collect()
            }
        }
    }

    fn download_job(&self, params: QueryParams, route: Route) -> Job {
        let slot_pool = self.slot_pool.clone();
        let config = self.config.clone();
        let url = route.url.clone();
        let epoch = route
            .epochs
            .into_iter()
            .next()
            .expect("routes passed to download_job are demultiplexed");

        Box::pin(async move {
            let guard = match slot_pool.acquire(&url, config.streaming_timeout).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("slot acquisition failed for {url}: {e}");
                    return JobResult {
                        status: 503,
                        payload: Payload::None,
                    };
                }
            };
            let result = download::download(
                &url,
                params,
                epoch,
                &config.tmpdir,
                config.num_retries,
                config.retry_wait,
                download::Timeouts {
                    connect: config.connect_timeout,
                    read: config.read_timeout,
                },
            )
            .await;
            drop(guard);

            match result {
                Ok(r) => JobResult {
                    status: r.status,
                    payload: match r.payload {
                        download::Payload::None => Payload::None,
                        download::Payload::SpooledFile(path) => Payload::File(path),
                    },
                },
                Err(e) => {
                    warn!("download from {url} failed: {e}");
                    JobResult {
                        status: 502,
                        payload: Payload::None,
                    }
                }
            }
        })
    }

    fn combiner_job(
        &self,
        params: QueryParams,
        level: Level,
        network_code: String,
        routes: Vec<Route>,
    ) -> Job {
        let config = self.config.clone();
        let per_stream: Vec<(String, StreamEpoch)> = routes
            .into_iter()
            .map(|r| {
                let epoch = r
                    .epochs
                    .into_iter()
                    .next()
                    .expect("routes passed to combiner_job are demultiplexed");
                (r.url, epoch)
            })
            .collect();

        Box::pin(async move {
            let result = crate::tasks::combiner::combine_network(
                &network_code,
                &per_stream,
                params,
                level,
                &config.tmpdir,
                config.num_retries,
                config.retry_wait,
                crate::tasks::download::Timeouts {
                    connect: config.connect_timeout,
                    read: config.read_timeout,
                },
            )
            .await;

            match result {
                Ok(bytes) => JobResult {
                    status: 200,
                    payload: Payload::Bytes(bytes),
                },
                Err(e) => {
                    warn!("network combiner for {network_code} failed: {e}");
                    JobResult {
                        status: 502,
                        payload: Payload::None,
                    }
                }
            }
        })
    }
}

async fn stream_file(
    path: &std::path::Path,
    chunk_size: usize,
    strip_brackets: bool,
    tx: &Tx<Bytes>,
) -> std::io::Result<()> {
    use std::io::Read;

    let len = std::fs::metadata(path)?.len();
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; chunk_size];
    let mut offset = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut chunk = &buf[..n];
        if strip_brackets {
            if offset == 0 && !chunk.is_empty() {
                chunk = &chunk[1..];
            }
            let end_in_file = offset + chunk.len() as u64 + if offset == 0 { 1 } else { 0 };
            if end_in_file >= len && !chunk.is_empty() {
                chunk = &chunk[..chunk.len() - 1];
            }
        }
        offset += n as u64;
        if !chunk.is_empty() {
            let _ = tx.send(Bytes::copy_from_slice(chunk));
        }
    }
    Ok(())
}

fn strip_outer_brackets(bytes: &[u8]) -> Vec<u8> {
    let trimmed = bytes
        .strip_prefix(b"[")
        .unwrap_or(bytes);
    trimmed.strip_suffix(b"]").unwrap_or(trimmed).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wfcatalog_strips_outer_brackets() {
        assert_eq!(strip_outer_brackets(b"[1,2,3]"), b"1,2,3");
        assert_eq!(strip_outer_brackets(b"[]"), b"");
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            debug: false,
            routing_service: "http://routing.example/".parse().unwrap(),
            tmpdir: std::env::temp_dir(),
            streaming_timeout: Duration::from_secs(1),
            pool_size: 1,
            threads_dataselect: 1,
            threads_station_text: 1,
            threads_wfcatalog: 1,
            slot_capacities: Default::default(),
            default_slot_capacity: 1,
            slot_poll_interval: Duration::from_millis(1),
            num_retries: 0,
            retry_wait: Duration::from_millis(1),
            chunk_size: 64 * 1024,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        }
    }

    /// A non-200 task draining between two successful ones must not leave a
    /// dangling separator: the wfcatalog comma is keyed on "a body has
    /// already been emitted", not on whether tasks remain outstanding
    /// (spec scenario 4, `[` + body1 + `,` + body3 + `]`).
    #[monoio::test]
    async fn wfcatalog_separator_skips_failed_tasks_between_successes() {
        let config = Rc::new(test_config());
        let slot_pool = SlotPool::new(config.default_slot_capacity, config.slot_poll_interval);
        let processor = RequestProcessor::new(ProcessorVariant::WfCatalog, config, slot_pool);

        let mut gate: Option<oneshot::Sender<Result<(), GatewayError>>> = None;
        let mut emitted_body = false;
        let (tx, mut rx) = local_sync::mpsc::unbounded::channel();

        processor
            .handle_result(
                JobResult { status: 200, payload: Payload::Bytes(b"[1]".to_vec()) },
                &mut gate,
                &mut emitted_body,
                &tx,
            )
            .await;
        processor
            .handle_result(
                JobResult { status: 500, payload: Payload::None },
                &mut gate,
                &mut emitted_body,
                &tx,
            )
            .await;
        processor
            .handle_result(
                JobResult { status: 200, payload: Payload::Bytes(b"[3]".to_vec()) },
                &mut gate,
                &mut emitted_body,
                &tx,
            )
            .await;
        drop(tx);

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"1,3");
    }

    #[test]
    fn station_text_header_selects_by_level() {
        let header = ProcessorVariant::StationText { level: Level::Network }
            .header()
            .unwrap();
        assert_eq!(String::from_utf8(header).unwrap(), format!("{HEADER_NETWORK}\n"));
    }

    #[test]
    fn raw_variant_has_no_header_or_footer() {
        assert!(ProcessorVariant::Raw.header().is_none());
        assert!(ProcessorVariant::Raw.footer().is_none());
    }

    #[test]
    fn wfcatalog_envelope_is_bracket_pair() {
        assert_eq!(ProcessorVariant::WfCatalog.header().unwrap(), b"[");
        assert_eq!(ProcessorVariant::WfCatalog.footer().unwrap(), b"]");
    }
}
