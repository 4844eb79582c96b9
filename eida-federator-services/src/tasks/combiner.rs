//! Network combiner task (spec §4.F): merges several data centres' answers
//! for the same network into one well-formed `<Network>` subtree.
//!
//! The merge is structural, never semantic: elements are deduplicated by
//! their identifying attributes and spliced together as raw byte spans, not
//! reparsed into a domain model. `quick_xml`'s event reader gives us exactly
//! that — a scan over tag boundaries without building a DOM.

use std::collections::HashMap;
use std::time::Duration;

use eida_federator_core::{GatewayError, GroupKey, Level, StreamEpoch};
use futures::future::join_all;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::request_handlers::QueryParams;
use crate::tasks::download::{self, Payload, Timeouts};

struct ChannelEntry {
    raw: Vec<u8>,
}

struct StationEntry {
    prefix: Vec<u8>,
    channel_order: Vec<(String, String, String)>,
    channels: HashMap<(String, String, String), ChannelEntry>,
    suffix: Vec<u8>,
}

/// Accumulates one network's merged subtree across contributors.
pub struct NetworkAccumulator {
    network_code: String,
    open_tag: Option<Vec<u8>>,
    metadata: Option<Vec<u8>>,
    station_order: Vec<(String, String)>,
    stations: HashMap<(String, String), StationEntry>,
}

impl NetworkAccumulator {
    pub fn new(network_code: impl Into<String>) -> Self {
        Self {
            network_code: network_code.into(),
            open_tag: None,
            metadata: None,
            station_order: Vec::new(),
            stations: HashMap::new(),
        }
    }

    pub fn found_any(&self) -> bool {
        self.open_tag.is_some()
    }

    /// Scans one contributor's document for a `<Network code="...">` element
    /// matching this accumulator's network code and merges it in. Returns
    /// whether the network was found in this document.
    pub fn merge(&mut self, xml: &[u8]) -> anyhow::Result<bool> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();
        let mut found = false;

        loop {
            let pos_before = reader.buffer_position();
            let event = reader.read_event_into(&mut buf)?;
            match event {
                Event::Eof => break,
                Event::Start(ref start) if start.name().as_ref() == b"Network" => {
                    let matches = attr_value(start, "code").as_deref() == Some(self.network_code.as_str());
                    if !matches {
                        skip_subtree(&mut reader, &mut buf)?;
                        buf.clear();
                        continue;
                    }
                    found = true;
                    let open_end = reader.buffer_position();
                    if self.open_tag.is_none() {
                        self.open_tag = Some(xml[pos_before..open_end].to_vec());
                    }
                    self.merge_network_body(&mut reader, &mut buf, xml)?;
                }
                _ => {}
            }
            buf.clear();
        }
        Ok(found)
    }

    fn merge_network_body(
        &mut self,
        reader: &mut Reader<&[u8]>,
        buf: &mut Vec<u8>,
        xml: &[u8],
    ) -> anyhow::Result<()> {
        loop {
            let pos_before = reader.buffer_position();
            let event = reader.read_event_into(buf)?;
            match event {
                Event::End(ref end) if end.name().as_ref() == b"Network" => return Ok(()),
                Event::Eof => anyhow::bail!("unexpected EOF inside <Network>"),
                Event::Start(ref start) if start.name().as_ref() == b"Station" => {
                    let code = attr_value(start, "code").unwrap_or_default();
                    let start_date = attr_value(start, "startDate").unwrap_or_default();
                    let key = (code, start_date);
                    let prefix_end = reader.buffer_position();
                    let prefix = xml[pos_before..prefix_end].to_vec();
                    self.merge_station_body(reader, buf, xml, key, prefix)?;
                }
                Event::Start(_) => {
                    skip_subtree(reader, buf)?;
                    let pos_after = reader.buffer_position();
                    self.push_metadata(&xml[pos_before..pos_after]);
                }
                Event::Empty(_) => {
                    let pos_after = reader.buffer_position();
                    self.push_metadata(&xml[pos_before..pos_after]);
                }
                _ => {}
            }
            buf.clear();
        }
    }

    fn push_metadata(&mut self, raw: &[u8]) {
        if self.metadata.is_none() {
            self.metadata = Some(raw.to_vec());
        }
    }

    fn merge_station_body(
        &mut self,
        reader: &mut Reader<&[u8]>,
        buf: &mut Vec<u8>,
        xml: &[u8],
        key: (String, String),
        prefix: Vec<u8>,
    ) -> anyhow::Result<()> {
        let is_new_station = !self.stations.contains_key(&key);
        if is_new_station {
            self.station_order.push(key.clone());
            self.stations.insert(
                key.clone(),
                StationEntry {
                    prefix,
                    channel_order: Vec::new(),
                    channels: HashMap::new(),
                    suffix: Vec::new(),
                },
            );
        }

        loop {
            let pos_before = reader.buffer_position();
            let event = reader.read_event_into(buf)?;
            match event {
                Event::End(ref end) if end.name().as_ref() == b"Station" => {
                    let pos_after = reader.buffer_position();
                    let station = self.stations.get_mut(&key).expect("station just inserted");
                    if station.suffix.is_empty() {
                        station.suffix = xml[pos_before..pos_after].to_vec();
                    }
                    return Ok(());
                }
                Event::Eof => anyhow::bail!("unexpected EOF inside <Station>"),
                Event::Start(ref start) if start.name().as_ref() == b"Channel" => {
                    let code = attr_value(start, "code").unwrap_or_default();
                    let location = attr_value(start, "locationCode").unwrap_or_default();
                    let start_date = attr_value(start, "startDate").unwrap_or_default();
                    let chan_key = (code, location, start_date);
                    let end_pos = scan_to_matching_end(reader, buf)?;
                    let raw = xml[pos_before..end_pos].to_vec();
                    let station = self.stations.get_mut(&key).expect("station just inserted");
                    if !station.channels.contains_key(&chan_key) {
                        station.channel_order.push(chan_key.clone());
                        station.channels.insert(chan_key, ChannelEntry { raw });
                    }
                }
                Event::Start(_) => {
                    let end_pos = scan_to_matching_end(reader, buf)?;
                    if is_new_station {
                        let raw = xml[pos_before..end_pos].to_vec();
                        let station = self.stations.get_mut(&key).expect("station just inserted");
                        station.prefix.extend_from_slice(&raw);
                    }
                }
                Event::Empty(_) => {
                    let pos_after = reader.buffer_position();
                    if is_new_station {
                        let raw = xml[pos_before..pos_after].to_vec();
                        let station = self.stations.get_mut(&key).expect("station just inserted");
                        station.prefix.extend_from_slice(&raw);
                    }
                }
                _ => {}
            }
            buf.clear();
        }
    }

    /// Serialises the merged `<Network>` subtree. Returns `None` if no
    /// contributor's document contained this network.
    pub fn finish(self) -> Option<Vec<u8>> {
        let open_tag = self.open_tag?;
        let mut out = open_tag;
        if let Some(metadata) = self.metadata {
            out.extend_from_slice(&metadata);
        }
        for key in &self.station_order {
            let station = &self.stations[key];
            out.extend_from_slice(&station.prefix);
            for chan_key in &station.channel_order {
                out.extend_from_slice(&station.channels[chan_key].raw);
            }
            out.extend_from_slice(&station.suffix);
        }
        out.extend_from_slice(b"</Network>");
        Some(out)
    }
}

fn attr_value(start: &BytesStart, name: &str) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Consumes events until the matching end tag of the element whose start
/// tag was just read, returning the buffer position just past it.
fn skip_subtree(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> anyhow::Result<usize> {
    scan_to_matching_end(reader, buf)
}

fn scan_to_matching_end(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> anyhow::Result<usize> {
    let mut depth = 1i32;
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(reader.buffer_position());
                }
            }
            Event::Eof => anyhow::bail!("unexpected EOF while scanning subtree"),
            _ => {}
        }
    }
}

/// Runs the combiner for one network: downloads station-XML from every
/// route sharing `network_code`, merges the `<Network>` subtrees, and
/// returns the merged buffer. Partial success (some children fail) still
/// returns a merged subtree; total failure returns the last non-200 status
/// observed.
#[tracing::instrument(skip(routes, params, tmpdir), fields(contributors = routes.len()))]
pub async fn combine_network(
    network_code: &str,
    routes: &[(String, StreamEpoch)],
    params: QueryParams,
    level: Level,
    tmpdir: &std::path::Path,
    num_retries: usize,
    retry_wait: Duration,
    timeouts: Timeouts,
) -> Result<Vec<u8>, GatewayError> {
    let mut acc = NetworkAccumulator::new(network_code);
    let mut last_status = 502u16;
    let mut any_success = false;

    // Fan out every contributor's fetch and await them together (spec
    // §4.F step 1-2: "spawn a bounded pool of child download tasks ...
    // await all children"), but keep `routes`' order for the results so
    // the merge below still sees contributors in source order — the "first
    // contributor wins" rule depends on it, not on whichever completes
    // first.
    let fetches = routes.iter().map(|(url, epoch)| {
        let level_params = params.with_override("level", level.as_str());
        download::download(
            url,
            level_params,
            epoch.clone(),
            tmpdir,
            num_retries,
            retry_wait,
            timeouts,
        )
    });
    let results = join_all(fetches).await;

    for result in results {
        let result = result?;
        last_status = result.status;
        if result.status != 200 {
            continue;
        }
        let Payload::SpooledFile(path) = result.payload else {
            continue;
        };
        let bytes = std::fs::read(&path).map_err(|e| GatewayError::Streaming(e.to_string()))?;
        let _ = std::fs::remove_file(&path);
        match acc.merge(&bytes) {
            Ok(true) => any_success = true,
            Ok(false) => {}
            Err(e) => return Err(GatewayError::Streaming(e.to_string())),
        }
    }

    if !any_success {
        return Err(GatewayError::UpstreamUnavailable(anyhow::anyhow!(
            "no contributor returned network {network_code} (last status {last_status})"
        )));
    }

    acc.finish()
        .ok_or_else(|| GatewayError::Streaming("network accumulator produced no output".into()))
}

/// Key used to assign demultiplexed routes to their network combiner.
pub fn network_key() -> GroupKey {
    GroupKey::network()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC_A: &[u8] = br#"<FDSNStationXML><Network code="NL"><Description>KNMI</Description><Station code="HGN" startDate="2000-01-01"><Latitude>50.0</Latitude><Channel code="BHZ" locationCode="" startDate="2000-01-01"><SampleRate>40</SampleRate></Channel></Station></Network></FDSNStationXML>"#;
    const DOC_B: &[u8] = br#"<FDSNStationXML><Network code="NL"><Station code="HGN" startDate="2000-01-01"><Latitude>99.0</Latitude><Channel code="BHN" locationCode="" startDate="2000-01-01"><SampleRate>40</SampleRate></Channel></Station><Station code="WIT" startDate="2001-01-01"><Channel code="BHZ" locationCode="" startDate="2001-01-01"><SampleRate>20</SampleRate></Channel></Station></Network></FDSNStationXML>"#;

    #[test]
    fn merges_channels_across_contributors_first_wins_on_duplicate_station() {
        let mut acc = NetworkAccumulator::new("NL");
        assert!(acc.merge(DOC_A).unwrap());
        assert!(acc.merge(DOC_B).unwrap());
        let merged = String::from_utf8(acc.finish().unwrap()).unwrap();

        assert_eq!(merged.matches("<Station ").count(), 2);
        assert_eq!(merged.matches("<Channel ").count(), 3);
        // first contributor's station body (Latitude 50.0) wins, not doc B's 99.0
        assert!(merged.contains("50.0"));
        assert!(!merged.contains("99.0"));
        assert!(merged.contains("KNMI"));
        assert!(merged.ends_with("</Network>"));
    }

    #[test]
    fn missing_network_code_yields_no_match() {
        let mut acc = NetworkAccumulator::new("GE");
        assert!(!acc.merge(DOC_A).unwrap());
        assert!(!acc.found_any());
    }
}
