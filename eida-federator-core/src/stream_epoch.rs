//! Stream-epoch model (spec §4.A): the station/channel selector plus a time
//! window that is the unit of selection for every other component.

use chrono::{NaiveDateTime, Utc};

use crate::error::GatewayError;

const EMPTY_LOCATION: &str = "--";

const TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d",
];

pub type Timestamp = NaiveDateTime;

/// An immutable `(network, station, location, channel, start, end)` tuple.
///
/// `end` may be open (`None`); it is only resolved to a request-scoped "now"
/// when a route is actually built, never inside `parse_line`/`format_line`,
/// so `parse_line(format_line(e)) == e` holds for every `e`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamEpoch {
    network: String,
    station: String,
    location: String,
    channel: String,
    start: Timestamp,
    end: Option<Timestamp>,
}

impl StreamEpoch {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
            start,
            end,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    /// Resolves an open end to `now`, leaving a closed end untouched.
    pub fn end_or_now(&self) -> Timestamp {
        self.end.unwrap_or_else(|| Utc::now().naive_utc())
    }

    /// `NET STA LOC CHA START END`, `LOC` rendered `--` when empty.
    pub fn format_line(&self) -> String {
        let location = if self.location.is_empty() {
            EMPTY_LOCATION
        } else {
            &self.location
        };
        let end = self
            .end
            .map(format_timestamp)
            .unwrap_or_default();
        format!(
            "{} {} {} {} {} {}",
            self.network,
            self.station,
            location,
            self.channel,
            format_timestamp(self.start),
            end,
        )
    }

    pub fn parse_line(line: &str) -> Result<Self, GatewayError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || fields.len() > 6 {
            return Err(GatewayError::BadSelector(format!(
                "expected 5 or 6 whitespace-separated fields, got {}: {line:?}",
                fields.len()
            )));
        }
        let location = if fields[2] == EMPTY_LOCATION {
            String::new()
        } else {
            fields[2].to_string()
        };
        let start = parse_timestamp(fields[4])
            .ok_or_else(|| GatewayError::BadSelector(format!("bad start timestamp: {line:?}")))?;
        let end = match fields.get(5) {
            Some(s) if !s.is_empty() => Some(parse_timestamp(s).ok_or_else(|| {
                GatewayError::BadSelector(format!("bad end timestamp: {line:?}"))
            })?),
            _ => None,
        };
        if let Some(end) = end {
            if end < start {
                return Err(GatewayError::BadSelector(format!(
                    "end before start: {line:?}"
                )));
            }
        }
        Ok(Self {
            network: fields[0].to_string(),
            station: fields[1].to_string(),
            location,
            channel: fields[3].to_string(),
            start,
            end,
        })
    }
}

fn format_timestamp(ts: Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

fn parse_timestamp(s: &str) -> Option<Timestamp> {
    for fmt in TIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    // Date-only formats need an explicit midnight; NaiveDateTime::parse_from_str
    // above already covers that via TIME_FORMATS' "%Y-%m-%d" fallback only if
    // chrono accepts a missing time-of-day, which it does not, so retry via
    // NaiveDate for that one case.
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_hms_opt(0, 0, 0).unwrap())
}

/// Fields that `group_by` (spec §4.D) can key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupField {
    Network,
    Station,
    Location,
    Channel,
}

impl GroupField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "network" => Some(Self::Network),
            "station" => Some(Self::Station),
            "location" => Some(Self::Location),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }

    fn value<'a>(self, e: &'a StreamEpoch) -> &'a str {
        match self {
            GroupField::Network => e.network(),
            GroupField::Station => e.station(),
            GroupField::Location => e.location(),
            GroupField::Channel => e.channel(),
        }
    }
}

/// A dotted combination of [`GroupField`]s, e.g. `network.station`.
#[derive(Debug, Clone)]
pub struct GroupKey(Vec<GroupField>);

impl GroupKey {
    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        let fields: Result<Vec<_>, _> = s
            .split('.')
            .map(|part| {
                GroupField::parse(part)
                    .ok_or_else(|| GatewayError::BadGroupKey(s.to_string()))
            })
            .collect();
        Ok(Self(fields?))
    }

    pub fn network_station() -> Self {
        Self(vec![GroupField::Network, GroupField::Station])
    }

    pub fn network() -> Self {
        Self(vec![GroupField::Network])
    }

    pub fn key_for(&self, e: &StreamEpoch) -> String {
        self.0
            .iter()
            .map(|f| f.value(e))
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_closed_epoch() {
        let line = "NL HGN -- BHZ 2020-01-01T00:00:00.000 2020-01-02T00:00:00.000";
        let epoch = StreamEpoch::parse_line(line).unwrap();
        assert_eq!(epoch.network(), "NL");
        assert_eq!(epoch.station(), "HGN");
        assert_eq!(epoch.location(), "");
        assert_eq!(epoch.channel(), "BHZ");
        assert_eq!(epoch.format_line(), line);
    }

    #[test]
    fn round_trips_open_epoch() {
        let line = "GE WLF 00 BH? 2020-06-15T12:30:00.500 ";
        let epoch = StreamEpoch::parse_line(line.trim_end()).unwrap();
        assert!(epoch.end().is_none());
        assert_eq!(epoch.format_line(), "GE WLF 00 BH? 2020-06-15T12:30:00.500");
    }

    #[test]
    fn rejects_malformed_selector() {
        assert!(StreamEpoch::parse_line("NL HGN BHZ").is_err());
        assert!(StreamEpoch::parse_line("NL HGN -- BHZ not-a-time").is_err());
    }

    #[test]
    fn rejects_end_before_start() {
        let line = "NL HGN -- BHZ 2020-01-02T00:00:00.000 2020-01-01T00:00:00.000";
        assert!(StreamEpoch::parse_line(line).is_err());
    }

    #[test]
    fn group_key_combines_fields() {
        let epoch =
            StreamEpoch::parse_line("NL HGN -- BHZ 2020-01-01T00:00:00.000").unwrap();
        let key = GroupKey::network_station();
        assert_eq!(key.key_for(&epoch), "NL.HGN");
    }

    #[test]
    fn bad_group_key_is_rejected() {
        assert!(GroupKey::parse("planet").is_err());
    }
}
