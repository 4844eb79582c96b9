//! Request classification (SPEC_FULL §3): which processor variant and
//! format a parsed ingress request maps to.

/// The station `level` query parameter; also the `group_by`/reduction key
/// the route transforms (§4.D) apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Network,
    Station,
    Channel,
    Response,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "network" => Some(Self::Network),
            "station" => Some(Self::Station),
            "channel" => Some(Self::Channel),
            "response" => Some(Self::Response),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Network => "network",
            Level::Station => "station",
            Level::Channel => "channel",
            Level::Response => "response",
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Station
    }
}

/// The station `format` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationFormat {
    Xml,
    Text,
}

impl StationFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "xml" => Some(Self::Xml),
            "text" => Some(Self::Text),
            _ => None,
        }
    }
}

impl Default for StationFormat {
    fn default() -> Self {
        StationFormat::Xml
    }
}

/// Which of the three ingress service endpoints a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Dataselect,
    Station {
        level: Level,
        format: StationFormat,
    },
    WfCatalog,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trips_through_as_str() {
        for level in [Level::Network, Level::Station, Level::Channel, Level::Response] {
            assert_eq!(Level::parse(level.as_str()), Some(level));
        }
    }

    #[test]
    fn unknown_level_is_none() {
        assert_eq!(Level::parse("bogus"), None);
    }
}
