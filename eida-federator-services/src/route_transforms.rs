//! Route transforms (spec §4.D): demultiplexing, grouping, and the `level`
//! reduction applied before a request is handed to the worker pool.

use std::collections::HashMap;

use eida_federator_core::{GatewayError, GroupKey};

use crate::route::{Route, RoutingTable};

/// Expands each multi-epoch route into one route per epoch, preserving the
/// order of both the routes and, within a route, its epochs.
pub fn demux(table: RoutingTable) -> Vec<Route> {
    let mut demuxed = Vec::new();
    for route in table {
        for epoch in route.epochs {
            demuxed.push(Route::new(route.url.clone(), vec![epoch]));
        }
    }
    demuxed
}

/// Groups demultiplexed routes by `key`, preserving the source order of
/// routes within each bucket. The returned map iterates in first-seen key
/// order since `network_station`/`network` insertion order is observed for
/// the keys vector alongside the map.
pub struct Grouped {
    pub order: Vec<String>,
    pub buckets: HashMap<String, Vec<Route>>,
}

impl Grouped {
    pub fn into_ordered(self) -> Vec<(String, Vec<Route>)> {
        let Grouped { order, mut buckets } = self;
        order
            .into_iter()
            .map(|key| {
                let routes = buckets.remove(&key).unwrap_or_default();
                (key, routes)
            })
            .collect()
    }
}

/// Groups already-demultiplexed routes by the given key spec.
///
/// Assumes each route carries exactly one epoch, since `group_by` is always
/// applied after [`demux`] (spec §4.D).
pub fn group_by(routes: &[Route], key: &GroupKey) -> Result<Grouped, GatewayError> {
    let mut order = Vec::new();
    let mut buckets: HashMap<String, Vec<Route>> = HashMap::new();

    for route in routes {
        let epoch = route
            .epochs
            .first()
            .ok_or_else(|| GatewayError::BadSelector("route carries no epoch".into()))?;
        let bucket_key = key.key_for(epoch);
        if !buckets.contains_key(&bucket_key) {
            order.push(bucket_key.clone());
        }
        buckets.entry(bucket_key).or_default().push(route.clone());
    }

    Ok(Grouped { order, buckets })
}

/// The station `level` reduction (spec §4.D): `network` keeps only the
/// first route per network; `station` keeps only the first route per
/// `network.station` then regroups by network; any other level groups by
/// network with no per-group reduction. "First" means first occurrence in
/// the source routing-table order.
pub fn reduce_for_level(routes: &[Route], level: &str) -> Result<Vec<(String, Vec<Route>)>, GatewayError> {
    match level {
        "network" => {
            let key = GroupKey::parse("network")?;
            let grouped = group_by(routes, &key)?;
            Ok(grouped
                .into_ordered()
                .into_iter()
                .filter_map(|(net, mut group)| {
                    group.truncate(1);
                    if group.is_empty() {
                        None
                    } else {
                        Some((net, group))
                    }
                })
                .collect())
        }
        "station" => {
            let station_key = GroupKey::parse("network.station")?;
            let by_station = group_by(routes, &station_key)?;
            let first_per_station: Vec<Route> = by_station
                .into_ordered()
                .into_iter()
                .filter_map(|(_, mut group)| {
                    group.truncate(1);
                    group.pop()
                })
                .collect();
            let network_key = GroupKey::parse("network")?;
            let grouped = group_by(&first_per_station, &network_key)?;
            Ok(grouped.into_ordered())
        }
        _ => {
            let key = GroupKey::parse("network")?;
            let grouped = group_by(routes, &key)?;
            Ok(grouped.into_ordered())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eida_federator_core::StreamEpoch;

    fn route(url: &str, sel: &str) -> Route {
        Route::new(url, vec![StreamEpoch::parse_line(sel).unwrap()])
    }

    fn multi_route(url: &str, sels: &[&str]) -> Route {
        Route::new(
            url,
            sels.iter()
                .map(|s| StreamEpoch::parse_line(s).unwrap())
                .collect(),
        )
    }

    #[test]
    fn demux_expands_multi_epoch_routes_preserving_order() {
        let table = RoutingTable::new(vec![multi_route(
            "http://node1",
            &[
                "NL HGN -- BHZ 2020-01-01T00:00:00.000",
                "NL HGN -- BHN 2020-01-01T00:00:00.000",
            ],
        )]);
        let demuxed = demux(table);
        assert_eq!(demuxed.len(), 2);
        assert!(demuxed.iter().all(|r| r.is_demultiplexed()));
        assert_eq!(demuxed[0].epochs[0].channel(), "BHZ");
        assert_eq!(demuxed[1].epochs[0].channel(), "BHN");
    }

    #[test]
    fn group_by_network_station_preserves_order() {
        let routes = vec![
            route("http://a", "NL HGN -- BHZ 2020-01-01T00:00:00.000"),
            route("http://b", "GE WLF -- BHZ 2020-01-01T00:00:00.000"),
            route("http://c", "NL HGN -- BHN 2020-01-01T00:00:00.000"),
        ];
        let key = GroupKey::parse("network.station").unwrap();
        let grouped = group_by(&routes, &key).unwrap().into_ordered();
        assert_eq!(grouped[0].0, "NL.HGN");
        assert_eq!(grouped[0].1.len(), 2);
        assert_eq!(grouped[1].0, "GE.WLF");
    }

    #[test]
    fn unknown_group_key_is_rejected() {
        assert!(GroupKey::parse("bogus").is_err());
    }

    #[test]
    fn level_network_keeps_first_route_per_network() {
        let routes = vec![
            route("http://a", "NL HGN -- BHZ 2020-01-01T00:00:00.000"),
            route("http://b", "NL WIT -- BHZ 2020-01-01T00:00:00.000"),
            route("http://c", "GE WLF -- BHZ 2020-01-01T00:00:00.000"),
        ];
        let reduced = reduce_for_level(&routes, "network").unwrap();
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced[0].1.len(), 1);
        assert_eq!(reduced[0].1[0].url, "http://a");
    }

    #[test]
    fn level_station_keeps_first_route_per_station_then_regroups_by_network() {
        let routes = vec![
            route("http://a", "NL HGN -- BHZ 2020-01-01T00:00:00.000"),
            route("http://b", "NL HGN -- BHN 2020-01-01T00:00:00.000"),
            route("http://c", "NL WIT -- BHZ 2020-01-01T00:00:00.000"),
        ];
        let reduced = reduce_for_level(&routes, "station").unwrap();
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].0, "NL");
        assert_eq!(reduced[0].1.len(), 2);
        assert_eq!(reduced[0].1[0].url, "http://a");
    }
}
