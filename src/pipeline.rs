use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use crate::network::connections::{ConnectionRecord, ConnectionSource};
use crate::network::geo::{Coordinates, GeoClient, GeoRecord};
use crate::network::process::{ProcessInfo, ProcessResolver};
use crate::utils::{current_timestamp, generate_run_id, haversine_distance};
use crate::{NetGeoError, Result};

/// A connection joined with its process and geolocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub connection: ConnectionRecord,
    pub process: ProcessInfo,
    pub geo: GeoRecord,
}

impl EnrichedRow {
    /// Row for a connection whose enrichment could not run at all.
    pub fn unenriched(connection: ConnectionRecord) -> Self {
        let process = ProcessInfo {
            pid: connection.pid,
            name: None,
        };
        Self {
            connection,
            process,
            geo: GeoRecord::default(),
        }
    }

    pub fn process_name(&self) -> &str {
        self.process.display_name()
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        self.geo.coordinates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// All rows, stably sorted by process name.
    Table,
    /// All rows in input order; the map itself draws only rows with
    /// coordinates (see `ConnectionReport::map_rows`).
    Map,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub run_id: String,
    pub generated_at: u64,
    pub rows: Vec<EnrichedRow>,
}

impl ConnectionReport {
    /// Rows that can be placed on the map, in report order.
    pub fn map_rows(&self) -> Vec<EnrichedRow> {
        with_coordinates(self.rows.clone())
    }
}

/// Receives `(done, total)` after each connection is enriched.
pub trait ProgressObserver {
    fn advance(&self, done: usize, total: usize);
}

impl<F: Fn(usize, usize)> ProgressObserver for F {
    fn advance(&self, done: usize, total: usize) {
        self(done, total)
    }
}

pub struct EnrichmentPipeline {
    source: Arc<dyn ConnectionSource>,
    resolver: Arc<dyn ProcessResolver>,
    geo: Arc<GeoClient>,
    concurrency: usize,
}

impl EnrichmentPipeline {
    pub fn new(
        source: Arc<dyn ConnectionSource>,
        resolver: Arc<dyn ProcessResolver>,
        geo: Arc<GeoClient>,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            resolver,
            geo,
            concurrency: concurrency.max(1),
        }
    }

    /// Reads the connection table and builds the report for `mode`. Only a
    /// failure to read the table is returned as an error.
    pub async fn run(
        &self,
        mode: ReportMode,
        progress: Option<&dyn ProgressObserver>,
    ) -> Result<ConnectionReport> {
        let source = Arc::clone(&self.source);
        let connections = tokio::task::spawn_blocking(move || source.list_connections())
            .await
            .map_err(|e| NetGeoError::ConnectionTable(format!("connection table reader failed: {}", e)))??;
        log::info!("Processing {} connections", connections.len());

        let rows = self.build_report(connections, progress).await;
        let rows = match mode {
            ReportMode::Table => sort_by_process(rows),
            ReportMode::Map => rows,
        };

        let stats = self.geo.stats();
        log::info!(
            "Geolocation: {} lookups, {} provider calls, {} cache hits, {} failures",
            stats.lookups,
            stats.provider_calls,
            stats.cache_hits(),
            stats.failures
        );

        Ok(ConnectionReport {
            run_id: generate_run_id(),
            generated_at: current_timestamp(),
            rows,
        })
    }

    /// One row per connection, in input order. Lookups run concurrently up
    /// to the configured limit.
    pub async fn build_report(
        &self,
        connections: Vec<ConnectionRecord>,
        progress: Option<&dyn ProgressObserver>,
    ) -> Vec<EnrichedRow> {
        let total = connections.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(total);

        for connection in connections {
            let resolver = Arc::clone(&self.resolver);
            let geo = Arc::clone(&self.geo);
            let permits = Arc::clone(&permits);
            let fallback = connection.clone();

            let task = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                enrich(connection, resolver, &geo).await
            });

            tasks.push((task, fallback));
        }

        let mut rows = Vec::with_capacity(total);
        for (done, (task, fallback)) in tasks.into_iter().enumerate() {
            let row = match task.await {
                Ok(row) => row,
                Err(e) => {
                    log::error!("Enrichment task failed: {}", e);
                    EnrichedRow::unenriched(fallback)
                }
            };
            rows.push(row);

            if let Some(observer) = progress {
                observer.advance(done + 1, total);
            }
        }

        rows
    }
}

async fn enrich(
    connection: ConnectionRecord,
    resolver: Arc<dyn ProcessResolver>,
    geo: &GeoClient,
) -> EnrichedRow {
    let pid = connection.pid;
    // procfs reads stay off the runtime workers
    let process = tokio::task::spawn_blocking(move || resolver.process_info(pid));
    let geo = geo.lookup(connection.remote_ip()).await;
    let process = process.await.unwrap_or_else(|e| {
        log::debug!("Process resolution for {:?} failed: {}", pid, e);
        ProcessInfo { pid, name: None }
    });

    EnrichedRow {
        connection,
        process,
        geo,
    }
}

/// Stable sort by displayed process name, ascending.
pub fn sort_by_process(mut rows: Vec<EnrichedRow>) -> Vec<EnrichedRow> {
    rows.sort_by(|a, b| a.process_name().cmp(b.process_name()));
    rows
}

pub fn with_coordinates(rows: Vec<EnrichedRow>) -> Vec<EnrichedRow> {
    rows.into_iter()
        .filter(|row| row.coordinates().is_some())
        .collect()
}

/// One distinct foreign location on the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapPoint {
    pub coordinates: Coordinates,
    pub label: String,
    pub distance_km: f64,
    pub connections: usize,
}

/// Groups rows by coordinates, keeping first-seen order.
pub fn map_points(rows: &[EnrichedRow], home: Coordinates) -> Vec<MapPoint> {
    let mut points: Vec<MapPoint> = Vec::new();
    let mut index: HashMap<(u64, u64), usize> = HashMap::new();

    for row in rows {
        let coords = match row.coordinates() {
            Some(coords) => coords,
            None => continue,
        };

        let key = (coords.latitude.to_bits(), coords.longitude.to_bits());
        if let Some(&i) = index.get(&key) {
            points[i].connections += 1;
            continue;
        }

        index.insert(key, points.len());
        points.push(MapPoint {
            coordinates: coords,
            label: row.geo.location_summary(),
            distance_km: haversine_distance(
                home.latitude,
                home.longitude,
                coords.latitude,
                coords.longitude,
            ),
            connections: 1,
        });
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;
    use serde_json::json;
    use crate::network::connections::{ConnectionStatus, Protocol};
    use crate::network::geo::tests::{norwell, FakeProvider};
    use crate::network::geo::GeoCache;

    struct FakeSource {
        connections: Option<Vec<ConnectionRecord>>,
    }

    impl ConnectionSource for FakeSource {
        fn list_connections(&self) -> Result<Vec<ConnectionRecord>> {
            self.connections
                .clone()
                .ok_or_else(|| NetGeoError::ConnectionTable("permission denied".to_string()))
        }
    }

    struct FakeResolver {
        names: HashMap<u32, &'static str>,
    }

    impl ProcessResolver for FakeResolver {
        fn resolve(&self, pid: Option<u32>) -> Option<String> {
            pid.and_then(|pid| self.names.get(&pid)).map(|name| name.to_string())
        }
    }

    fn connection(local: &str, remote: Option<&str>, pid: Option<u32>) -> ConnectionRecord {
        ConnectionRecord {
            protocol: Protocol::Tcp,
            local: local.parse::<SocketAddr>().unwrap(),
            remote: remote.map(|r| r.parse::<SocketAddr>().unwrap()),
            status: if remote.is_some() {
                ConnectionStatus::Established
            } else {
                ConnectionStatus::Listen
            },
            pid,
        }
    }

    fn pipeline(
        connections: Option<Vec<ConnectionRecord>>,
        provider: Arc<FakeProvider>,
        concurrency: usize,
    ) -> EnrichmentPipeline {
        let resolver = FakeResolver {
            names: [(100, "curl"), (200, "firefox"), (300, "sshd")].into_iter().collect(),
        };
        let geo = GeoClient::new(provider, GeoCache::default(), Duration::from_secs(5));
        EnrichmentPipeline::new(
            Arc::new(FakeSource { connections }),
            Arc::new(resolver),
            Arc::new(geo),
            concurrency,
        )
    }

    fn provider() -> Arc<FakeProvider> {
        Arc::new(FakeProvider::new(vec![
            ("93.184.216.34", norwell()),
            ("1.1.1.1", json!({"city": "Sydney", "country": "AU", "loc": "-33.8688,151.2093"})),
            ("8.8.8.8", json!({"city": "Mountain View", "loc": "not-a-number"})),
        ]))
    }

    #[tokio::test]
    async fn test_single_connection_scenario() {
        let connections = vec![connection("10.0.0.5:5000", Some("93.184.216.34:443"), Some(100))];
        let pipeline = pipeline(None, provider(), 4);

        let rows = pipeline.build_report(connections, None).await;
        let row = &rows[0];

        assert_eq!(rows.len(), 1);
        assert_eq!(row.connection.protocol.to_string(), "TCP");
        assert_eq!(row.connection.local_display(), "10.0.0.5:5000");
        assert_eq!(row.connection.remote_display(), "93.184.216.34:443");
        assert_eq!(row.connection.status.as_str(), "ESTABLISHED");
        assert_eq!(row.process.pid, Some(100));
        assert_eq!(row.process_name(), "curl");
        assert_eq!(row.geo.city, "Norwell");
        assert_eq!(row.geo.region, "Massachusetts");
        assert_eq!(row.geo.country, "US");
        assert_eq!(row.coordinates(), Coordinates::new(42.1596, -70.8217));
    }

    #[tokio::test]
    async fn test_cardinality_and_order_preserved() {
        let connections = vec![
            connection("10.0.0.5:5000", Some("93.184.216.34:443"), Some(100)),
            connection("0.0.0.0:22", None, Some(300)),
            connection("10.0.0.5:5001", Some("203.0.113.7:443"), None),
            connection("10.0.0.5:5002", Some("1.1.1.1:53"), Some(999)),
            connection("10.0.0.5:5003", Some("93.184.216.34:80"), Some(200)),
        ];
        let provider = provider();
        let pipeline = pipeline(None, provider.clone(), 3);

        let rows = pipeline.build_report(connections.clone(), None).await;

        assert_eq!(rows.len(), connections.len());
        for (row, input) in rows.iter().zip(&connections) {
            assert_eq!(&row.connection, input);
        }
        // Unknown pid and failed lookup degrade instead of dropping the row
        assert_eq!(rows[3].process_name(), "N/A");
        assert!(rows[2].geo.is_empty());
        // Three distinct remote IPs, the shared one fetched once
        assert_eq!(provider.calls(), 3);
        assert_eq!(rows[0].geo, rows[4].geo);
    }

    #[tokio::test]
    async fn test_listening_socket_gets_empty_geo() {
        let provider = provider();
        let pipeline = pipeline(None, provider.clone(), 1);

        let rows = pipeline
            .build_report(vec![connection("0.0.0.0:22", None, Some(300))], None)
            .await;

        assert_eq!(rows[0].connection.remote_display(), "N/A");
        assert!(rows[0].geo.is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_loc_row() {
        let pipeline = pipeline(None, provider(), 2);

        let rows = pipeline
            .build_report(vec![connection("10.0.0.5:5000", Some("8.8.8.8:53"), Some(100))], None)
            .await;

        assert_eq!(rows[0].coordinates(), None);
        assert_eq!(rows[0].geo.city, "Mountain View");
    }

    #[tokio::test]
    async fn test_progress_reported_per_connection() {
        let connections = vec![
            connection("10.0.0.5:5000", Some("93.184.216.34:443"), Some(100)),
            connection("0.0.0.0:22", None, Some(300)),
            connection("10.0.0.5:5002", Some("1.1.1.1:53"), Some(200)),
        ];
        let pipeline = pipeline(None, provider(), 2);
        let seen = Mutex::new(Vec::new());
        let observer = |done: usize, total: usize| seen.lock().unwrap().push((done, total));

        pipeline.build_report(connections, Some(&observer)).await;

        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_table_mode_sorts_stably() {
        let connections = vec![
            connection("10.0.0.5:1", Some("93.184.216.34:443"), Some(200)),
            connection("10.0.0.5:2", Some("1.1.1.1:443"), Some(100)),
            connection("10.0.0.5:3", None, None),
            connection("10.0.0.5:4", Some("8.8.8.8:443"), Some(200)),
            connection("10.0.0.5:5", None, Some(100)),
        ];
        let pipeline = pipeline(Some(connections), provider(), 4);

        let report = pipeline.run(ReportMode::Table, None).await.unwrap();
        let order: Vec<(String, u16)> = report
            .rows
            .iter()
            .map(|r| (r.process_name().to_string(), r.connection.local.port()))
            .collect();

        assert_eq!(
            order,
            vec![
                ("N/A".to_string(), 3),
                ("curl".to_string(), 2),
                ("curl".to_string(), 5),
                ("firefox".to_string(), 1),
                ("firefox".to_string(), 4),
            ]
        );
    }

    #[tokio::test]
    async fn test_map_mode_keeps_input_order() {
        let connections = vec![
            connection("10.0.0.5:1", Some("93.184.216.34:443"), Some(200)),
            connection("10.0.0.5:2", None, Some(100)),
            connection("10.0.0.5:3", Some("8.8.8.8:443"), Some(100)),
            connection("10.0.0.5:4", Some("1.1.1.1:443"), Some(300)),
        ];
        let pipeline = pipeline(Some(connections), provider(), 4);

        let report = pipeline.run(ReportMode::Map, None).await.unwrap();
        let all: Vec<u16> = report.rows.iter().map(|r| r.connection.local.port()).collect();
        let mapped: Vec<u16> = report.map_rows().iter().map(|r| r.connection.local.port()).collect();

        assert_eq!(all, vec![1, 2, 3, 4]);
        assert_eq!(mapped, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_unreadable_table_is_fatal() {
        let pipeline = pipeline(None, provider(), 1);

        match pipeline.run(ReportMode::Table, None).await {
            Err(NetGeoError::ConnectionTable(_)) => {}
            other => panic!("expected fatal error, got {:?}", other.map(|r| r.rows.len())),
        }
    }

    struct PanickingResolver;

    impl ProcessResolver for PanickingResolver {
        fn resolve(&self, _pid: Option<u32>) -> Option<String> {
            panic!("process table unavailable");
        }
    }

    #[tokio::test]
    async fn test_resolver_panic_degrades_to_unavailable() {
        let provider = provider();
        let geo = GeoClient::new(provider.clone(), GeoCache::default(), Duration::from_secs(5));
        let pipeline = EnrichmentPipeline::new(
            Arc::new(FakeSource { connections: None }),
            Arc::new(PanickingResolver),
            Arc::new(geo),
            2,
        );

        let rows = pipeline
            .build_report(vec![connection("10.0.0.5:5000", Some("93.184.216.34:443"), Some(100))], None)
            .await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].process.pid, Some(100));
        assert_eq!(rows[0].process_name(), "N/A");
        assert_eq!(rows[0].geo.city, "Norwell");
    }

    #[tokio::test]
    async fn test_dual_stack_rows_share_lookup() {
        let provider = provider();
        let pipeline = pipeline(None, provider.clone(), 4);

        let rows = pipeline
            .build_report(
                vec![
                    connection("10.0.0.5:5000", Some("93.184.216.34:443"), Some(100)),
                    connection("[::]:5001", Some("[::ffff:93.184.216.34]:443"), Some(200)),
                ],
                None,
            )
            .await;

        assert_eq!(provider.calls(), 1);
        assert_eq!(rows[0].geo, rows[1].geo);
        assert_eq!(rows[1].geo.city, "Norwell");
    }

    #[tokio::test]
    async fn test_map_points_dedupe_locations() {
        let connections = vec![
            connection("10.0.0.5:1", Some("93.184.216.34:443"), Some(200)),
            connection("10.0.0.5:2", Some("93.184.216.34:80"), Some(100)),
            connection("10.0.0.5:3", Some("1.1.1.1:443"), Some(300)),
            connection("10.0.0.5:4", None, Some(300)),
        ];
        let pipeline = pipeline(None, provider(), 4);
        let rows = pipeline.build_report(connections, None).await;

        let home = Coordinates::new(42.0, -71.0).unwrap();
        let points = map_points(&rows, home);

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label, "Norwell, Massachusetts, US");
        assert_eq!(points[0].connections, 2);
        assert!(points[0].distance_km < 50.0);
        assert_eq!(points[1].label, "Sydney, AU");
        assert_eq!(points[1].connections, 1);
    }
}
