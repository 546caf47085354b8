use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::Cache;
use crate::config::{FeedConfig, MonitoredRoad, RoadsConfig};
use crate::enhancer::{ChainStatus, EnhancedAlert, Enhancer, ReportedRoadStatus};
use crate::error::{ApiError, Result};
use crate::feed::FeedClient;
use crate::geo::{Coordinate, Polyline};
use crate::matcher::{self, AlertType, Classification, ClassifiedAlert, Route, UnclassifiedAlert};
use crate::metrics::ProcessingMetrics;
use crate::traffic::{RoutesClient, TrafficResult};

pub const ROADS_SNAPSHOT_KEY: &str = "roads:all";

const TRAFFIC_CACHE_PREFIX: &str = "traffic:";

/// Traffic results outlive the refresh cadence to hold provider quota.
const TRAFFIC_FRESH_MINUTES: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoadStatus {
    Open,
    Restricted,
    Closed,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Clear,
    Light,
    Moderate,
    Heavy,
    Severe,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainControl {
    None,
    Advised,
    Required,
    Prohibited,
}

/// One alert as exposed on a road, carrying its enhancement when one
/// succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadAlert {
    pub id: String,
    pub title: String,
    pub description: String,
    pub alert_type: AlertType,
    pub classification: Classification,
    pub distance_to_route_m: f64,
    pub location: Coordinate,
    pub enhanced: Option<EnhancedAlert>,
}

impl RoadAlert {
    fn from_classified(classified: &ClassifiedAlert, enhanced: Option<EnhancedAlert>) -> Self {
        RoadAlert {
            id: classified.alert.id.clone(),
            title: classified.alert.title.clone(),
            description: classified.alert.description.clone(),
            alert_type: classified.alert.alert_type,
            classification: classified.classification,
            distance_to_route_m: classified.distance_to_route_m,
            location: classified.alert.location,
            enhanced,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadSnapshot {
    pub id: String,
    pub name: String,
    pub section: String,
    pub status: RoadStatus,
    pub status_explanation: Option<String>,
    pub duration_minutes: i64,
    pub distance_km: f64,
    pub congestion: CongestionLevel,
    pub delay_minutes: i64,
    pub chain_control: ChainControl,
    pub alerts: Vec<RoadAlert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoadsResponse {
    pub roads: Vec<RoadSnapshot>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoadResponse {
    pub road: RoadSnapshot,
    pub last_updated: DateTime<Utc>,
}

/// Orchestrates one refresh cycle per invocation: traffic per road, route
/// construction, a shared incident fetch, global classification,
/// enhancement, and per-road aggregation into the cached snapshot.
pub struct RoadsAggregator {
    cache: Arc<Cache>,
    traffic: RoutesClient,
    feed: FeedClient,
    enhancer: Enhancer,
    metrics: Arc<ProcessingMetrics>,
    config: RoadsConfig,
    incident_radius_m: Option<f64>,
    refresh_gate: Mutex<()>,
}

impl RoadsAggregator {
    pub fn new(
        cache: Arc<Cache>,
        traffic: RoutesClient,
        feed: FeedClient,
        enhancer: Enhancer,
        metrics: Arc<ProcessingMetrics>,
        config: RoadsConfig,
        feeds: &FeedConfig,
    ) -> Self {
        Self {
            cache,
            traffic,
            feed,
            enhancer,
            metrics,
            config,
            incident_radius_m: feeds.incident_radius_m,
            refresh_gate: Mutex::new(()),
        }
    }

    /// Scheduler entry: revalidates the snapshot once it has left its fresh
    /// window, so user reads almost never block on upstream calls.
    pub async fn warm(&self) -> Result<()> {
        if self.cache.is_stale(ROADS_SNAPSHOT_KEY) {
            self.refresh().await
        } else {
            Ok(())
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;
        let started = std::time::Instant::now();
        tracing::info!("roads refresh starting");

        // Traffic per road, failures isolated per road.
        let traffic_results: Vec<Option<TrafficResult>> = join_all(
            self.config
                .monitored_roads
                .iter()
                .map(|road| self.road_traffic(road)),
        )
        .await;

        // Routes rebuilt from this cycle's polylines.
        let routes: Vec<Route> = self
            .config
            .monitored_roads
            .iter()
            .zip(traffic_results.iter())
            .map(|(road, traffic)| self.build_route(road, traffic.as_ref()))
            .collect();

        // One incident fetch shared across all roads.
        let incidents = self.fetch_incidents(&routes).await;
        self.metrics.record_raw_alerts(incidents.len() as u64);

        // Classify every incident against every route; only OnRoute and
        // Nearby results survive, and OnRoute anywhere kills Nearby
        // elsewhere.
        let mut classified = Vec::new();
        for incident in &incidents {
            let alert = match UnclassifiedAlert::from_incident(incident) {
                Some(alert) => alert,
                None => continue,
            };
            for route in &routes {
                match matcher::classify(&alert, std::slice::from_ref(route)) {
                    Ok(c) if c.classification != Classification::Distant => classified.push(c),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("classifying {:?} failed: {e}", alert.id),
                }
            }
        }
        let mut kept = matcher::dedup_on_route(classified);
        matcher::sort_alerts(&mut kept);
        self.metrics.record_filtered_alerts(kept.len() as u64);

        // Enhancement runs concurrently; a failure downgrades that alert to
        // its pre-enhancement values.
        let road_alerts: Vec<RoadAlert> = join_all(kept.iter().map(|c| async move {
            match self.enhancer.enhance(&c.alert).await {
                Ok(enhanced) => {
                    self.metrics.record_enhancement_success();
                    RoadAlert::from_classified(c, Some(enhanced))
                }
                Err(e) => {
                    self.metrics.record_enhancement_failure();
                    tracing::warn!("enhancement of {:?} failed: {e}", c.alert.id);
                    RoadAlert::from_classified(c, None)
                }
            }
        }))
        .await;

        // `kept` is already in display order, so per-road filtering keeps it.
        let snapshots: Vec<RoadSnapshot> = self
            .config
            .monitored_roads
            .iter()
            .zip(traffic_results.iter())
            .map(|(road, traffic)| {
                let alerts: Vec<RoadAlert> = kept
                    .iter()
                    .zip(road_alerts.iter())
                    .filter(|(c, _)| c.route_id == road.id)
                    .map(|(_, alert)| alert.clone())
                    .collect();
                aggregate_road(road, traffic.as_ref(), alerts)
            })
            .collect();

        let fresh_for = Duration::seconds(self.config.refresh_interval_secs as i64);
        let stale_for = self
            .config
            .stale_threshold_secs
            .map(|secs| Duration::seconds(secs as i64))
            .unwrap_or(fresh_for * 2);
        self.cache.set_with_staleness(
            ROADS_SNAPSHOT_KEY,
            &snapshots,
            fresh_for,
            stale_for,
            "roads",
        )?;

        let elapsed = started.elapsed().as_millis() as u64;
        self.metrics.record_cycle_time(elapsed);
        tracing::info!(
            "roads refresh completed: {} roads, {} alerts, {} ms",
            snapshots.len(),
            snapshots.iter().map(|s| s.alerts.len()).sum::<usize>(),
            elapsed
        );
        Ok(())
    }

    /// Serves the cached snapshot at any staleness within the stale bound.
    /// Only a wholly absent entry triggers a synchronous inline refresh.
    pub async fn list_roads(&self) -> Result<RoadsResponse> {
        if let Some((roads, created_at)) = self
            .cache
            .get_with_metadata::<Vec<RoadSnapshot>>(ROADS_SNAPSHOT_KEY)?
        {
            return Ok(RoadsResponse {
                roads,
                last_updated: created_at,
            });
        }

        self.refresh()
            .await
            .map_err(|e| ApiError::Unavailable(format!("no roads snapshot: {e}")))?;

        match self
            .cache
            .get_with_metadata::<Vec<RoadSnapshot>>(ROADS_SNAPSHOT_KEY)?
        {
            Some((roads, created_at)) => Ok(RoadsResponse {
                roads,
                last_updated: created_at,
            }),
            None => Err(ApiError::Unavailable(
                "roads snapshot missing after refresh".to_string(),
            )),
        }
    }

    pub async fn get_road(&self, road_id: &str) -> Result<RoadResponse> {
        let response = self.list_roads().await?;
        let road = response
            .roads
            .into_iter()
            .find(|road| road.id == road_id)
            .ok_or_else(|| ApiError::NotFound(format!("road {road_id}")))?;
        Ok(RoadResponse {
            road,
            last_updated: response.last_updated,
        })
    }

    /// Per-road traffic behind the 20-minute sub-cache. Failures fall back
    /// to a stale cached result when one exists, else to no traffic at all.
    async fn road_traffic(&self, road: &MonitoredRoad) -> Option<TrafficResult> {
        let key = format!("{TRAFFIC_CACHE_PREFIX}{}", road.id);

        if !self.cache.is_stale(&key) {
            if let Ok(Some(cached)) = self.cache.get::<TrafficResult>(&key) {
                return Some(cached);
            }
        }

        match self.traffic.compute_route(road.origin, road.destination).await {
            Ok(result) => {
                if let Err(e) = self.cache.set(
                    &key,
                    &result,
                    Duration::minutes(TRAFFIC_FRESH_MINUTES),
                    "traffic",
                ) {
                    tracing::warn!("caching traffic for {} failed: {e}", road.id);
                }
                Some(result)
            }
            Err(e) => {
                tracing::warn!("traffic for {} failed: {e}", road.id);
                self.cache.get::<TrafficResult>(&key).ok().flatten()
            }
        }
    }

    fn build_route(&self, road: &MonitoredRoad, traffic: Option<&TrafficResult>) -> Route {
        let polyline = traffic
            .filter(|t| !t.encoded_polyline.is_empty())
            .and_then(|t| match Polyline::from_encoded(&t.encoded_polyline) {
                Ok(polyline) => Some(polyline.points),
                Err(e) => {
                    tracing::warn!("decoding polyline for {} failed: {e}", road.id);
                    None
                }
            })
            .unwrap_or_else(|| vec![road.origin, road.destination]);

        Route {
            id: road.id.clone(),
            polyline,
            max_distance_m: self.config.max_distance_m,
        }
    }

    async fn fetch_incidents(&self, routes: &[Route]) -> Vec<crate::feed::RawIncident> {
        let fetched = match self.incident_radius_m {
            Some(radius) => {
                let route_coords: Vec<Coordinate> = routes
                    .iter()
                    .flat_map(|r| r.polyline.iter().copied())
                    .collect();
                self.feed
                    .fetch_with_geographic_filter(&route_coords, radius)
                    .await
            }
            None => self.feed.fetch_incidents().await,
        };

        match fetched {
            Ok(incidents) => incidents,
            Err(e) => {
                tracing::warn!("incident fetch failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Folds a road's alerts into its reported status. Within one cycle the
/// status only moves open → restricted → closed.
fn aggregate_road(
    road: &MonitoredRoad,
    traffic: Option<&TrafficResult>,
    alerts: Vec<RoadAlert>,
) -> RoadSnapshot {
    let mut status = RoadStatus::Open;
    let mut chain_control = ChainControl::None;
    let mut status_explanation: Option<String> = None;

    for alert in alerts
        .iter()
        .filter(|a| a.classification == Classification::OnRoute)
    {
        match &alert.enhanced {
            Some(enhanced) => {
                match enhanced.structured.road_status {
                    ReportedRoadStatus::Closed => {
                        status = RoadStatus::Closed;
                        if status_explanation.is_none() {
                            status_explanation = enhanced
                                .structured
                                .restriction_details
                                .clone()
                                .filter(|d| !d.trim().is_empty());
                        }
                    }
                    ReportedRoadStatus::Restricted if status != RoadStatus::Closed => {
                        status = RoadStatus::Restricted;
                        if status_explanation.is_none() {
                            status_explanation = enhanced
                                .structured
                                .restriction_details
                                .clone()
                                .filter(|d| !d.trim().is_empty());
                        }
                    }
                    _ => {}
                }

                match enhanced.structured.chain_status {
                    ChainStatus::R1 | ChainStatus::R2 => chain_control = ChainControl::Required,
                    ChainStatus::ActiveUnspecified => {
                        if chain_control == ChainControl::None {
                            chain_control = ChainControl::Advised;
                        }
                    }
                    ChainStatus::None => {}
                }
            }
            None => {
                // Without an enhancement, a closure or construction report
                // still restricts an otherwise-open road.
                if matches!(alert.alert_type, AlertType::Closure | AlertType::Construction)
                    && status == RoadStatus::Open
                {
                    status = RoadStatus::Restricted;
                    status_explanation
                        .get_or_insert_with(|| format!("Reported: {}", alert.title));
                }
            }
        }
    }

    // A closure on the road always reads as at least restricted, even when
    // its enhancement judged the road open.
    if status == RoadStatus::Open
        && alerts.iter().any(|a| {
            a.classification == Classification::OnRoute && a.alert_type == AlertType::Closure
        })
    {
        status = RoadStatus::Restricted;
        status_explanation.get_or_insert_with(|| "Lane closure reported".to_string());
    }

    let (duration_minutes, distance_km, delay_minutes, congestion) = match traffic {
        Some(t) => {
            let delay =
                ((t.duration_seconds - t.static_duration_seconds) as f64 / 60.0).max(0.0) as i64;
            (
                t.duration_seconds / 60,
                t.distance_meters / 1_000.0,
                delay,
                congestion_for_delay(delay),
            )
        }
        None => (0, 0.0, 0, CongestionLevel::Unknown),
    };

    RoadSnapshot {
        id: road.id.clone(),
        name: road.name.clone(),
        section: road.section.clone(),
        status,
        status_explanation,
        duration_minutes,
        distance_km,
        congestion,
        delay_minutes,
        chain_control,
        alerts,
    }
}

fn congestion_for_delay(delay_minutes: i64) -> CongestionLevel {
    match delay_minutes {
        0..=1 => CongestionLevel::Clear,
        2..=4 => CongestionLevel::Light,
        5..=9 => CongestionLevel::Moderate,
        10..=19 => CongestionLevel::Heavy,
        _ => CongestionLevel::Severe,
    }
}
