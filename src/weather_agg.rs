use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::Cache;
use crate::config::{MonitoredLocation, WeatherConfig};
use crate::error::{ApiError, Result};
use crate::geo::Coordinate;
use crate::weather::{CurrentWeather, WeatherAlert, WeatherClient};

pub const WEATHER_SNAPSHOT_KEY: &str = "weather:all";
pub const WEATHER_ALERTS_KEY: &str = "weather:alerts";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationWeather {
    pub id: String,
    pub name: String,
    pub coordinates: Coordinate,
    pub current: Option<CurrentWeather>,
}

/// An upstream alert attached to the monitored location that produced it.
/// The id is prefixed with the location id so the same upstream alert seen
/// from two locations never collides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationAlert {
    pub location_id: String,
    pub location_name: String,
    #[serde(flatten)]
    pub alert: WeatherAlert,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeatherResponse {
    pub weather: Vec<LocationWeather>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationWeatherResponse {
    pub weather: LocationWeather,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeatherAlertsResponse {
    pub alerts: Vec<LocationAlert>,
    pub last_updated: DateTime<Utc>,
}

/// Current conditions and alerts for every configured location, cached at
/// the weather refresh cadence.
pub struct WeatherAggregator {
    cache: Arc<Cache>,
    client: WeatherClient,
    config: WeatherConfig,
    refresh_gate: Mutex<()>,
}

impl WeatherAggregator {
    pub fn new(cache: Arc<Cache>, client: WeatherClient, config: WeatherConfig) -> Self {
        Self {
            cache,
            client,
            config,
            refresh_gate: Mutex::new(()),
        }
    }

    pub async fn warm(&self) -> Result<()> {
        if self.cache.is_stale(WEATHER_SNAPSHOT_KEY) {
            self.refresh().await
        } else {
            Ok(())
        }
    }

    /// Locations run concurrently; within a location the current-conditions
    /// and alert calls run back to back. A failing location still appears,
    /// without current conditions.
    pub async fn refresh(&self) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;
        tracing::info!("weather refresh starting");

        let results = join_all(
            self.config
                .locations
                .iter()
                .map(|location| self.fetch_location(location)),
        )
        .await;

        let mut weather = Vec::new();
        let mut alerts = Vec::new();
        for (location_weather, location_alerts) in results {
            weather.push(location_weather);
            alerts.extend(location_alerts);
        }

        let fresh_for = Duration::seconds(self.config.refresh_interval_secs as i64);
        let stale_for = self
            .config
            .stale_threshold_secs
            .map(|secs| Duration::seconds(secs as i64))
            .unwrap_or(fresh_for * 2);

        self.cache
            .set_with_staleness(WEATHER_SNAPSHOT_KEY, &weather, fresh_for, stale_for, "weather")?;
        self.cache.set_with_staleness(
            WEATHER_ALERTS_KEY,
            &alerts,
            fresh_for,
            stale_for,
            "weather",
        )?;

        tracing::info!(
            "weather refresh completed: {} locations, {} alerts",
            weather.len(),
            alerts.len()
        );
        Ok(())
    }

    async fn fetch_location(
        &self,
        location: &MonitoredLocation,
    ) -> (LocationWeather, Vec<LocationAlert>) {
        let current = match self.client.current_weather(location.coordinates).await {
            Ok(current) => Some(current),
            Err(e) => {
                tracing::warn!("current weather for {} failed: {e}", location.id);
                None
            }
        };

        let alerts = match self.client.weather_alerts(location.coordinates).await {
            Ok(alerts) => alerts
                .into_iter()
                .map(|mut alert| {
                    alert.id = format!("{}:{}", location.id, alert.id);
                    LocationAlert {
                        location_id: location.id.clone(),
                        location_name: location.name.clone(),
                        alert,
                    }
                })
                .collect(),
            Err(e) => {
                tracing::warn!("weather alerts for {} failed: {e}", location.id);
                Vec::new()
            }
        };

        (
            LocationWeather {
                id: location.id.clone(),
                name: location.name.clone(),
                coordinates: location.coordinates,
                current,
            },
            alerts,
        )
    }

    pub async fn list_weather(&self) -> Result<WeatherResponse> {
        if let Some((weather, created_at)) = self
            .cache
            .get_with_metadata::<Vec<LocationWeather>>(WEATHER_SNAPSHOT_KEY)?
        {
            return Ok(WeatherResponse {
                weather,
                last_updated: created_at,
            });
        }

        self.refresh()
            .await
            .map_err(|e| ApiError::Unavailable(format!("no weather snapshot: {e}")))?;

        match self
            .cache
            .get_with_metadata::<Vec<LocationWeather>>(WEATHER_SNAPSHOT_KEY)?
        {
            Some((weather, created_at)) => Ok(WeatherResponse {
                weather,
                last_updated: created_at,
            }),
            None => Err(ApiError::Unavailable(
                "weather snapshot missing after refresh".to_string(),
            )),
        }
    }

    pub async fn get_location_weather(&self, location_id: &str) -> Result<LocationWeatherResponse> {
        let response = self.list_weather().await?;
        let weather = response
            .weather
            .into_iter()
            .find(|w| w.id == location_id)
            .ok_or_else(|| ApiError::NotFound(format!("location {location_id}")))?;
        Ok(LocationWeatherResponse {
            weather,
            last_updated: response.last_updated,
        })
    }

    pub async fn list_alerts(&self) -> Result<WeatherAlertsResponse> {
        if let Some((alerts, created_at)) = self
            .cache
            .get_with_metadata::<Vec<LocationAlert>>(WEATHER_ALERTS_KEY)?
        {
            return Ok(WeatherAlertsResponse {
                alerts,
                last_updated: created_at,
            });
        }

        self.refresh()
            .await
            .map_err(|e| ApiError::Unavailable(format!("no weather alerts snapshot: {e}")))?;

        match self
            .cache
            .get_with_metadata::<Vec<LocationAlert>>(WEATHER_ALERTS_KEY)?
        {
            Some((alerts, created_at)) => Ok(WeatherAlertsResponse {
                alerts,
                last_updated: created_at,
            }),
            None => Err(ApiError::Unavailable(
                "weather alerts snapshot missing after refresh".to_string(),
            )),
        }
    }
}
