use std::env;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

const DEFAULT_CONFIG_PATH: &str = "./config.json";

const DEFAULT_LANE_CLOSURE_URL: &str = "https://quickmap.dot.ca.gov/data/lcs2way.kml";
const DEFAULT_CHP_INCIDENT_URL: &str = "https://quickmap.dot.ca.gov/data/chp-only.kml";
const DEFAULT_CHAIN_CONTROL_URL: &str = "https://quickmap.dot.ca.gov/data/cc.kml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredRoad {
    pub id: String,
    pub name: String,
    pub section: String,
    pub origin: Coordinate,
    pub destination: Coordinate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredLocation {
    pub id: String,
    pub name: String,
    pub coordinates: Coordinate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoadsConfig {
    pub refresh_interval_secs: u64,
    pub stale_threshold_secs: Option<u64>,
    pub max_distance_m: f64,
    pub monitored_roads: Vec<MonitoredRoad>,
}

impl Default for RoadsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            stale_threshold_secs: None,
            max_distance_m: 5_000.0,
            monitored_roads: default_monitored_roads(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub refresh_interval_secs: u64,
    pub stale_threshold_secs: Option<u64>,
    pub locations: Vec<MonitoredLocation>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 600,
            stale_threshold_secs: None,
            locations: default_locations(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub lane_closure_url: String,
    pub chp_incident_url: String,
    pub chain_control_url: String,
    pub enable_chain_control: bool,
    /// When set, incidents farther than this from every route coordinate
    /// are discarded before classification.
    pub incident_radius_m: Option<f64>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            lane_closure_url: DEFAULT_LANE_CLOSURE_URL.to_string(),
            chp_incident_url: DEFAULT_CHP_INCIDENT_URL.to_string(),
            chain_control_url: DEFAULT_CHAIN_CONTROL_URL.to_string(),
            enable_chain_control: false,
            incident_radius_m: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub roads: RoadsConfig,
    pub weather: WeatherConfig,
    pub feeds: FeedConfig,
    pub google_routes_api_key: String,
    pub openweather_api_key: String,
    pub openai: OpenAiConfig,
}

impl AppConfig {
    /// Loads the optional JSON config file, then applies environment
    /// overrides, then validates. Missing required credentials are fatal.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("HOST") {
            self.host = Some(v);
        }
        if let Ok(v) = env::var("PORT") {
            self.port = v.parse().ok();
        }
        if let Ok(v) = env::var("GOOGLE_ROUTES_API_KEY") {
            self.google_routes_api_key = v;
        }
        if let Ok(v) = env::var("OPENWEATHER_API_KEY") {
            self.openweather_api_key = v;
        }
        if let Ok(v) = env::var("OPENAI_API_KEY") {
            self.openai.api_key = v;
        }
        if let Ok(v) = env::var("OPENAI_MODEL") {
            self.openai.model = v;
        }
        if let Ok(v) = env::var("OPENAI_TIMEOUT_SECS") {
            if let Ok(parsed) = v.parse() {
                self.openai.timeout_secs = parsed;
            }
        }
        if let Ok(v) = env::var("OPENAI_MAX_RETRIES") {
            if let Ok(parsed) = v.parse() {
                self.openai.max_retries = parsed;
            }
        }
        if let Ok(v) = env::var("ROADS_REFRESH_INTERVAL_SECS") {
            if let Ok(parsed) = v.parse() {
                self.roads.refresh_interval_secs = parsed;
            }
        }
        if let Ok(v) = env::var("WEATHER_REFRESH_INTERVAL_SECS") {
            if let Ok(parsed) = v.parse() {
                self.weather.refresh_interval_secs = parsed;
            }
        }
        if let Ok(v) = env::var("FEED_ENABLE_CHAIN_CONTROL") {
            self.feeds.enable_chain_control = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.google_routes_api_key.trim().is_empty() {
            anyhow::bail!("GOOGLE_ROUTES_API_KEY is required");
        }
        if self.openweather_api_key.trim().is_empty() {
            anyhow::bail!("OPENWEATHER_API_KEY is required");
        }
        if self.openai.api_key.trim().is_empty() {
            anyhow::bail!("OPENAI_API_KEY is required");
        }
        if self.roads.monitored_roads.is_empty() {
            anyhow::bail!("at least one monitored road must be configured");
        }
        if self.roads.refresh_interval_secs == 0 || self.weather.refresh_interval_secs == 0 {
            anyhow::bail!("refresh intervals must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for road in &self.roads.monitored_roads {
            if !seen.insert(&road.id) {
                anyhow::bail!("duplicate monitored road id {:?}", road.id);
            }
            road.origin
                .validate()
                .with_context(|| format!("road {} origin", road.id))?;
            road.destination
                .validate()
                .with_context(|| format!("road {} destination", road.id))?;
        }
        for location in &self.weather.locations {
            location
                .coordinates
                .validate()
                .with_context(|| format!("location {}", location.id))?;
        }
        Ok(())
    }
}

/// The Highway 4 corridor over Ebbetts Pass, segmented at the towns where
/// conditions typically change.
fn default_monitored_roads() -> Vec<MonitoredRoad> {
    vec![
        MonitoredRoad {
            id: "hwy4-angels-camp-murphys".to_string(),
            name: "Highway 4".to_string(),
            section: "Angels Camp to Murphys".to_string(),
            origin: Coordinate { lat: 38.0675, lon: -120.5436 },
            destination: Coordinate { lat: 38.1391, lon: -120.4561 },
        },
        MonitoredRoad {
            id: "hwy4-murphys-arnold".to_string(),
            name: "Highway 4".to_string(),
            section: "Murphys to Arnold".to_string(),
            origin: Coordinate { lat: 38.1391, lon: -120.4561 },
            destination: Coordinate { lat: 38.2552, lon: -120.3513 },
        },
        MonitoredRoad {
            id: "hwy4-arnold-bear-valley".to_string(),
            name: "Highway 4".to_string(),
            section: "Arnold to Bear Valley".to_string(),
            origin: Coordinate { lat: 38.2552, lon: -120.3513 },
            destination: Coordinate { lat: 38.4633, lon: -120.0433 },
        },
    ]
}

fn default_locations() -> Vec<MonitoredLocation> {
    vec![
        MonitoredLocation {
            id: "angels-camp".to_string(),
            name: "Angels Camp".to_string(),
            coordinates: Coordinate { lat: 38.0675, lon: -120.5436 },
        },
        MonitoredLocation {
            id: "murphys".to_string(),
            name: "Murphys".to_string(),
            coordinates: Coordinate { lat: 38.1391, lon: -120.4561 },
        },
        MonitoredLocation {
            id: "arnold".to_string(),
            name: "Arnold".to_string(),
            coordinates: Coordinate { lat: 38.2552, lon: -120.3513 },
        },
        MonitoredLocation {
            id: "bear-valley".to_string(),
            name: "Bear Valley".to_string(),
            coordinates: Coordinate { lat: 38.4633, lon: -120.0433 },
        },
    ]
}
