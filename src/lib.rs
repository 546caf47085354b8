pub mod cache;
pub mod config;
pub mod enhancer;
pub mod error;
pub mod feed;
pub mod geo;
pub mod handlers;
pub mod matcher;
pub mod metrics;
pub mod roads;
pub mod scheduler;
pub mod traffic;
pub mod weather;
pub mod weather_agg;

pub use cache::{Cache, CacheEntry};
pub use config::{AppConfig, MonitoredLocation, MonitoredRoad};
pub use enhancer::{ChainStatus, EnhancedAlert, Enhancer, Impact, ReportedRoadStatus, StructuredAlert};
pub use error::{ApiError, Result};
pub use feed::{FeedClient, FeedKind, FeedParser, RawIncident};
pub use geo::{Coordinate, Polyline};
pub use handlers::AppState;
pub use matcher::{AlertType, Classification, ClassifiedAlert, Route, UnclassifiedAlert};
pub use metrics::{MetricsSnapshot, ProcessingMetrics};
pub use roads::{ChainControl, CongestionLevel, RoadSnapshot, RoadStatus, RoadsAggregator};
pub use scheduler::spawn_refresher;
pub use traffic::{RoutesClient, SpeedCategory, SpeedReadingInterval, TrafficResult};
pub use weather::{CurrentWeather, WeatherAlert, WeatherClient};
pub use weather_agg::{LocationAlert, LocationWeather, WeatherAggregator};
