use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use road_api::handlers::{self, AppState};
use road_api::scheduler::{spawn_refresher, DEFAULT_TICK_TIMEOUT};
use road_api::{
    AppConfig, Cache, Enhancer, FeedClient, ProcessingMetrics, RoadsAggregator, RoutesClient,
    WeatherAggregator, WeatherClient,
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    let host = config.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let port = config.port.unwrap_or(8080);

    let cache = Arc::new(Cache::new());
    let metrics = Arc::new(ProcessingMetrics::new());

    let roads = Arc::new(RoadsAggregator::new(
        cache.clone(),
        RoutesClient::new(config.google_routes_api_key.clone()),
        FeedClient::new(&config.feeds),
        Enhancer::new(&config.openai, cache.clone()),
        metrics.clone(),
        config.roads.clone(),
        &config.feeds,
    ));
    let weather = Arc::new(WeatherAggregator::new(
        cache.clone(),
        WeatherClient::new(config.openweather_api_key.clone()),
        config.weather.clone(),
    ));

    info!(
        "monitoring {} road segments and {} weather locations",
        config.roads.monitored_roads.len(),
        config.weather.locations.len()
    );

    // One warming worker per aggregator family.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let roads_worker = {
        let roads = roads.clone();
        spawn_refresher(
            "roads",
            Duration::from_secs(config.roads.refresh_interval_secs),
            DEFAULT_TICK_TIMEOUT,
            shutdown_rx.clone(),
            move || {
                let roads = roads.clone();
                async move { roads.warm().await }
            },
        )
    };
    let weather_worker = {
        let weather = weather.clone();
        spawn_refresher(
            "weather",
            Duration::from_secs(config.weather.refresh_interval_secs),
            DEFAULT_TICK_TIMEOUT,
            shutdown_rx,
            move || {
                let weather = weather.clone();
                async move { weather.warm().await }
            },
        )
    };

    let app_state = AppState {
        roads,
        weather,
        metrics,
    };

    info!("road conditions API listening on {host}:{port}");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Cors::permissive())
            .wrap(Logger::default())
            .route("/", web::get().to(handlers::health_check))
            .route("/health", web::get().to(handlers::health_check))
            .service(
                web::scope("/api")
                    .route("/roads", web::get().to(handlers::list_roads))
                    .route("/roads/{road_id}", web::get().to(handlers::get_road))
                    .route("/weather", web::get().to(handlers::list_weather))
                    .route("/weather/alerts", web::get().to(handlers::list_weather_alerts))
                    .route(
                        "/weather/{location_id}",
                        web::get().to(handlers::get_location_weather),
                    )
                    .route("/metrics", web::get().to(handlers::get_metrics)),
            )
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    // The server has stopped; wind down the warming workers.
    let _ = shutdown_tx.send(true);
    let _ = roads_worker.await;
    let _ = weather_worker.await;

    Ok(())
}
