mod accessory;
mod apcaccess;
mod config;
mod decoder;
mod http;
mod metrics;
mod poller;
#[cfg(test)]
mod testlog;
mod tracker;

use std::io;
use std::sync::Arc;

use actix_web::middleware::Compress;
use actix_web::{App, HttpServer, web};
use env_logger::Env;
use log::{debug, info};

use accessory::{BroadcastSink, UpsAccessory};
use apcaccess::StatusClient;
use config::Config;
use http::AppState;
use metrics::Metrics;
use poller::{Poller, SnapshotStore};

/// Pushed updates buffered per event-stream subscriber
const EVENT_CAPACITY: usize = 64;

#[actix_web::main]
async fn main() -> io::Result<()> {
    let config = Config::from_env().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level()))
        .format_timestamp_secs()
        .init();
    debug!("Loaded configuration: {:?}", config);

    let metrics = Arc::new(Metrics::new().map_err(io::Error::other)?);
    let store = Arc::new(SnapshotStore::new());
    let events = BroadcastSink::new(EVENT_CAPACITY);
    let accessory = Arc::new(UpsAccessory::new(
        config.accessory.clone(),
        store.clone(),
        Arc::new(events.clone()),
        config.temperature_sensor,
    ));
    info!(
        "Exposing {:?} as {:?}",
        accessory.info().name,
        accessory.services()
    );

    // Spawn background task to poll apcupsd for the lifetime of the process
    let client = StatusClient::new(config.host.clone(), config.port, config.timeout);
    let poller = Poller::new(client, store, accessory.clone(), metrics.clone());
    tokio::spawn(poller.run(config.interval));
    info!(
        "Polling apcupsd at {}:{} every {:?}",
        config.host, config.port, config.interval
    );

    let state = web::Data::new(AppState {
        accessory,
        metrics,
        events,
    });

    info!("Starting HTTP server on 0.0.0.0:{}", config.http_port);
    HttpServer::new(move || {
        App::new()
            .wrap(Compress::default())
            .app_data(state.clone())
            .configure(http::routes)
    })
    .bind(("0.0.0.0", config.http_port))?
    .run()
    .await
}
