//! HTTP surface: Prometheus metrics, accessory reads and the push stream.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use actix_web::http::header::{CACHE_CONTROL, ContentEncoding};
use actix_web::{HttpResponse, web};
use futures_util::stream;
use log::{error, warn};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::accessory::{AccessoryInfo, BroadcastSink, Characteristic, ServiceKind, UpsAccessory};
use crate::metrics::Metrics;

pub struct AppState {
    pub accessory: Arc<UpsAccessory>,
    pub metrics: Arc<Metrics>,
    pub events: BroadcastSink,
}

#[derive(Serialize)]
struct AccessoryView<'a> {
    info: &'a AccessoryInfo,
    services: Vec<ServiceKind>,
    ready: bool,
    values: BTreeMap<&'static str, Option<i32>>,
    status: BTreeMap<&'a str, &'a str>,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/metrics").route(web::get().to(metrics_handler)))
        .service(web::resource("/accessory").route(web::get().to(accessory_handler)))
        .service(
            web::resource("/characteristics/{name}").route(web::get().to(characteristic_handler)),
        )
        .service(web::resource("/events").route(web::get().to(events_handler)));
}

pub async fn metrics_handler(state: web::Data<AppState>) -> HttpResponse {
    match state.metrics.encode() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub async fn accessory_handler(state: web::Data<AppState>) -> HttpResponse {
    let accessory = &state.accessory;
    let latest = accessory.latest();
    let values = accessory
        .characteristics()
        .into_iter()
        .map(|c| (c.name(), accessory.read(c).ok().map(|v| v.hap_value())))
        .collect();

    HttpResponse::Ok().json(AccessoryView {
        info: accessory.info(),
        services: accessory.services(),
        ready: latest.ready,
        values,
        status: latest.raw.iter().collect(),
    })
}

pub async fn characteristic_handler(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> HttpResponse {
    let name = name.into_inner();
    let Some(characteristic) = Characteristic::from_name(&name)
        .filter(|c| state.accessory.characteristics().contains(c))
    else {
        return HttpResponse::NotFound().json(json!({
            "characteristic": name,
            "error": "unknown characteristic",
        }));
    };

    match state.accessory.read(characteristic) {
        Ok(value) => HttpResponse::Ok().json(json!({
            "characteristic": characteristic,
            "value": value.hap_value(),
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(json!({
            "characteristic": characteristic,
            "error": e.to_string(),
        })),
    }
}

/// Server-sent events, one `data:` line of JSON per pushed update.
pub async fn events_handler(state: web::Data<AppState>) -> HttpResponse {
    let rx = state.events.subscribe();
    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(update) => match serde_json::to_string(&update) {
                    Ok(body) => {
                        let chunk = web::Bytes::from(format!("data: {body}\n\n"));
                        return Some((Ok::<_, Infallible>(chunk), rx));
                    }
                    Err(e) => warn!("Could not serialize update: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber fell behind, skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    // Compressed bodies get buffered, which stalls the stream
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((CACHE_CONTROL, "no-cache"))
        .insert_header(ContentEncoding::Identity)
        .streaming(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{CharacteristicSink, CharacteristicUpdate};
    use crate::apcaccess::RawStatus;
    use crate::decoder::{ChargingState, DecodedState};
    use crate::poller::SnapshotStore;
    use actix_web::body::MessageBody;
    use actix_web::http::StatusCode;
    use futures_util::future::poll_fn;
    use actix_web::{App, test};
    use serde_json::Value;

    fn app_state(temperature_sensor: bool) -> (web::Data<AppState>, Arc<SnapshotStore>) {
        let store = Arc::new(SnapshotStore::new());
        let events = BroadcastSink::new(8);
        let info = AccessoryInfo {
            name: "APC UPS".to_string(),
            manufacturer: "American Power Conversion".to_string(),
            model: "APCAccess UPS".to_string(),
            serial: "unknown".to_string(),
        };
        let accessory = Arc::new(UpsAccessory::new(
            info,
            store.clone(),
            Arc::new(events.clone()),
            temperature_sensor,
        ));
        let state = web::Data::new(AppState {
            accessory,
            metrics: Arc::new(Metrics::new().unwrap()),
            events,
        });
        (state, store)
    }

    #[actix_web::test]
    async fn test_characteristic_reads() {
        let (state, store) = app_state(false);
        let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/characteristics/battery-level").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        store.commit(
            DecodedState {
                battery_percent: 64,
                charging_state: ChargingState::Charging,
                ..DecodedState::default()
            },
            RawStatus::default(),
        );

        let req = test::TestRequest::get().uri("/characteristics/battery-level").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["value"], 64);
        assert_eq!(body["characteristic"], "battery-level");

        let req = test::TestRequest::get().uri("/characteristics/charging-state").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["value"], 1);

        // Temperature sensor disabled
        let req = test::TestRequest::get().uri("/characteristics/current-temperature").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/characteristics/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_accessory_view() {
        let (state, store) = app_state(true);
        let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/accessory").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ready"], false);
        assert_eq!(body["values"]["battery-level"], Value::Null);
        assert_eq!(body["services"].as_array().map(Vec::len), Some(4));

        store.commit(
            DecodedState {
                contact_detected: true,
                temperature_celsius: Some(23),
                ..DecodedState::default()
            },
            [("UPSNAME", "rack")].into_iter().collect(),
        );
        let req = test::TestRequest::get().uri("/accessory").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ready"], true);
        assert_eq!(body["info"]["name"], "APC UPS");
        assert_eq!(body["values"]["contact-sensor-state"], 0);
        assert_eq!(body["values"]["current-temperature"], 23);
        assert_eq!(body["status"]["UPSNAME"], "rack");
    }

    #[actix_web::test]
    async fn test_metrics_endpoint() {
        let (state, _) = app_state(false);
        let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("apcupsd_ready 0"), "{body}");
    }

    #[actix_web::test]
    async fn test_events_stream_headers() {
        let (state, _) = app_state(false);
        let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;
        let req = test::TestRequest::get().uri("/events").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );

        // The handler has subscribed, so this update is queued for the stream
        state.events.update(CharacteristicUpdate {
            characteristic: Characteristic::StatusLowBattery,
            value: 1,
        });
        let body = resp.into_body();
        let mut body = std::pin::pin!(body);
        let chunk = poll_fn(|cx| body.as_mut().poll_next(cx)).await.unwrap().unwrap();
        assert_eq!(
            chunk,
            web::Bytes::from_static(b"data: {\"characteristic\":\"status-low-battery\",\"value\":1}\n\n")
        );
    }
}
