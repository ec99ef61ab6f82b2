//! HTTP facade over the oracle.
//!
//! A thin read-only layer: every handler delegates to `Oracle` and
//! renders JSON. Absent entities render `{}` with 200; only malformed
//! client input earns a 4xx. Internal error text never reaches clients.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::oracle::OracleApp;

type App = State<Arc<OracleApp>>;

/// Build the full route table. Demo-only endpoints are mounted only when
/// demo mode is on.
pub fn router(app: Arc<OracleApp>) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/v0/oracle/oracle_info", get(oracle_info))
        .route("/api/v0/oracle/oracle_status", get(oracle_status))
        .route("/api/v0/event/event/:event_id", get(event_by_id))
        .route("/api/v0/event/events", get(events_filter))
        .route("/api/v0/event/event_ids", get(event_ids_filter))
        .route("/api/v0/event/event_classes", get(event_classes))
        .route("/api/v0/event/next_event", get(next_event))
        .route("/api/v0/price/current_all", get(price_current_all))
        .route("/api/v0/price/current/:symbol", get(price_current))
        .route("/api/v0/price_info/current_all", get(price_info_current_all))
        .route("/api/v0/price_info/current/:symbol", get(price_info_current));

    if app.demo_mode {
        router = router
            .route("/api/v0/openapi.json", get(openapi_schema))
            .route(
                "/api/v0/test_only/dummy_outcome_for_event/:event_id",
                get(dummy_outcome_for_event),
            );
    }

    router
        .with_state(app)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging))
}

/// Request logging middleware: method, path, status, latency.
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Skip health checks to reduce noise.
    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency = start.elapsed();
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "request failed"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "request completed"
        );
    }
    response
}

/// Reject obviously malformed definitions before they reach the store.
fn validate_definition(definition: &Option<String>) -> Result<(), StatusCode> {
    if let Some(def) = definition {
        validate_symbol(def)?;
    }
    Ok(())
}

fn validate_symbol(symbol: &str) -> Result<(), StatusCode> {
    if symbol.is_empty() || symbol.len() > 32 || !symbol.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(())
}

/// Render an optional entity: present as its JSON form, absent as `{}`.
fn entity_or_empty<T: serde::Serialize>(entity: Option<T>) -> Result<Json<Value>, StatusCode> {
    match entity {
        Some(value) => serde_json::to_value(value)
            .map(Json)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR),
        None => Ok(Json(json!({}))),
    }
}

async fn root() -> Json<Value> {
    Json(json!({ "Oracle": "API" }))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn oracle_info(State(app): App) -> Result<Json<Value>, StatusCode> {
    let info = app
        .oracle
        .get_oracle_info()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(Some(info))
}

async fn oracle_status(State(app): App) -> Result<Json<Value>, StatusCode> {
    let status = app
        .oracle
        .get_oracle_status()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(Some(status))
}

async fn event_by_id(
    Path(event_id): Path<String>,
    State(app): App,
) -> Result<Json<Value>, StatusCode> {
    let info = app
        .oracle
        .get_event_by_id(&event_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(info)
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    start_time: i64,
    #[serde(default)]
    end_time: i64,
    definition: Option<String>,
}

async fn events_filter(
    Query(params): Query<EventsQuery>,
    State(app): App,
) -> Result<Json<Value>, StatusCode> {
    validate_definition(&params.definition)?;
    let events = app
        .oracle
        .get_events_filter(
            params.start_time,
            params.end_time,
            params.definition.as_deref(),
            100,
        )
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(Some(events))
}

async fn event_ids_filter(
    Query(params): Query<EventsQuery>,
    State(app): App,
) -> Result<Json<Value>, StatusCode> {
    validate_definition(&params.definition)?;
    let ids = app
        .oracle
        .get_event_ids_filter(
            params.start_time,
            params.end_time,
            params.definition.as_deref(),
        )
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(Some(ids))
}

async fn event_classes(State(app): App) -> Result<Json<Value>, StatusCode> {
    let classes = app
        .oracle
        .get_event_classes()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(Some(classes))
}

#[derive(Debug, Deserialize)]
struct NextEventQuery {
    definition: String,
    /// Seconds ahead the caller needs; floats accepted for parity with
    /// older clients.
    #[serde(default)]
    period: Option<f64>,
}

async fn next_event(
    Query(params): Query<NextEventQuery>,
    State(app): App,
) -> Result<Json<Value>, StatusCode> {
    validate_symbol(&params.definition)?;
    let period = params.period.unwrap_or(60.0) as i64;
    let info = app
        .oracle
        .get_next_event(&params.definition, period)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(info)
}

async fn price_current_all(State(app): App) -> Json<Value> {
    Json(json!(app.oracle.get_current_prices().await))
}

async fn price_current(
    Path(symbol): Path<String>,
    State(app): App,
) -> Result<Json<f64>, StatusCode> {
    validate_symbol(&symbol)?;
    Ok(Json(app.oracle.get_price(&symbol, 0.0).await))
}

async fn price_info_current_all(State(app): App) -> Json<Value> {
    Json(json!(app.oracle.get_current_price_infos().await))
}

async fn price_info_current(
    Path(symbol): Path<String>,
    State(app): App,
) -> Result<Json<Value>, StatusCode> {
    validate_symbol(&symbol)?;
    let info = app.oracle.get_price_info(&symbol).await;
    entity_or_empty(Some(info))
}

async fn dummy_outcome_for_event(
    Path(event_id): Path<String>,
    State(app): App,
) -> Result<Json<Value>, StatusCode> {
    let info = app
        .oracle
        .dummy_outcome_for_event(&event_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    entity_or_empty(info)
}

/// Minimal OpenAPI document, enough for demo tooling to discover the
/// route table.
async fn openapi_schema() -> Json<Value> {
    let paths: Value = [
        "/api/v0/oracle/oracle_info",
        "/api/v0/oracle/oracle_status",
        "/api/v0/event/event/{event_id}",
        "/api/v0/event/events",
        "/api/v0/event/event_ids",
        "/api/v0/event/event_classes",
        "/api/v0/event/next_event",
        "/api/v0/price/current_all",
        "/api/v0/price/current/{symbol}",
        "/api/v0/price_info/current_all",
        "/api/v0/price_info/current/{symbol}",
    ]
    .iter()
    .map(|path| {
        (
            path.to_string(),
            json!({ "get": { "responses": { "200": { "description": "OK" } } } }),
        )
    })
    .collect::<serde_json::Map<String, Value>>()
    .into();

    Json(json!({
        "openapi": "3.0.0",
        "info": { "title": "Attestor Oracle API", "version": "0.1.0" },
        "paths": paths,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeySigner, Network};
    use crate::oracle::Oracle;
    use crate::price::{PriceAggregator, PriceInfoSingle, PriceSource};
    use crate::scheduler::Scheduler;
    use crate::store::{EventClassRow, EventStore, MemoryEventStore};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use chrono::Utc;
    use tower::ServiceExt;

    struct FixedPriceSource;

    #[async_trait]
    impl PriceSource for FixedPriceSource {
        fn id(&self) -> &'static str {
            "Fixed"
        }
        fn fast(&self, _symbol: &str, _pref_max_age: f64) -> Option<PriceInfoSingle> {
            None
        }
        async fn fetch(&self, symbol: &str, _pref_max_age: f64) -> PriceInfoSingle {
            let now = crate::price::now_ts();
            PriceInfoSingle::new(61_250.0, symbol, now, now, self.id())
        }
    }

    async fn test_app(demo_mode: bool) -> Router {
        let now = Utc::now().timestamp();
        let store = Arc::new(MemoryEventStore::new()) as Arc<dyn EventStore>;
        let signer = Arc::new(KeySigner::init(&[0x01; 16], Network::Signet).unwrap());
        let prices = PriceAggregator::new(
            vec![Arc::new(FixedPriceSource) as Arc<dyn PriceSource>],
            vec!["BTCUSD".to_string()],
        );

        let period = 3600;
        let first = (now / period) * period;
        let class = EventClassRow {
            id: "btcusd".to_string(),
            create_time: now,
            definition: "BTCUSD".to_string(),
            range_digits: 7,
            range_digit_low_pos: 0,
            string_template: crate::codec::EVENT_STRING_TEMPLATE_DEFAULT.to_string(),
            repeat_first_time: first,
            repeat_period: period,
            repeat_offset: first.rem_euclid(period),
            repeat_last_time: first + 100 * period,
            signer_public_key: signer.public_key(0).unwrap(),
        };
        store.insert_class_if_missing(&class).await.unwrap();

        let scheduler = Scheduler::new(store.clone(), signer.clone(), prices.clone(), 2, false);
        scheduler.create_future_events(now, 10).await.unwrap();

        let oracle = Oracle::new(store, prices, signer, 2).unwrap();
        router(Arc::new(OracleApp { oracle, demo_mode }))
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn oracle_info_and_status_routes() {
        let app = test_app(false).await;

        let (status, body) = get_json(&app, "/api/v0/oracle/oracle_info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["main_public_key"].as_str().unwrap().len(), 64);
        assert_eq!(body["horizon_days"], 2);

        let (status, body) = get_json(&app, "/api/v0/oracle/oracle_status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["total_event_count"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn missing_event_renders_empty_object() {
        let app = test_app(false).await;
        let (status, body) = get_json(&app, "/api/v0/event/event/doesnotexist").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn event_routes_round_trip() {
        let app = test_app(false).await;

        let (status, ids) = get_json(&app, "/api/v0/event/event_ids?definition=BTCUSD").await;
        assert_eq!(status, StatusCode::OK);
        let ids = ids.as_array().unwrap();
        assert!(!ids.is_empty());

        let first_id = ids[0].as_str().unwrap();
        let (status, event) = get_json(&app, &format!("/api/v0/event/event/{first_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(event["event_id"], first_id);
        assert_eq!(event["event_type"], "numeric");
        assert_eq!(event["has_outcome"], false);
        assert_eq!(event["nonces"].as_array().unwrap().len(), 7);

        let (status, events) = get_json(&app, "/api/v0/event/events?definition=BTCUSD").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events.as_array().unwrap().len(), ids.len().min(100));

        let (status, classes) = get_json(&app, "/api/v0/event/event_classes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(classes.as_array().unwrap().len(), 1);

        let (status, next) =
            get_json(&app, "/api/v0/event/next_event?definition=btcusd&period=60").await;
        assert_eq!(status, StatusCode::OK);
        assert!(next["event_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn malformed_definition_is_rejected() {
        let app = test_app(false).await;
        let (status, _) = get_json(&app, "/api/v0/event/event_ids?definition=DROP%20TABLE").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn price_routes() {
        let app = test_app(false).await;

        let (status, price) = get_json(&app, "/api/v0/price/current/BTCUSD").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(price, json!(61_250.0));

        let (status, all) = get_json(&app, "/api/v0/price/current_all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all["BTCUSD"], json!(61_250.0));

        let (status, info) = get_json(&app, "/api/v0/price_info/current/BTCUSD").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["price"], json!(61_250.0));
        assert!(info["source"].as_str().unwrap().starts_with("Multi{cnt:1"));
    }

    #[tokio::test]
    async fn demo_routes_are_gated() {
        let app = test_app(false).await;
        let (status, _) = get_json(&app, "/api/v0/openapi.json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let demo_app = test_app(true).await;
        let (status, schema) = get_json(&demo_app, "/api/v0/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(schema["openapi"], "3.0.0");
    }
}
