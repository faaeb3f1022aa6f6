use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{App, test, web};
use serde_json::Value;
use sysgpio::{AppConfig, AppState, GpioManager, MockGpioBackend};

fn sample_config() -> AppConfig {
    AppConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 30
            },
            "gpios": {
                "1": {
                    "name": "LED 1",
                    "line": 17,
                    "capabilities": ["output"]
                },
                "2": {
                    "name": "BUTTON 1",
                    "header": 7,
                    "capabilities": ["input"]
                },
                "42": {
                    "name": "General IO 1",
                    "line": 22,
                    "capabilities": ["input", "output"]
                }
            },
            "event_history_capacity": 2
        }
        "#,
    )
    .expect("valid sample config")
}

fn state_with(backend: Arc<MockGpioBackend>) -> (AppState<MockGpioBackend>, String) {
    let cfg = Arc::new(sample_config());
    let manager = Arc::new(GpioManager::new(cfg.clone(), backend));
    (AppState { manager }, cfg.http.path.clone())
}

macro_rules! init_app {
    ($backend:expr) => {{
        let (state, scope_path) = state_with($backend);
        test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(state.api_scope(&scope_path)),
        )
        .await
    }};
}

#[actix_rt::test]
async fn list_gpios_returns_all() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::get().uri("/api/v1/gpios").to_request();
    let response: HashMap<String, Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response.len(), 3);

    let led = &response["1"];
    assert_eq!(led["settings"]["state"], "closed");
    assert_eq!(led["settings"]["edge"], "none");
    assert_eq!(led["line"], 17);
    assert_eq!(led["info"]["name"], "LED 1");

    // declared by header position 7
    assert_eq!(response["2"]["line"], 4);
}

#[actix_rt::test]
async fn pin_not_found_returns_404() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/999/info")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/info")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::delete()
        .uri("/api/v1/gpio/1/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn set_state_and_value_happy_path() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/settings")
        .set_payload(r#"{"state":"output"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/value")
        .set_payload("0")
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "0");
}

#[actix_rt::test]
async fn reject_value_out_of_range() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/settings")
        .set_payload(r#"{"state":"output"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/value")
        .set_payload("2")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn reject_value_when_not_output() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/2/settings")
        .set_payload(r#"{"state":"input"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/2/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn reject_unsupported_state() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/settings")
        .set_payload(r#"{"state":"input"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn edge_on_output_is_a_precondition_violation() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/settings")
        .set_payload(r#"{"state":"output","edge":"rising"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/42/settings")
        .to_request();
    let settings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings["state"], "closed");
}

#[actix_rt::test]
async fn leaving_input_clears_edge() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/settings")
        .set_payload(r#"{"state":"input","edge":"both"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/settings")
        .set_payload(r#"{"state":"output"}"#)
        .to_request();
    let settings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings["state"], "output");
    assert_eq!(settings["edge"], "none");
}

#[actix_rt::test]
async fn get_pin_info_happy_path() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/info")
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(resp["name"], "BUTTON 1");
    assert_eq!(resp["header"], 7);
    assert!(resp.get("line").is_none());
}

#[actix_rt::test]
async fn settings_round_trip() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/42/settings")
        .to_request();
    let settings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings["state"], "closed");

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/settings")
        .set_payload(r#"{"state":"input","edge":"falling"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/gpio/42").to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["settings"]["state"], "input");
    assert_eq!(desc["settings"]["edge"], "falling");

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/settings")
        .set_payload(r#"{"state":"closed"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/42/settings")
        .to_request();
    let settings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings["state"], "closed");
}

#[actix_rt::test]
async fn malformed_settings_payload_returns_400() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    for payload in ["", "{", r#"{"state":"sideways"}"#, r#"{"debounce_ms":5}"#] {
        let req = test::TestRequest::post()
            .uri("/api/v1/gpio/42/settings")
            .set_payload(payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "payload {payload:?}");
    }
}

#[actix_rt::test]
async fn edge_events_are_recorded() {
    let backend = Arc::new(MockGpioBackend::default());
    let app = init_app!(backend.clone());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/event")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/2/settings")
        .set_payload(r#"{"state":"input","edge":"rising"}"#)
        .to_request();
    test::call_service(&app, req).await;

    // three rising transitions, the falling ones do not match the edge
    for level in [true, false, true, false, true] {
        backend.inject_level(2, level).unwrap();
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/events")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    // history capacity is 2
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e["edge"] == "rising" && e["pin_id"] == 2));

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/events?limit=1")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 1);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/event")
        .to_request();
    let last: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(last["pin_id"], 2);
}

#[actix_rt::test]
async fn header_lookup() {
    let app = init_app!(Arc::new(MockGpioBackend::default()));

    let req = test::TestRequest::get()
        .uri("/api/v1/header/11")
        .to_request();
    let pin: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(pin["kind"], "gpio");
    assert_eq!(pin["value"], 17);

    let req = test::TestRequest::get().uri("/api/v1/header/1").to_request();
    let pin: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(pin["kind"], "power");
    assert_eq!(pin["value"], "3.3V");

    let req = test::TestRequest::get().uri("/api/v1/header/6").to_request();
    let pin: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(pin["kind"], "ground");

    let req = test::TestRequest::get()
        .uri("/api/v1/header/41")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
