use log::{debug, warn};
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, Resource, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::GpioError;
use crate::gpio::{GpioBackend, GpioManager, PinSettings, PinState};
use crate::header;
use crate::interrupt::EdgeEvent;
use crate::sysfs::Edge;

pub struct AppState<B: GpioBackend> {
    pub manager: Arc<GpioManager<B>>,
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsPayload {
    state: Option<PinState>,
    edge: Option<Edge>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    pin_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if pin_filter.is_some_and(|p| p != event.pin_id) {
                            continue;
                        }
                        let Ok(text) = serde_json::to_string(&event) else { continue; };
                        if session.text(text).await.is_err() {
                            debug!("event stream client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = serde_json::json!({ "error": format!("event stream lagged by {n} events") });
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("event stream client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Adds a catch-all 405 route for every method not in `allowed`.
fn restrict(resource: Resource, allowed: &[Method]) -> Resource {
    resource.route(
        web::route()
            .guard(guard_not_methods(allowed))
            .to(method_not_allowed),
    )
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(restrict(
                web::resource("/gpios").route(web::get().to(list_gpios::<B>)),
                &[Method::GET],
            ))
            .service(restrict(
                web::resource("/gpios/events").route(web::get().to(events_ws::<B>)),
                &[Method::GET],
            ))
            .service(restrict(
                web::resource("/gpio/{pin_id}").route(web::get().to(pin_descriptor::<B>)),
                &[Method::GET],
            ))
            .service(restrict(
                web::resource("/gpio/{pin_id}/info").route(web::get().to(pin_info::<B>)),
                &[Method::GET],
            ))
            .service(restrict(
                web::resource("/gpio/{pin_id}/settings")
                    .route(web::get().to(get_settings::<B>))
                    .route(web::post().to(set_settings::<B>)),
                &[Method::GET, Method::POST],
            ))
            .service(restrict(
                web::resource("/gpio/{pin_id}/value")
                    .route(web::get().to(get_value::<B>))
                    .route(web::post().to(set_value::<B>)),
                &[Method::GET, Method::POST],
            ))
            .service(restrict(
                web::resource("/gpio/{pin_id}/event").route(web::get().to(get_last_event::<B>)),
                &[Method::GET],
            ))
            .service(restrict(
                web::resource("/gpio/{pin_id}/events").route(web::get().to(get_events::<B>)),
                &[Method::GET],
            ))
            .service(restrict(
                web::resource("/gpio/{pin_id}/stream").route(web::get().to(pin_events_ws::<B>)),
                &[Method::GET],
            ))
            .service(restrict(
                web::resource("/header/{position}").route(web::get().to(header_pin)),
                &[Method::GET],
            ))
    }
}

async fn list_gpios<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pins = state.manager.list_pins().await?;

    Ok(web::Json(pins))
}

async fn pin_descriptor<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let desc = state.manager.get_pin_descriptor(pin_id).await?;

    Ok(web::Json(desc))
}

async fn pin_info<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let info = state.manager.get_pin_info(pin_id).await?;

    Ok(web::Json(info))
}

async fn get_settings<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let settings = state.manager.get_pin_settings(pin_id).await?;

    Ok(web::Json(settings))
}

async fn set_settings<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let current = state.manager.get_pin_settings(pin_id).await?;
    let merged = parse_settings_payload(&body, current)?;

    state.manager.set_pin_settings(pin_id, &merged).await?;

    Ok(web::Json(merged))
}

async fn get_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;

    let value = state.manager.read_value(pin_id).await?;

    Ok(web::Json(u8::from(value)))
}

async fn set_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    let value = parse_value_payload(&body)?;

    state.manager.write_value(pin_id, value).await?;

    Ok(HttpResponse::Ok())
}

async fn get_last_event<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;

    let last = state.manager.get_last_event(pin_id).await?;

    match last {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::NoContent().finish()),
    }
}

async fn get_events<B: GpioBackend + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let pin_id = parse_pin_id(&req)?;

    let events = state.manager.get_events(pin_id, query.limit).await?;

    Ok(web::Json(events))
}

async fn header_pin(req: HttpRequest) -> Result<impl Responder, GpioError> {
    let position = req
        .match_info()
        .get("position")
        .and_then(|p| p.parse::<u8>().ok())
        .ok_or_else(|| GpioError::InvalidValue("Invalid header position".into()))?;

    let pin = header::pin_at(position)
        .ok_or_else(|| GpioError::NotFoundPin(format!("header position {position}")))?;

    Ok(web::Json(pin))
}

async fn events_ws<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, GpioError> {
    open_event_stream(&req, stream, &state, None)
}

async fn pin_events_ws<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, GpioError> {
    let pin_id = parse_pin_id(&req)?;
    state.manager.get_pin_info(pin_id).await?;
    open_event_stream(&req, stream, &state, Some(pin_id))
}

fn open_event_stream<B: GpioBackend + 'static>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState<B>,
    pin_filter: Option<u32>,
) -> Result<HttpResponse, GpioError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| GpioError::InvalidState(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, pin_filter).await;
    });

    Ok(response)
}

fn parse_value_payload(body: &[u8]) -> Result<u8, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => text
            .trim()
            .parse::<u8>()
            .map_err(|_| GpioError::InvalidValue("Value must be an integer".into())),
        _ => Err(GpioError::InvalidValue(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_pin_id(req: &HttpRequest) -> Result<u32, GpioError> {
    let pin_id = req
        .match_info()
        .get("pin_id")
        .ok_or_else(|| GpioError::InvalidValue("Missing pin id".into()))?;
    let pin_id = pin_id
        .parse::<u32>()
        .map_err(|_| GpioError::InvalidValue("Invalid pin id".into()))?;

    Ok(pin_id)
}

fn parse_settings_payload(body: &[u8], current: PinSettings) -> Result<PinSettings, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty settings payload".into()));
    }

    let payload: SettingsPayload = serde_json::from_slice(body)
        .map_err(|e| GpioError::InvalidValue(format!("Invalid settings payload: {e}")))?;

    let mut merged = current;
    if let Some(state) = payload.state {
        merged.state = state;
        // leaving input mode implicitly disarms edge detection
        if !state.is_edge_detectable() && payload.edge.is_none() {
            merged.edge = Edge::None;
        }
    }
    if let Some(edge) = payload.edge {
        merged.edge = edge;
    }
    Ok(merged)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
