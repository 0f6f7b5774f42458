//! REST, bulk and WebSocket routes.
//!
//! `/rest/...` answers with bare values and takes form bodies; `/json/...`
//! wraps results in `{success, result}` and takes JSON bodies. Failures use
//! the gateway's `{success: false, errors: {...}}` shape on both.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use fieldgate_core::{BulkRequest, Gateway, GatewayError};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

/// Create the HTTP router.
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    let cors = cors_layer(&gateway.config().http.cors_domains);
    let state = AppState { gateway };

    Router::new()
        .route("/version", get(version_handler))
        .route("/rest/all", get(rest_all))
        .route("/json/all", get(json_all))
        .route("/rest/:dev/:circuit", get(rest_get).post(rest_set))
        .route("/rest/:dev/:circuit/:prop", get(rest_get_prop).post(rest_set_prop))
        .route("/json/:dev/:circuit", get(json_get).post(json_set))
        .route("/json/:dev/:circuit/:prop", get(json_get_prop).post(json_set_prop))
        .route("/bulk", post(bulk_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// `*` allows any origin, otherwise a comma-separated origin list.
fn cors_layer(domains: &str) -> CorsLayer {
    if domains.trim() == "*" {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = domains
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .filter_map(|d| match HeaderValue::from_str(d) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %d, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn status_for(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::UnknownDeviceType(_)
        | GatewayError::UnknownDevice { .. }
        | GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::UnknownOperation { .. } | GatewayError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: GatewayError) -> Response {
    debug!(error = %error, "Request failed");
    (status_for(&error), Json(error.to_response())).into_response()
}

fn rest_response(result: fieldgate_core::Result<Value>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(e),
    }
}

fn json_response(result: fieldgate_core::Result<Value>) -> Response {
    match result {
        Ok(value) => Json(json!({ "success": true, "result": value })).into_response(),
        Err(e) => error_response(e),
    }
}

fn form_values(form: HashMap<String, String>) -> Map<String, Value> {
    form.into_iter().map(|(k, v)| (k, Value::String(v))).collect()
}

/// A write to `/{dev}/{circuit}/{prop}` sets that one parameter from the
/// body's `value`.
fn property_values(prop: String, value: Option<Value>) -> Map<String, Value> {
    let mut values = Map::new();
    if let Some(value) = value {
        values.insert(prop, value);
    }
    values
}

async fn version_handler() -> Response {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") })).into_response()
}

async fn rest_all(State(state): State<AppState>) -> Response {
    Json(state.gateway.commands().all()).into_response()
}

async fn json_all(State(state): State<AppState>) -> Response {
    json_response(Ok(Value::Array(state.gateway.commands().all())))
}

async fn rest_get(
    State(state): State<AppState>,
    Path((dev, circuit)): Path<(String, String)>,
) -> Response {
    rest_response(state.gateway.commands().get(&dev, &circuit, None))
}

async fn rest_get_prop(
    State(state): State<AppState>,
    Path((dev, circuit, prop)): Path<(String, String, String)>,
) -> Response {
    rest_response(state.gateway.commands().get(&dev, &circuit, Some(&prop)))
}

async fn rest_set(
    State(state): State<AppState>,
    Path((dev, circuit)): Path<(String, String)>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let result = state
        .gateway
        .commands()
        .set(&dev, &circuit, form_values(form))
        .await;
    json_response(result)
}

async fn rest_set_prop(
    State(state): State<AppState>,
    Path((dev, circuit, prop)): Path<(String, String, String)>,
    Form(mut form): Form<HashMap<String, String>>,
) -> Response {
    let values = property_values(prop, form.remove("value").map(Value::String));
    json_response(state.gateway.commands().set(&dev, &circuit, values).await)
}

async fn json_get(
    State(state): State<AppState>,
    Path((dev, circuit)): Path<(String, String)>,
) -> Response {
    json_response(state.gateway.commands().get(&dev, &circuit, None))
}

async fn json_get_prop(
    State(state): State<AppState>,
    Path((dev, circuit, prop)): Path<(String, String, String)>,
) -> Response {
    json_response(state.gateway.commands().get(&dev, &circuit, Some(&prop)))
}

async fn json_set(
    State(state): State<AppState>,
    Path((dev, circuit)): Path<(String, String)>,
    Json(values): Json<Map<String, Value>>,
) -> Response {
    json_response(state.gateway.commands().set(&dev, &circuit, values).await)
}

async fn json_set_prop(
    State(state): State<AppState>,
    Path((dev, circuit, prop)): Path<(String, String, String)>,
    Json(mut body): Json<Map<String, Value>>,
) -> Response {
    let values = property_values(prop, body.remove("value"));
    json_response(state.gateway.commands().set(&dev, &circuit, values).await)
}

async fn bulk_handler(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Response {
    Json(state.gateway.commands().bulk(&request).await).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_session(state.gateway, socket))
}

/// Pump events out and commands in until either side closes.
async fn ws_session(gateway: Arc<Gateway>, socket: WebSocket) {
    let (session, mut outbox) = gateway.subscribe_websocket();
    let (mut sink, mut stream) = socket.split();
    debug!(subscriber = session.id(), "WebSocket session opened");

    loop {
        tokio::select! {
            Some(text) = outbox.recv() => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = gateway.commands().handle_ws_message(&session, &text).await;
                    if let Some(reply) = reply {
                        if sink.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(subscriber = session.id(), error = %e, "WebSocket receive error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    gateway.unsubscribe(session.id());
    debug!(subscriber = session.id(), "WebSocket session closed");
}

/// HTTP server configuration.
pub struct HttpServer {
    gateway: Arc<Gateway>,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(gateway: Arc<Gateway>, listen_addr: SocketAddr) -> Self {
        Self {
            gateway,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.gateway);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fieldgate_core::GatewayConfig;
    use tower::ServiceExt;

    fn router() -> Router {
        create_router(Arc::new(Gateway::new(GatewayConfig::default())))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let response = router()
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unknown_device_type_is_404() {
        let response = router()
            .oneshot(Request::get("/rest/flux/1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["errors"]["UnknownDeviceTypeError"].is_string());
    }

    #[tokio::test]
    async fn test_json_all_empty() {
        let response = router()
            .oneshot(Request::get("/json/all").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, json!({ "success": true, "result": [] }));
    }

    #[tokio::test]
    async fn test_permissive_cors() {
        let response = router()
            .oneshot(
                Request::get("/version")
                    .header("origin", "http://panel.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_origin_list() {
        let mut config = GatewayConfig::default();
        config.http.cors_domains = "http://a.local, http://b.local".to_string();
        let router = create_router(Arc::new(Gateway::new(config)));

        let response = router
            .oneshot(
                Request::get("/version")
                    .header("origin", "http://b.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://b.local"
        );
    }

    #[test]
    fn test_property_values() {
        let values = property_values("value".to_string(), Some(json!("1")));
        assert_eq!(values["value"], "1");
        assert!(property_values("timeout".to_string(), None).is_empty());
    }
}
