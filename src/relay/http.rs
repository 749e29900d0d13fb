//! HTTP relay
//!
//! Serves one endpoint per configured HTTP server at `/mcp/<gateway>/<server>` and
//! forwards each request to the server's URL. Request bodies, JSON response bodies
//! and every `data:` line of an event stream run through the endpoint's processor
//! chain. A rejected request is answered directly and never forwarded.

use crate::config::{substituted_headers, GlobalConfig};
use crate::error::{ConfigError, RelayError, Result};
use crate::logging::{ActivityEvent, ActivityKind, ActivityLogger, TracingActivityLogger};
use crate::processor::envelope::request_id;
use crate::processor::{ErrorEnvelope, ProcessorChain};
use crate::relay::frame::{frame_reader, MAX_FRAME_BYTES};
use crate::relay::message::{Direction, Message, MessageType, TransportKind};
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap as ForwardHeaders, HeaderName, HeaderValue};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::http::{HeaderMap, Method, Response, StatusCode};
use warp::hyper::Body;
use warp::{Filter, Rejection, Reply};

/// Largest request body accepted from a client
pub const MAX_BODY_BYTES: usize = MAX_FRAME_BYTES;

/// Client headers copied onto the downstream request
const FORWARDED_REQUEST_HEADERS: [&str; 5] = [
    "content-type",
    "accept",
    "mcp-session-id",
    "mcp-protocol-version",
    "last-event-id",
];

/// Downstream headers copied onto the client response
const FORWARDED_RESPONSE_HEADERS: [&str; 4] = [
    "content-type",
    "cache-control",
    "mcp-session-id",
    "mcp-protocol-version",
];

/// One `/mcp/<gateway>/<server>` endpoint
struct Endpoint {
    path: String,
    target: String,
    headers: ForwardHeaders,
    chain: ProcessorChain,
    session_id: String,
}

struct Shared {
    endpoints: HashMap<String, Arc<Endpoint>>,
    client: reqwest::Client,
    logger: Arc<dyn ActivityLogger>,
    server_id: String,
}

pub struct HttpRelay {
    shared: Arc<Shared>,
    addr: String,
}

impl HttpRelay {
    /// Build every endpoint from configuration.
    ///
    /// Header references are resolved and processor chains instantiated here, so a
    /// missing variable or a bad processor is reported before anything is served.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        if config.gateways.is_empty() {
            return Err(ConfigError::Validation(
                "no gateways configured. Add at least one gateway with HTTP MCP servers".into(),
            )
            .into());
        }

        let working_dir = crate::processor::default_working_dir();
        let mut endpoints = HashMap::new();

        for (gateway_name, server_name, server) in config.servers() {
            if !server.enabled {
                debug!("Skipping disabled server '{}/{}'", gateway_name, server_name);
                continue;
            }
            let Some(target) = server.url.clone().filter(|_| server.is_http()) else {
                warn!(
                    "Server '{}/{}' uses stdio transport; it is not exposed over HTTP",
                    gateway_name, server_name
                );
                continue;
            };

            let mut headers = ForwardHeaders::new();
            for (key, value) in substituted_headers(server)? {
                let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                    ConfigError::Validation(format!("server '{server_name}': header '{key}': {e}"))
                })?;
                let value = HeaderValue::from_str(&value).map_err(|e| {
                    ConfigError::Validation(format!("server '{server_name}': header '{key}': {e}"))
                })?;
                headers.insert(name, value);
            }

            let chain = ProcessorChain::from_configs(
                &config.processors_for_gateway(gateway_name),
                server_name,
                &working_dir,
            )?;

            let path = format!("/mcp/{gateway_name}/{server_name}");
            endpoints.insert(
                format!("{gateway_name}/{server_name}"),
                Arc::new(Endpoint {
                    path,
                    target,
                    headers,
                    chain,
                    session_id: format!("http_{gateway_name}_{server_name}_{}", Uuid::new_v4()),
                }),
            );
        }

        if endpoints.is_empty() {
            return Err(ConfigError::Validation(
                "no HTTP endpoints configured. Add at least one server with a 'url'".into(),
            )
            .into());
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.proxy.request_timeout())
            .build()
            .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            shared: Arc::new(Shared {
                endpoints,
                client,
                logger: Arc::new(TracingActivityLogger),
                server_id: format!("{}_{}", config.name.replace(' ', "_"), Uuid::new_v4()),
            }),
            addr: format!("{}:{}", config.proxy.host, config.proxy.port),
        })
    }

    /// Replace the activity sink. Only effective before [`routes`](Self::routes) is called.
    pub fn with_logger(mut self, logger: Arc<dyn ActivityLogger>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.logger = logger;
        }
        self
    }

    /// Endpoint paths, sorted
    pub fn endpoints(&self) -> Vec<String> {
        let mut paths: Vec<_> = self
            .shared
            .endpoints
            .values()
            .map(|e| e.path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = std::convert::Infallible> + Clone {
        let shared = self.shared.clone();
        let relay = warp::path!("mcp" / String / String)
            .and(warp::method())
            .and(warp::header::headers_cloned())
            .and(warp::body::stream())
            .and_then(move |gateway, server, method, headers, body| {
                let shared = shared.clone();
                async move {
                    let body = read_body(body).await;
                    handle(shared, gateway, server, method, headers, body).await
                }
            });

        let endpoints = self.endpoints();
        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                warp::reply::json(&json!({
                    "status": "healthy",
                    "service": "mcp-relay",
                    "endpoints": endpoints,
                }))
            });

        health.or(relay).recover(handle_rejection)
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = self.addr.parse().map_err(|e| RelayError::Bind {
            addr: self.addr.clone(),
            reason: format!("{e}"),
        })?;

        let routes = self.routes();
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| RelayError::Bind {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;

        info!("HTTP relay listening on {}", bound);
        for endpoint in self.shared.endpoints.values() {
            info!("Registered endpoint {} -> {}", endpoint.path, endpoint.target);
            self.shared.log_system(endpoint, ActivityKind::Start, "endpoint started");
        }

        server.await;

        for endpoint in self.shared.endpoints.values() {
            self.shared.log_system(endpoint, ActivityKind::Stop, "endpoint stopped");
        }
        info!("HTTP relay stopped");
        Ok(())
    }
}

#[derive(Debug)]
enum BodyError {
    TooLarge,
    Read(warp::Error),
}

async fn read_body<S, B>(body: S) -> std::result::Result<Bytes, BodyError>
where
    S: Stream<Item = std::result::Result<B, warp::Error>>,
    B: Buf,
{
    futures::pin_mut!(body);
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let mut chunk = chunk.map_err(BodyError::Read)?;
        if buffer.len() + chunk.remaining() > MAX_BODY_BYTES {
            return Err(BodyError::TooLarge);
        }
        while chunk.has_remaining() {
            let bytes = chunk.chunk();
            let len = bytes.len();
            buffer.extend_from_slice(bytes);
            chunk.advance(len);
        }
    }
    Ok(buffer.freeze())
}

/// Outcome of running one body or event line through a chain
enum Processed {
    Forward(String),
    Reject { status: u16, envelope: String },
    Drop,
}

impl Shared {
    async fn process(&self, endpoint: &Endpoint, direction: Direction, raw: &str) -> Processed {
        if !endpoint.chain.has_processors() || raw.trim().is_empty() {
            return Processed::Forward(raw.to_string());
        }

        let message = Message::classified(direction, raw, TransportKind::Http, &endpoint.session_id);
        let result = match endpoint.chain.execute(&message).await {
            Ok(result) => result,
            Err(e) => {
                warn!(endpoint = %endpoint.path, ?direction, "Forwarding unprocessed body: {}", e);
                return Processed::Forward(raw.to_string());
            }
        };

        self.log_frame(endpoint, direction, result.status, result.error.clone());

        if result.is_success() {
            return Processed::Forward(
                serde_json::to_string(&result.payload).unwrap_or_else(|_| raw.to_string()),
            );
        }

        let id = serde_json::from_str::<Value>(raw)
            .map(|frame| request_id(&frame))
            .unwrap_or(Value::Null);
        match (message.message_type, result.error_envelope(id)) {
            (MessageType::Notification, _) | (_, None) => Processed::Drop,
            (_, Some(envelope)) => Processed::Reject {
                status: result.status,
                envelope: envelope.to_json(),
            },
        }
    }

    fn log_frame(&self, endpoint: &Endpoint, direction: Direction, status: u16, error: Option<String>) {
        let mut event = ActivityEvent::frame(
            &endpoint.session_id,
            &self.server_id,
            direction,
            TransportKind::Http,
            status,
        );
        event.message = error;
        self.logger.log(&event);
    }

    fn log_system(&self, endpoint: &Endpoint, kind: ActivityKind, message: &str) {
        self.logger.log(&ActivityEvent::system(
            kind,
            &endpoint.session_id,
            &self.server_id,
            TransportKind::Http,
            format!("{message}: {} -> {}", endpoint.path, endpoint.target),
        ));
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        warp::http::header::CONTENT_TYPE,
        warp::http::HeaderValue::from_static("application/json"),
    );
    response
}

async fn handle(
    shared: Arc<Shared>,
    gateway: String,
    server: String,
    method: Method,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BodyError>,
) -> std::result::Result<Response<Body>, Rejection> {
    let Some(endpoint) = shared.endpoints.get(&format!("{gateway}/{server}")).cloned() else {
        return Err(warp::reject::not_found());
    };

    let body = match body {
        Ok(body) => body,
        Err(BodyError::TooLarge) => {
            warn!(endpoint = %endpoint.path, "Request body exceeds {} bytes", MAX_BODY_BYTES);
            let envelope = ErrorEnvelope::internal(Value::Null, "request body exceeds maximum size");
            return Ok(json_response(StatusCode::PAYLOAD_TOO_LARGE, envelope.to_json()));
        }
        Err(BodyError::Read(e)) => {
            warn!(endpoint = %endpoint.path, "Failed to read request body: {}", e);
            let envelope = ErrorEnvelope::internal(Value::Null, "failed to read request body");
            return Ok(json_response(StatusCode::BAD_REQUEST, envelope.to_json()));
        }
    };

    // Bodies that are not text cannot be JSON-RPC frames; they pass untouched
    let outbound = match std::str::from_utf8(&body) {
        Ok(text) => match shared.process(&endpoint, Direction::ClientToServer, text).await {
            Processed::Forward(text) => Bytes::from(text),
            Processed::Reject { status, envelope } => {
                info!(endpoint = %endpoint.path, status, "Request rejected by processor chain");
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Ok(json_response(status, envelope));
            }
            Processed::Drop => return Ok(StatusCode::ACCEPTED.into_response()),
        },
        Err(_) => body.clone(),
    };

    let request_id = serde_json::from_slice::<Value>(&body)
        .map(|frame| request_id(&frame))
        .unwrap_or(Value::Null);

    forward(shared, endpoint, method, headers, outbound, request_id).await
}

async fn forward(
    shared: Arc<Shared>,
    endpoint: Arc<Endpoint>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    request_id: Value,
) -> std::result::Result<Response<Body>, Rejection> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let mut outbound = ForwardHeaders::new();
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = headers.get(name) {
            if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                outbound.insert(name, value);
            }
        }
    }
    outbound.extend(endpoint.headers.clone());

    debug!(endpoint = %endpoint.path, %method, "Forwarding to {}", endpoint.target);
    let response = match shared
        .client
        .request(method, &endpoint.target)
        .headers(outbound)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(endpoint = %endpoint.path, "Downstream request failed: {}", e);
            shared.log_frame(&endpoint, Direction::ServerToClient, 502, Some(e.to_string()));
            let envelope =
                ErrorEnvelope::internal(request_id, format!("downstream request failed: {e}"));
            return Ok(json_response(StatusCode::BAD_GATEWAY, envelope.to_json()));
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut reply_headers = HeaderMap::new();
    for name in FORWARDED_RESPONSE_HEADERS {
        if let Some(value) = response.headers().get(name) {
            if let Ok(value) = warp::http::HeaderValue::from_bytes(value.as_bytes()) {
                reply_headers.insert(name, value);
            }
        }
    }

    let is_event_stream = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));

    let body = if is_event_stream {
        Body::wrap_stream(event_stream(shared, endpoint, response))
    } else {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(endpoint = %endpoint.path, "Failed to read downstream response: {}", e);
                let envelope = ErrorEnvelope::internal(
                    request_id,
                    format!("failed to read downstream response: {e}"),
                );
                return Ok(json_response(StatusCode::BAD_GATEWAY, envelope.to_json()));
            }
        };
        match std::str::from_utf8(&bytes) {
            Ok(text) => match shared.process(&endpoint, Direction::ServerToClient, text).await {
                Processed::Forward(text) => Body::from(text),
                Processed::Reject { envelope, .. } => Body::from(envelope),
                Processed::Drop => Body::empty(),
            },
            Err(_) => Body::from(bytes),
        }
    };

    let mut reply = Response::new(body);
    *reply.status_mut() = status;
    *reply.headers_mut() = reply_headers;
    Ok(reply)
}

/// Re-emit a downstream event stream line by line, running each `data:` payload
/// through the chain
fn event_stream(
    shared: Arc<Shared>,
    endpoint: Arc<Endpoint>,
    response: reqwest::Response,
) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static {
    let reader = StreamReader::new(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );

    frame_reader(reader)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        .and_then(move |line| {
            let shared = shared.clone();
            let endpoint = endpoint.clone();
            async move {
                let Some(data) = line.strip_prefix("data:") else {
                    return Ok(Bytes::from(format!("{line}\n")));
                };
                let data = data.trim_start();
                let out = match shared.process(&endpoint, Direction::ServerToClient, data).await {
                    Processed::Forward(data) => format!("data: {data}\n"),
                    Processed::Reject { envelope, .. } => format!("data: {envelope}\n"),
                    Processed::Drop => String::new(),
                };
                Ok::<_, std::io::Error>(Bytes::from(out))
            }
        })
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, std::convert::Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "endpoint not found".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:?}"))
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({"error": message})),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, McpServerConfig};
    use crate::processor::ProcessorConfig;
    use std::net::SocketAddr;

    /// Downstream that echoes the request body and reports the auth header it saw
    async fn spawn_downstream() -> SocketAddr {
        let echo = warp::path!("mcp")
            .and(warp::post())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::json())
            .map(|auth: Option<String>, body: Value| {
                warp::reply::json(&json!({
                    "jsonrpc": "2.0",
                    "id": body.get("id").cloned().unwrap_or(Value::Null),
                    "result": {"auth": auth, "method": body.get("method").cloned()},
                }))
            });
        let events = warp::path!("events").and(warp::get()).map(|| {
            warp::http::Response::builder()
                .header("content-type", "text/event-stream")
                .body("event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n")
                .unwrap()
        });
        let (addr, server) = warp::serve(echo.or(events)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn config(url: String, processors: Vec<ProcessorConfig>) -> GlobalConfig {
        std::env::set_var("MCP_RELAY_HTTP_TEST_TOKEN", "secret-token");
        let mut server = McpServerConfig {
            url: Some(url),
            ..Default::default()
        };
        server.headers.insert(
            "Authorization".into(),
            "Bearer ${MCP_RELAY_HTTP_TEST_TOKEN}".into(),
        );
        let mut gateway = GatewayConfig::default();
        gateway.mcp_servers.insert("api".into(), server);
        gateway.mcp_servers.insert(
            "local".into(),
            McpServerConfig {
                command: Some("cat".into()),
                ..Default::default()
            },
        );
        let mut config = GlobalConfig {
            processors,
            ..Default::default()
        };
        config.gateways.insert("main".into(), gateway);
        config
    }

    fn script_processor(dir: &tempfile::TempDir, name: &str, body: &str) -> ProcessorConfig {
        let path = dir.path().join(format!("{name}.sh"));
        std::fs::write(&path, body).unwrap();
        ProcessorConfig::cli(name, "sh", &[path.to_str().unwrap()])
    }

    #[tokio::test]
    async fn test_endpoints_skip_stdio_servers() {
        let relay = HttpRelay::from_config(&config("http://127.0.0.1:1/mcp".into(), vec![])).unwrap();
        assert_eq!(relay.endpoints(), vec!["/mcp/main/api"]);
    }

    #[tokio::test]
    async fn test_no_gateways_is_config_error() {
        assert!(HttpRelay::from_config(&GlobalConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_missing_header_variable_fails_startup() {
        let mut config = config("http://127.0.0.1:1/mcp".into(), vec![]);
        if let Some(server) = config
            .gateways
            .get_mut("main")
            .and_then(|g| g.mcp_servers.get_mut("api"))
        {
            server
                .headers
                .insert("X-Key".into(), "${MCP_RELAY_HTTP_TEST_UNSET}".into());
        }
        assert!(HttpRelay::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_health() {
        let relay = HttpRelay::from_config(&config("http://127.0.0.1:1/mcp".into(), vec![])).unwrap();
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&relay.routes())
            .await;

        assert_eq!(response.status(), 200);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["endpoints"], json!(["/mcp/main/api"]));
    }

    #[tokio::test]
    async fn test_forwards_with_substituted_headers() {
        let addr = spawn_downstream().await;
        let relay = HttpRelay::from_config(&config(format!("http://{addr}/mcp"), vec![])).unwrap();

        let response = warp::test::request()
            .method("POST")
            .path("/mcp/main/api")
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#)
            .reply(&relay.routes())
            .await;

        assert_eq!(response.status(), 200);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["id"], 3);
        assert_eq!(body["result"]["auth"], "Bearer secret-token");
        assert_eq!(body["result"]["method"], "tools/list");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejected_request_is_not_forwarded() {
        let dir = tempfile::TempDir::new().unwrap();
        let validator = script_processor(
            &dir,
            "validator",
            "input=$(cat)\nif printf '%s' \"$input\" | grep -q delete; then\n  echo '{\"status\":403,\"payload\":{},\"error\":\"Delete operations not allowed\"}'\nelse\n  echo '{\"status\":200}'\nfi\n",
        );
        // Unreachable downstream: a forwarded request would surface as 502
        let relay =
            HttpRelay::from_config(&config("http://127.0.0.1:1/mcp".into(), vec![validator])).unwrap();

        let response = warp::test::request()
            .method("POST")
            .path("/mcp/main/api")
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","id":"d1","method":"files/delete"}"#)
            .reply(&relay.routes())
            .await;

        assert_eq!(response.status(), 403);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["id"], "d1");
        assert_eq!(body["error"]["code"], -32001);
        assert_eq!(body["error"]["data"]["rejection_reason"], "Delete operations not allowed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejected_response_is_replaced_with_envelope() {
        let addr = spawn_downstream().await;
        let dir = tempfile::TempDir::new().unwrap();
        let filter = script_processor(
            &dir,
            "response_filter",
            "input=$(cat)\nif printf '%s' \"$input\" | grep -q '\"type\":\"response\"'; then\n  echo '{\"status\":403,\"payload\":{},\"error\":\"Response withheld\"}'\nelse\n  echo '{\"status\":200}'\nfi\n",
        );
        let relay =
            HttpRelay::from_config(&config(format!("http://{addr}/mcp"), vec![filter])).unwrap();

        let response = warp::test::request()
            .method("POST")
            .path("/mcp/main/api")
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#)
            .reply(&relay.routes())
            .await;

        // Downstream status is kept; only the body is replaced
        assert_eq!(response.status(), 200);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["id"], 7);
        assert!(body.get("result").is_none());
        assert_eq!(body["error"]["code"], -32001);
        assert_eq!(body["error"]["data"]["rejection_reason"], "Response withheld");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejected_notification_is_accepted_without_body() {
        let dir = tempfile::TempDir::new().unwrap();
        let deny_all = script_processor(
            &dir,
            "deny_all",
            "cat > /dev/null\necho '{\"status\":403,\"payload\":{},\"error\":\"denied\"}'\n",
        );
        let relay =
            HttpRelay::from_config(&config("http://127.0.0.1:1/mcp".into(), vec![deny_all])).unwrap();

        let response = warp::test::request()
            .method("POST")
            .path("/mcp/main/api")
            .header("content-type", "application/json")
            .body(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .reply(&relay.routes())
            .await;

        assert_eq!(response.status(), 202);
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn test_downstream_failure_is_bad_gateway() {
        let relay = HttpRelay::from_config(&config("http://127.0.0.1:1/mcp".into(), vec![])).unwrap();

        let response = warp::test::request()
            .method("POST")
            .path("/mcp/main/api")
            .body(r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#)
            .reply(&relay.routes())
            .await;

        assert_eq!(response.status(), 502);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["id"], 4);
        assert_eq!(body["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let relay = HttpRelay::from_config(&config("http://127.0.0.1:1/mcp".into(), vec![])).unwrap();
        let response = warp::test::request()
            .method("POST")
            .path("/mcp/main/missing")
            .body("{}")
            .reply(&relay.routes())
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let relay = HttpRelay::from_config(&config("http://127.0.0.1:1/mcp".into(), vec![])).unwrap();
        let response = warp::test::request()
            .method("POST")
            .path("/mcp/main/api")
            .body(vec![b' '; MAX_BODY_BYTES + 1])
            .reply(&relay.routes())
            .await;
        assert_eq!(response.status(), 413);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_event_stream_lines_are_processed() {
        let addr = spawn_downstream().await;
        let dir = tempfile::TempDir::new().unwrap();
        let tagger = script_processor(
            &dir,
            "tagger",
            "cat > /dev/null\necho '{\"status\":200,\"payload\":{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tagged\":true}}}'\n",
        );
        let relay =
            HttpRelay::from_config(&config(format!("http://{addr}/events"), vec![tagger])).unwrap();

        let response = warp::test::request()
            .method("GET")
            .path("/mcp/main/api")
            .header("accept", "text/event-stream")
            .reply(&relay.routes())
            .await;

        assert_eq!(response.status(), 200);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("event: message\n"));
        let data = body
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .expect("event stream should carry a data line");
        let frame: Value = serde_json::from_str(data).unwrap();
        assert_eq!(frame["result"]["tagged"], true);
    }
}
