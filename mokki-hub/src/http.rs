use std::sync::Arc;

use hyper::{Method, StatusCode};
use mokki_provision::{CreateDeviceError, Link, ProvisionError, RegistryError};

use crate::Hub;

pub type HttpResult<E = std::io::Error> = Result<HttpResponse, E>;

pub type HttpResponse =
    hyper::Response<http_body_util::combinators::BoxBody<hyper::body::Bytes, std::io::Error>>;

/// Request bodies are a small JSON object, anything larger is refused.
pub const MAX_BODY_BYTES: usize = 4 * 1024;

pub async fn run_server<L: Link + 'static>(hub: Arc<Hub<L>>) -> std::io::Result<()> {
    let addr = hub.config().listen.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr}");
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::task::spawn(handle_connection(stream, hub.clone()));
            }
            Err(e) => {
                tracing::warn!("failed to accept: {e:?}");
                continue;
            }
        }
    }
}

async fn handle_connection<L: Link + 'static>(stream: tokio::net::TcpStream, hub: Arc<Hub<L>>) {
    let io = hyper_util::rt::TokioIo::new(stream);

    // http1.1, upgraded to http2 if the client asks
    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::tokio::TokioExecutor::new());
    let conn = builder.serve_connection(
        io,
        hyper::service::service_fn(|r| handle_request(r, hub.clone())),
    );

    if let Err(e) = conn.await {
        tracing::debug!("connection error: {e:?}");
    }
}

async fn handle_request<L: Link>(
    r: hyper::Request<hyper::body::Incoming>,
    hub: Arc<Hub<L>>,
) -> HttpResult {
    let method = r.method().clone();
    let path = r.uri().path().to_string();
    let body = match read_body(r.into_body()).await {
        Ok(body) => body,
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            return bytes_to_resp(
                format!("body exceeds {MAX_BODY_BYTES} bytes").into_bytes(),
                StatusCode::PAYLOAD_TOO_LARGE,
            );
        }
        Err(e) => return mokki_hub::bad_request!("failed to read body: {e}"),
    };
    route(&hub, &method, &path, &body).await
}

async fn read_body<B>(
    body: B,
) -> Result<hyper::body::Bytes, Box<dyn std::error::Error + Send + Sync>>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limited = http_body_util::Limited::new(body, MAX_BODY_BYTES);
    Ok(http_body_util::BodyExt::collect(limited).await?.to_bytes())
}

/// `POST /rooms/{room_id}/devices` provisions and records a device,
/// `GET` on the same path lists the room.
pub async fn route<L: Link>(hub: &Hub<L>, method: &Method, path: &str, body: &[u8]) -> HttpResult {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let room = match segments.as_slice() {
        ["rooms", room, "devices"] => *room,
        _ => return mokki_hub::not_found!("not found: {path}"),
    };
    let Ok(room_id) = room.parse::<u64>() else {
        return mokki_hub::bad_request!("invalid room id: {room}");
    };

    match *method {
        Method::POST => create(hub, room_id, body).await,
        Method::GET => json(hub.devices().list_room(room_id).await),
        _ => mokki_hub::not_found!("not found: {method} {path}"),
    }
}

#[derive(serde::Deserialize)]
struct NewDeviceBody {
    name: String,
}

async fn create<L: Link>(hub: &Hub<L>, room_id: u64, body: &[u8]) -> HttpResult {
    let input: NewDeviceBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return mokki_hub::bad_request!("invalid body: {e}"),
    };
    if input.name.trim().is_empty() {
        return mokki_hub::bad_request!("name must not be empty");
    }

    match hub.create_device(&input.name, room_id).await {
        Ok(record) => json_with_status(record, StatusCode::CREATED),
        Err(
            CreateDeviceError::Provisioning(ProvisionError::DeviceExists)
            | CreateDeviceError::Registry(RegistryError::Duplicate(_)),
        ) => json_with_status(
            serde_json::json!({ "error": "duplicate_device" }),
            StatusCode::CONFLICT,
        ),
        Err(CreateDeviceError::Provisioning(reason)) => json_with_status(
            serde_json::json!({ "error": reason }),
            StatusCode::UNPROCESSABLE_ENTITY,
        ),
        Err(e) => {
            tracing::error!("failed to record device: {e}");
            mokki_hub::server_error!("failed to record device")
        }
    }
}

pub fn json<T: serde::Serialize>(o: T) -> HttpResult {
    json_with_status(o, StatusCode::OK)
}

pub fn json_with_status<T: serde::Serialize>(o: T, status: StatusCode) -> HttpResult {
    let bytes = match serde_json::to_vec(&o) {
        Ok(v) => v,
        Err(e) => return server_error_(format!("failed to serialize json: {e:?}")),
    };
    let mut r = bytes_to_resp(bytes, status)?;
    r.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(r)
}

pub fn server_error_(s: String) -> HttpResult {
    bytes_to_resp(s.into_bytes(), StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn bytes_to_resp(bytes: Vec<u8>, status: StatusCode) -> HttpResult {
    use http_body_util::BodyExt;

    let mut r = hyper::Response::new(
        http_body_util::Full::new(hyper::body::Bytes::from(bytes))
            .map_err(|e| match e {})
            .boxed(),
    );
    *r.status_mut() = status;
    Ok(r)
}

pub fn not_found_(m: String) -> HttpResult {
    bytes_to_resp(m.into_bytes(), StatusCode::NOT_FOUND)
}

pub fn bad_request_(m: String) -> HttpResult {
    bytes_to_resp(m.into_bytes(), StatusCode::BAD_REQUEST)
}

#[macro_export]
macro_rules! server_error {
    ($($t:tt)*) => {{
        mokki_hub::http::server_error_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! not_found {
    ($($t:tt)*) => {{
        mokki_hub::http::not_found_(format!($($t)*))
    }};
}

#[macro_export]
macro_rules! bad_request {
    ($($t:tt)*) => {{
        mokki_hub::http::bad_request_(format!($($t)*))
    }};
}
