//! Normalizes the three shapes external services answer with (a direct
//! binary body, a streamed body, or a JSON pointer to where the result lives)
//! into a single in-memory buffer.
use crate::error::{ErrorKind, ServiceError};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound on anything we are willing to hold in memory.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Object keys providers use for their result, most specific first.
const RESULT_KEYS: [&str; 9] = [
    "output", "url", "mesh", "model_file", "glb", "image", "result", "data", "file",
];

/// How a response body should be read, going by its declared media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyShape {
    Json,
    Binary,
    /// No usable content type; the body decides.
    Undeclared,
}

fn body_shape(content_type: Option<&str>) -> BodyShape {
    let media = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or("");
    if media.is_empty() || media.eq_ignore_ascii_case("text/plain") {
        BodyShape::Undeclared
    } else if media.eq_ignore_ascii_case("application/json") || media.eq_ignore_ascii_case("text/json") {
        BodyShape::Json
    } else {
        BodyShape::Binary
    }
}

/// Parse `body` as JSON only when it plausibly is a JSON document.
fn sniff_json(body: &[u8]) -> Option<Value> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace())?;
    if !matches!(first, b'{' | b'[') {
        return None;
    }
    serde_json::from_slice(body).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadRef {
    Url(String),
    Inline(Vec<u8>),
}

pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("printforge/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

/// Find the result inside a JSON response, classifying strictly by shape:
/// a string is a URL or data URI, an array yields its first usable element,
/// an object is searched through the well-known result keys.
pub fn locate_payload(value: &Value) -> Option<PayloadRef> {
    match value {
        Value::String(s) => payload_from_str(s),
        Value::Array(items) => items.iter().find_map(locate_payload),
        Value::Object(map) => RESULT_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(locate_payload),
        _ => None,
    }
}

fn payload_from_str(s: &str) -> Option<PayloadRef> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("data:") {
        let (meta, data) = rest.split_once(',')?;
        if !meta.ends_with(";base64") {
            return None;
        }
        return STANDARD.decode(data).ok().map(PayloadRef::Inline);
    }
    if s.starts_with("http://") || s.starts_with("https://") {
        return Some(PayloadRef::Url(s.to_string()));
    }
    None
}

/// Turn a service response into bytes, following a JSON pointer if needed.
pub async fn materialize(
    http: &Client,
    service: &'static str,
    response: Response,
) -> Result<Vec<u8>, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::from_status(service, status.as_u16(), &body));
    }

    let shape = body_shape(response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()));
    if shape == BodyShape::Binary {
        return read_stream(service, response).await;
    }

    let body = read_stream(service, response).await?;
    let value = match shape {
        BodyShape::Json => serde_json::from_slice::<Value>(&body)
            .map_err(|e| ServiceError::protocol(service, format!("malformed JSON response: {}", e)))?,
        _ => match sniff_json(&body) {
            Some(value) => value,
            None => return Ok(body),
        },
    };
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        let kind = crate::error::classify_message(message).unwrap_or(ErrorKind::Protocol);
        return Err(ServiceError::new(service, kind, message.to_string()));
    }
    match locate_payload(&value) {
        Some(PayloadRef::Inline(bytes)) => Ok(bytes),
        Some(PayloadRef::Url(url)) => {
            debug!(service, %url, "following result pointer");
            download(http, service, &url).await
        }
        // an unlabelled JSON body without a pointer is the payload itself
        None if shape == BodyShape::Undeclared => Ok(body),
        None => Err(ServiceError::protocol(
            service,
            "response carried no usable result (expected URL, data URI or binary body)",
        )),
    }
}

/// Download a URL into memory, streaming the body.
pub async fn download(http: &Client, service: &'static str, url: &str) -> Result<Vec<u8>, ServiceError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| ServiceError::from_transport(service, &e))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::from_status(service, status.as_u16(), &body));
    }
    read_stream(service, response).await
}

async fn read_stream(service: &'static str, response: Response) -> Result<Vec<u8>, ServiceError> {
    let mut buf = Vec::with_capacity(response.content_length().unwrap_or(0).min(1 << 24) as usize);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ServiceError::from_transport(service, &e))?;
        if buf.len() + chunk.len() > MAX_PAYLOAD_BYTES {
            return Err(ServiceError::protocol(service, "payload exceeds size limit"));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Resolve the customer's reference photo. Remote URLs are downloaded; anything
/// else is treated as a path relative to the content directory.
pub async fn load_photo(
    http: &Client,
    content_dir: &Path,
    photo_url: &str,
) -> Result<Vec<u8>, crate::error::PipelineError> {
    use crate::error::PipelineError;

    let photo_url = photo_url.trim();
    if photo_url.is_empty() {
        return Err(PipelineError::Validation("photo reference is empty".into()));
    }
    if photo_url.starts_with("http://") || photo_url.starts_with("https://") {
        let bytes = download(http, "photo", photo_url)
            .await
            .map_err(PipelineError::Photo)?;
        if bytes.is_empty() {
            return Err(PipelineError::Validation("photo download was empty".into()));
        }
        return Ok(bytes);
    }

    let relative = photo_url.strip_prefix("file://").unwrap_or(photo_url);
    let path = content_path(content_dir, relative)
        .ok_or_else(|| PipelineError::Validation(format!("malformed photo reference: {}", photo_url)))?;
    match tokio::fs::read(&path).await {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        Ok(_) => Err(PipelineError::Validation(format!("photo {} is empty", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::Photo(
            ServiceError::new("photo", ErrorKind::NotFound, format!("{} not found", path.display())),
        )),
        Err(e) => Err(PipelineError::Io(e)),
    }
}

/// Join a reference onto the content directory, refusing anything that would
/// escape it.
pub fn content_path(content_dir: &Path, reference: &str) -> Option<PathBuf> {
    let rel = Path::new(reference.trim_start_matches('/'));
    if rel.as_os_str().is_empty() {
        return None;
    }
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(content_dir.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_shape_is_a_pointer() {
        assert_eq!(
            locate_payload(&json!("https://cdn.example/m.glb")),
            Some(PayloadRef::Url("https://cdn.example/m.glb".into()))
        );
        assert_eq!(locate_payload(&json!("queued")), None);
    }

    #[test]
    fn array_shape_takes_first_usable_element() {
        let v = json!([null, "nope", "https://cdn.example/a.png", "https://cdn.example/b.png"]);
        assert_eq!(
            locate_payload(&v),
            Some(PayloadRef::Url("https://cdn.example/a.png".into()))
        );
    }

    #[test]
    fn object_shape_searches_result_keys() {
        let v = json!({"id": "abc", "status": "succeeded", "output": {"mesh": "https://cdn.example/x.glb"}});
        assert_eq!(
            locate_payload(&v),
            Some(PayloadRef::Url("https://cdn.example/x.glb".into()))
        );
        assert_eq!(locate_payload(&json!({"status": "failed"})), None);
    }

    #[test]
    fn data_uri_is_decoded_inline() {
        let encoded = STANDARD.encode(b"hello mesh");
        let v = json!({ "data": format!("data:model/gltf-binary;base64,{}", encoded) });
        assert_eq!(locate_payload(&v), Some(PayloadRef::Inline(b"hello mesh".to_vec())));
        assert_eq!(locate_payload(&json!("data:text/plain,hello")), None);
    }

    #[test]
    fn media_type_parameters_are_ignored() {
        assert_eq!(body_shape(Some("application/json")), BodyShape::Json);
        assert_eq!(body_shape(Some("application/json; charset=utf-8")), BodyShape::Json);
        assert_eq!(body_shape(Some("Application/JSON;charset=UTF-8")), BodyShape::Json);
        assert_eq!(body_shape(Some("image/png")), BodyShape::Binary);
        assert_eq!(body_shape(Some("model/gltf-binary")), BodyShape::Binary);
        assert_eq!(body_shape(Some("text/plain; charset=utf-8")), BodyShape::Undeclared);
        assert_eq!(body_shape(Some("")), BodyShape::Undeclared);
        assert_eq!(body_shape(None), BodyShape::Undeclared);
    }

    #[test]
    fn only_json_looking_bodies_are_sniffed() {
        assert!(sniff_json(b"  {\"output\": \"https://cdn.example/a.png\"}").is_some());
        assert!(sniff_json(b"[1, 2]").is_some());
        assert!(sniff_json(b"\x89PNG\r\n").is_none());
        assert!(sniff_json(b"{ not json").is_none());
        assert!(sniff_json(b"").is_none());
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn pointer_is_followed_whatever_the_json_labelling() {
        use axum::body::Body;
        use axum::http::header;
        use axum::routing::get;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let pointer = json!({ "output": format!("{}/files/cutout.png", base) }).to_string();
        let with_charset = pointer.clone();
        let unlabelled = pointer.clone();
        let router = axum::Router::new()
            .route(
                "/charset",
                get(move || {
                    let body = with_charset.clone();
                    async move { ([(header::CONTENT_TYPE, "application/json; charset=utf-8")], body) }
                }),
            )
            .route(
                "/unlabelled",
                get(move || {
                    let body = unlabelled.clone();
                    async move { Body::from(body) }
                }),
            )
            .route("/raw", get(|| async { Body::from(vec![0x89u8, b'P', b'N', b'G', 1, 2, 3]) }))
            .route(
                "/files/cutout.png",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![9u8; 4096]) }),
            );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let http = build_http_client(Duration::from_secs(5)).unwrap();
        for route in ["charset", "unlabelled"] {
            let response = http.get(format!("{}/{}", base, route)).send().await.unwrap();
            let bytes = materialize(&http, "cutout", response).await.unwrap();
            assert_eq!(bytes, vec![9u8; 4096], "route {}", route);
        }

        let response = http.get(format!("{}/raw", base)).send().await.unwrap();
        let bytes = materialize(&http, "cutout", response).await.unwrap();
        assert_eq!(bytes, vec![0x89u8, b'P', b'N', b'G', 1, 2, 3]);
    }

    #[tokio::test]
    async fn labelled_json_without_result_is_a_protocol_failure() {
        use axum::http::header;
        use axum::routing::get;

        let base = serve(axum::Router::new().route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "application/json; charset=utf-8")], "{\"status\": \"queued\"}") }),
        ))
        .await;
        let http = build_http_client(Duration::from_secs(5)).unwrap();
        let response = http.get(&base).send().await.unwrap();
        let err = materialize(&http, "cutout", response).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn content_path_rejects_traversal() {
        let root = Path::new("/srv/content");
        assert_eq!(
            content_path(root, "/uploads/a.jpg"),
            Some(PathBuf::from("/srv/content/uploads/a.jpg"))
        );
        assert!(content_path(root, "../etc/passwd").is_none());
        assert!(content_path(root, "uploads/../../x").is_none());
        assert!(content_path(root, "").is_none());
    }

    #[tokio::test]
    async fn load_photo_reads_local_reference() {
        let td = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(td.path().join("uploads")).await.unwrap();
        tokio::fs::write(td.path().join("uploads/p.jpg"), b"jpeg").await.unwrap();
        let http = build_http_client(Duration::from_secs(1)).unwrap();

        let bytes = load_photo(&http, td.path(), "/uploads/p.jpg").await.unwrap();
        assert_eq!(bytes, b"jpeg");

        let err = load_photo(&http, td.path(), "/uploads/missing.jpg").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = load_photo(&http, td.path(), "  ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
