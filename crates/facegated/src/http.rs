use crate::service::{AccessService, ServiceError};
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facegate_core::{Decision, Score};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

type ApiResult<T> = Result<T, ApiError>;

/// Build the HTTP surface over `service`.
pub fn router(service: Arc<AccessService>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/known", get(list_known))
        .route("/known/{name}", get(get_known))
        .route("/register", post(register))
        .route("/recognize", post(recognize))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Error body `{"error": code}` with a matching status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    BadRequest(&'static str),
    NotFound,
    PayloadTooLarge,
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(code) => *code,
            ApiError::NotFound => "not_found",
            ApiError::PayloadTooLarge => "payload_too_large",
            ApiError::Internal => "internal",
        }
    }

    fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest("invalid_request")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.code() }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::InvalidImage(_) => ApiError::BadRequest("invalid_image"),
            ServiceError::NoFaceDetected => ApiError::BadRequest("no_face_detected"),
            ServiceError::InvalidName(_) => ApiError::BadRequest("invalid_name"),
            ServiceError::NotFound(_) => ApiError::NotFound,
            e @ (ServiceError::Registry(_) | ServiceError::Join(_)) => {
                tracing::error!(error = %e, "request failed");
                ApiError::Internal
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        tracing::debug!(error = %e, "malformed multipart body");
        ApiError::from_status(e.status())
    }
}

impl From<BytesRejection> for ApiError {
    fn from(e: BytesRejection) -> Self {
        tracing::debug!(error = %e, "unreadable request body");
        ApiError::from_status(e.status())
    }
}

/// Wire form of a [`Decision`]. The score key names the metric in use.
#[derive(Debug, Serialize)]
struct DecisionBody {
    authorized: bool,
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

impl From<Decision> for DecisionBody {
    fn from(decision: Decision) -> Self {
        let (score, distance) = match decision.score {
            Some(Score::Similarity(s)) => (Some(s), None),
            Some(Score::Distance(d)) => (None, Some(d)),
            None => (None, None),
        };
        Self {
            authorized: decision.authorized,
            name: decision.name,
            score,
            distance,
            reason: decision.reason.map(|r| r.code()),
        }
    }
}

async fn health(State(service): State<Arc<AccessService>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "known": service.known().len(),
        "metric": service.matching().metric.to_string(),
    }))
}

async fn list_known(State(service): State<Arc<AccessService>>) -> Json<serde_json::Value> {
    Json(json!({ "known": service.known() }))
}

async fn get_known(
    State(service): State<Arc<AccessService>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let image = service.reference_image(name).await?;
    tracing::debug!(path = %image.path.display(), "serving reference image");
    Ok(([(header::CONTENT_TYPE, image.content_type())], image.bytes).into_response())
}

async fn register(
    State(service): State<Arc<AccessService>>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut name = None;
    let mut image = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("name") => name = Some(field.text().await?),
            Some("image") => image = Some(field.bytes().await?),
            _ => {}
        }
    }

    let (Some(name), Some(image)) = (
        name.filter(|n| !n.trim().is_empty()),
        image.filter(|i| !i.is_empty()),
    ) else {
        return Err(ApiError::BadRequest("name_and_image_required"));
    };

    let name = service.register(name, image.to_vec()).await?;
    Ok(Json(json!({ "status": "ok", "name": name })))
}

#[derive(Debug, Default, Deserialize)]
struct RecognizeParams {
    action: Option<String>,
}

/// Accepts either the raw image as the request body (action tag from the
/// `action` query parameter) or a multipart form with `image` and `action`.
async fn recognize(
    State(service): State<Arc<AccessService>>,
    Query(params): Query<RecognizeParams>,
    request: Request,
) -> ApiResult<Json<DecisionBody>> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let (image, action) = if is_multipart {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|_| ApiError::BadRequest("invalid_request"))?;
        let mut image = None;
        let mut action = params.action;
        while let Some(field) = multipart.next_field().await? {
            let field_name = field.name().map(str::to_string);
            match field_name.as_deref() {
                Some("image") => image = Some(field.bytes().await?),
                Some("action") => action = Some(field.text().await?),
                _ => {}
            }
        }
        (image, action)
    } else {
        let body = Bytes::from_request(request, &()).await?;
        (Some(body), params.action)
    };

    let image = image
        .filter(|i| !i.is_empty())
        .ok_or(ApiError::BadRequest("image_required"))?;
    let action = action.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());

    let decision = service.recognize(image.to_vec(), action).await?;
    Ok(Json(decision.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{fixture, Fixture, BLUE, GREEN, RED};
    use axum::body::Body;
    use axum::http::Request;
    use facegate_core::testing;
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "facegate-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a [u8]),
    }

    fn multipart(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    let header = format!("Content-Disposition: form-data; name=\"{name}\"");
                    body.extend_from_slice(format!("{header}\r\n\r\n{value}\r\n").as_bytes());
                }
                Part::File(name, bytes) => {
                    let header = format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"face.png\""
                    );
                    body.extend_from_slice(
                        format!("{header}\r\nContent-Type: image/png\r\n\r\n").as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(multipart(parts)))
            .unwrap()
    }

    fn raw_request(uri: &str, bytes: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(bytes))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(fx: &Fixture, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let app = router(Arc::clone(&fx.service), 10 * 1024 * 1024);
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(fx: &Fixture, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(fx, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        testing::encode_png(&testing::face_image(color))
    }

    #[tokio::test]
    async fn test_known_lists_names() {
        let fx = fixture(&[("alice.png", RED), ("bob.png", GREEN)]);
        let (status, body) = send_json(&fx, get_request("/known")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "known": ["alice", "bob"] }));
    }

    #[tokio::test]
    async fn test_health() {
        let fx = fixture(&[("alice.png", RED)]);
        let (status, body) = send_json(&fx, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "known": 1, "metric": "cosine" }));
    }

    #[tokio::test]
    async fn test_get_known_serves_reference_image() {
        let fx = fixture(&[("alice.png", RED)]);

        let app = router(Arc::clone(&fx.service), 1024 * 1024);
        let response = app.oneshot(get_request("/known/alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], std::fs::read(fx.known_dir().join("alice.png")).unwrap());

        let (status, body) = send_json(&fx, get_request("/known/mallory")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "not_found" }));
    }

    #[tokio::test]
    async fn test_register_and_recognize_raw_body() {
        let fx = fixture(&[]);
        let image = png(GREEN);

        let (status, body) = send_json(
            &fx,
            multipart_request(
                "/register",
                &[Part::Text("name", "carol smith"), Part::File("image", &image)],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "name": "carol_smith" }));

        let (status, body) = send_json(&fx, raw_request("/recognize", image)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], json!(true));
        assert_eq!(body["name"], json!("carol_smith"));
        assert!(body["score"].as_f64().unwrap() > 0.99);
        assert!(body.get("reason").is_none());
    }

    #[tokio::test]
    async fn test_register_validation() {
        let fx = fixture(&[]);
        let image = png(RED);
        let blank = testing::encode_png(&testing::blank_image());
        let long_name = "x".repeat(300);

        let cases: Vec<(Vec<Part<'_>>, &str)> = vec![
            (vec![Part::File("image", &image)], "name_and_image_required"),
            (vec![Part::Text("name", "alice")], "name_and_image_required"),
            (
                vec![Part::Text("name", "  "), Part::File("image", &image)],
                "name_and_image_required",
            ),
            (vec![Part::Text("name", "a/b"), Part::File("image", &image)], "invalid_name"),
            (
                vec![Part::Text("name", &long_name), Part::File("image", &image)],
                "invalid_name",
            ),
            (vec![Part::Text("name", "alice"), Part::File("image", &blank)], "no_face_detected"),
        ];
        for (parts, code) in cases {
            let (status, body) = send_json(&fx, multipart_request("/register", &parts)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{code}");
            assert_eq!(body, json!({ "error": code }));
        }
        assert_eq!(std::fs::read_dir(fx.known_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_recognize_denials_are_ok_responses() {
        let fx = fixture(&[]);
        let (status, body) = send_json(&fx, raw_request("/recognize", png(RED))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "authorized": false, "name": null, "reason": "no_known_faces" }));

        let fx = fixture(&[("alice.png", RED)]);
        let blank = testing::encode_png(&testing::blank_image());
        let (status, body) = send_json(&fx, raw_request("/recognize", blank)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "authorized": false, "name": null, "reason": "no_face" }));

        let (status, body) = send_json(&fx, raw_request("/recognize", png(GREEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], json!(false));
        assert_eq!(body["reason"], json!("not_matched"));
        assert!(body["score"].is_number());
    }

    #[tokio::test]
    async fn test_recognize_multipart_with_action() {
        let fx = fixture(&[("alice.png", RED)]);
        let image = png(RED);

        let (status, body) = send_json(
            &fx,
            multipart_request(
                "/recognize",
                &[Part::File("image", &image), Part::Text("action", "garage")],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], json!("alice"));

        let logged: Vec<String> = std::fs::read_dir(fx.log_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(logged.iter().all(|f| f.starts_with("garage_")), "{logged:?}");
    }

    #[tokio::test]
    async fn test_recognize_action_query_cannot_write_outside_log_dir() {
        let fx = fixture(&[("alice.png", RED)]);

        let (status, body) =
            send_json(&fx, raw_request("/recognize?action=../known/x", png(BLUE))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"], json!("not_matched"));

        let known: Vec<String> = std::fs::read_dir(fx.known_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(known, vec!["alice.png"]);
        assert_eq!(std::fs::read_dir(fx.dir.path()).unwrap().count(), 2);
        assert_eq!(std::fs::read_dir(fx.log_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_recognize_rejects_bad_input() {
        let fx = fixture(&[("alice.png", RED)]);

        let (status, body) =
            send_json(&fx, raw_request("/recognize", b"not an image".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "invalid_image" }));

        let (status, body) =
            send_json(&fx, multipart_request("/recognize", &[Part::Text("action", "door")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "image_required" }));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let fx = fixture(&[]);
        let app = router(Arc::clone(&fx.service), 1024);
        let request = Request::builder()
            .method("POST")
            .uri("/recognize")
            .header(header::CONTENT_LENGTH, 4096)
            .body(Body::from(vec![0u8; 4096]))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
