//! HTTP routes over the Hearth services.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hearth_core::{ConversationLine, Draft, Hearth, SubmissionOutcome, Thread};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

const FALLBACK_HEADER: &str = "x-hearth-moderation-fallback";

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %e, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateThreadRequest {
    family_id: String,
    subject: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitMessageRequest {
    family_id: String,
    sender_id: String,
    body: String,
    #[serde(default)]
    attachment_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediationRequest {
    identity: String,
    messages: Vec<ConversationLine>,
}

pub fn build_router(hearth: Hearth) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/threads", post(create_thread))
        .route(
            "/api/v1/threads/:thread_id/messages",
            get(thread_messages).post(submit_message),
        )
        .route("/api/v1/threads/:thread_id/verify", get(verify_thread))
        .route("/api/v1/families/:family_id/messages", get(family_messages))
        .route("/api/v1/mediation", post(mediation))
        .with_state(hearth)
        .layer(axum::middleware::from_fn(log_requests))
}

async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics(State(hearth): State<Hearth>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        hearth.metrics.render(),
    )
}

async fn create_thread(
    State(hearth): State<Hearth>,
    Json(req): Json<CreateThreadRequest>,
) -> Result<Json<Thread>, ApiError> {
    if req.family_id.trim().is_empty() || req.subject.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "familyId and subject are required",
        ));
    }
    let thread = hearth
        .store
        .find_or_create_thread(req.family_id.trim(), &req.subject)
        .await
        .map_err(internal)?;
    Ok(Json(thread))
}

async fn load_thread(hearth: &Hearth, thread_id: &str) -> Result<Thread, ApiError> {
    hearth
        .store
        .thread(thread_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("thread not found: {}", thread_id)))
}

async fn submit_message(
    State(hearth): State<Hearth>,
    Path(thread_id): Path<String>,
    Json(req): Json<SubmitMessageRequest>,
) -> Result<Response, ApiError> {
    let family_id = req.family_id.trim().to_string();
    let thread = load_thread(&hearth, &thread_id).await?;
    if thread.family_id != family_id {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "thread belongs to a different family",
        ));
    }

    let draft = Draft {
        thread_id,
        family_id,
        sender_id: req.sender_id,
        body: req.body,
        attachment_ids: req.attachment_ids,
    };
    let outcome = hearth.workflow.submit(draft).await.map_err(internal)?;

    let status = match &outcome {
        SubmissionOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SubmissionOutcome::Blocked { .. } | SubmissionOutcome::Sent { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn thread_messages(
    State(hearth): State<Hearth>,
    Path(thread_id): Path<String>,
) -> Result<Response, ApiError> {
    load_thread(&hearth, &thread_id).await?;
    let messages = hearth
        .store
        .messages_by_thread(&thread_id)
        .await
        .map_err(internal)?;
    Ok(Json(messages).into_response())
}

async fn verify_thread(
    State(hearth): State<Hearth>,
    Path(thread_id): Path<String>,
) -> Result<Response, ApiError> {
    load_thread(&hearth, &thread_id).await?;
    let report = hearth
        .chain
        .verify_thread(&thread_id)
        .await
        .map_err(internal)?;
    Ok(Json(report).into_response())
}

async fn family_messages(
    State(hearth): State<Hearth>,
    Path(family_id): Path<String>,
) -> Result<Response, ApiError> {
    let messages = hearth
        .store
        .messages_by_family(&family_id)
        .await
        .map_err(internal)?;
    Ok(Json(messages).into_response())
}

async fn mediation(
    State(hearth): State<Hearth>,
    Json(req): Json<MediationRequest>,
) -> Response {
    let advice = hearth.mediation.advise(&req.identity, &req.messages).await;
    let mut response = Json(advice.value).into_response();
    if let Some(reason) = advice.fallback {
        response
            .headers_mut()
            .insert(FALLBACK_HEADER, HeaderValue::from_static(reason.label()));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::moderation::{
        ClassifierClient, ClassifierError, ClassifierReply, ClassifierRequest,
    };
    use hearth_core::{MemoryMessageStore, ModerationConfig};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Hostile iff the text contains "!!!".
    struct Bangs;

    #[async_trait::async_trait]
    impl ClassifierClient for Bangs {
        fn model(&self) -> &str {
            "bangs"
        }

        async fn complete(&self, request: &ClassifierRequest) -> Result<ClassifierReply, ClassifierError> {
            let content = if request.operation == "mediation" {
                r#"{"conflictLevel": "low", "deescalationTips": ["a", "b", "c"]}"#
            } else if request.user.contains("!!!") {
                r#"{"isHostile": true, "indicators": ["shouting"], "neutralRewrite": "Please call me."}"#
            } else {
                r#"{"isHostile": false}"#
            };
            Ok(ClassifierReply {
                content: content.to_string(),
                usage: None,
            })
        }
    }

    struct Down;

    #[async_trait::async_trait]
    impl ClassifierClient for Down {
        fn model(&self) -> &str {
            "down"
        }

        async fn complete(&self, _request: &ClassifierRequest) -> Result<ClassifierReply, ClassifierError> {
            Err(ClassifierError::Transport("connection refused".to_string()))
        }
    }

    fn app_with(client: Arc<dyn ClassifierClient>) -> Router {
        let hearth = Hearth::assemble(
            &ModerationConfig::default(),
            Arc::new(MemoryMessageStore::new()),
            client,
        )
        .unwrap();
        build_router(hearth)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Response) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_thread(app: &Router) -> String {
        let (status, response) = send(
            app,
            "POST",
            "/api/v1/threads",
            Some(json!({"familyId": "fam-1", "subject": "Pickups"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        json_body(response).await["id"].as_str().unwrap().to_string()
    }

    fn message(body: &str) -> Value {
        json!({"familyId": "fam-1", "senderId": "parent-a", "body": body})
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app_with(Arc::new(Bangs));
        let (status, _) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn send_then_list_then_verify() {
        let app = app_with(Arc::new(Bangs));
        let thread = create_thread(&app).await;
        let uri = format!("/api/v1/threads/{}/messages", thread);

        let (status, response) = send(&app, "POST", &uri, Some(message("Pickup at 5?"))).await;
        assert_eq!(status, StatusCode::OK);
        let v = json_body(response).await;
        assert_eq!(v["status"], "sent");
        assert_eq!(v["message"]["chainIndex"], 0);

        let (_, response) = send(&app, "GET", &uri, None).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

        let (_, response) = send(&app, "GET", &format!("/api/v1/threads/{}/verify", thread), None).await;
        let report = json_body(response).await;
        assert_eq!(report["valid"], true);
        assert_eq!(report["length"], 1);

        let (_, response) = send(&app, "GET", "/api/v1/families/fam-1/messages", None).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hostile_is_200_blocked_and_empty_is_422() {
        let app = app_with(Arc::new(Bangs));
        let thread = create_thread(&app).await;
        let uri = format!("/api/v1/threads/{}/messages", thread);

        let (status, response) = send(&app, "POST", &uri, Some(message("Answer me!!!"))).await;
        assert_eq!(status, StatusCode::OK);
        let v = json_body(response).await;
        assert_eq!(v["status"], "blocked");
        assert_eq!(v["neutralRewrite"], "Please call me.");

        let (status, response) = send(&app, "POST", &uri, Some(message("   "))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let v = json_body(response).await;
        assert_eq!(v["status"], "rejected");
        assert_eq!(v["reason"]["code"], "empty");
    }

    #[tokio::test]
    async fn unknown_thread_is_404_and_wrong_family_is_403() {
        let app = app_with(Arc::new(Bangs));
        let (status, _) = send(&app, "POST", "/api/v1/threads/nope/messages", Some(message("hi"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let thread = create_thread(&app).await;
        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/v1/threads/{}/messages", thread),
            Some(json!({"familyId": "fam-2", "senderId": "x", "body": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn padded_family_id_matches_its_own_thread() {
        let app = app_with(Arc::new(Bangs));
        let (_, response) = send(
            &app,
            "POST",
            "/api/v1/threads",
            Some(json!({"familyId": " fam-1 ", "subject": "Pickups"})),
        )
        .await;
        let thread = json_body(response).await["id"].as_str().unwrap().to_string();

        let (status, response) = send(
            &app,
            "POST",
            &format!("/api/v1/threads/{}/messages", thread),
            Some(json!({"familyId": " fam-1", "senderId": "parent-a", "body": "Pickup at 5?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await["message"]["familyId"], "fam-1");
    }

    #[tokio::test]
    async fn mediation_reports_fallback_in_header() {
        let app = app_with(Arc::new(Down));
        let body = json!({
            "identity": "parent-a",
            "messages": [{"senderId": "parent-a", "body": "Who has the kids for Thanksgiving?"}]
        });
        let (status, response) = send(&app, "POST", "/api/v1/mediation", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.headers()[FALLBACK_HEADER], "transport");
        let v = json_body(response).await;
        assert_eq!(v["conflictLevel"], "low");
        assert_eq!(v["deescalationTips"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn metrics_expose_moderation_counters() {
        let app = app_with(Arc::new(Down));
        let thread = create_thread(&app).await;
        send(
            &app,
            "POST",
            &format!("/api/v1/threads/{}/messages", thread),
            Some(message("See you at 6")),
        )
        .await;

        let (status, response) = send(&app, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("hearth_moderation_errors_total"));
    }
}
