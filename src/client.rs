use crate::profile::BrowsingProfile;
use crate::task::{Task, TaskResponse};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum TaskClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("undecodable task payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unusable task: {0}")]
    InvalidTask(String),
    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),
}

/// Source of labeling tasks. Single attempt per call; retries are the
/// caller's business.
#[async_trait(?Send)]
pub trait TaskProvider {
    /// `Ok(None)` means the provider legitimately has nothing to show.
    async fn request_task(
        &self,
        session_id: &str,
        profile: &BrowsingProfile,
    ) -> Result<Option<Task>, TaskClientError>;

    async fn submit_response(&self, response: &TaskResponse) -> Result<(), TaskClientError>;

    async fn health(&self) -> Result<(), TaskClientError>;
}

/// HTTP task provider client.
#[derive(Clone)]
pub struct HttpTaskClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpTaskClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, TaskClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: with_trailing_slash(base_url),
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, TaskClientError> {
        Ok(self.base_url.join(path)?)
    }
}

// `Url::join` drops the last path segment unless the base ends in `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn check_status(status: StatusCode, url: &Url) -> Result<(), TaskClientError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TaskClientError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

#[async_trait(?Send)]
impl TaskProvider for HttpTaskClient {
    async fn request_task(
        &self,
        session_id: &str,
        profile: &BrowsingProfile,
    ) -> Result<Option<Task>, TaskClientError> {
        let mut url = self.endpoint("tasks/request")?;
        url.query_pairs_mut().append_pair("session_id", session_id);
        let resp = self.client.post(url.clone()).json(profile).send().await?;
        let status = resp.status();
        check_status(status, &url)?;
        if status == StatusCode::NO_CONTENT {
            debug!("provider has no task (204)");
            return Ok(None);
        }
        let bytes = resp.bytes().await?;
        parse_task_payload(&bytes)
    }

    async fn submit_response(&self, response: &TaskResponse) -> Result<(), TaskClientError> {
        let url = self.endpoint("responses/")?;
        let resp = self.client.post(url.clone()).json(response).send().await?;
        check_status(resp.status(), &url)?;
        debug!(task_id = %response.task_id, "response accepted");
        Ok(())
    }

    async fn health(&self) -> Result<(), TaskClientError> {
        let url = self.endpoint("health")?;
        let resp = self.client.get(url.clone()).send().await?;
        check_status(resp.status(), &url)
    }
}

/// Decodes a task request body. Blank bodies, `null` and `{}` are the
/// provider's way of saying it has nothing to offer.
pub fn parse_task_payload(bytes: &[u8]) -> Result<Option<Task>, TaskClientError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(bytes)?;
    match &value {
        Value::Null => return Ok(None),
        Value::Object(map) if map.is_empty() => return Ok(None),
        _ => {}
    }
    // Decoded from the raw bytes rather than `value` so choice order survives.
    let task: Task = serde_json::from_slice(bytes)?;
    if let Some(defect) = task.defect() {
        return Err(TaskClientError::InvalidTask(defect.to_string()));
    }
    Ok(Some(task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ClientEnvironment, ClientInfo};
    use crate::task::TaskCategory;
    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockProvider {
        reply: Arc<Mutex<Option<(u16, String)>>>,
        seen_sessions: Arc<Mutex<Vec<String>>>,
        responses: Arc<Mutex<Vec<Value>>>,
    }

    async fn request_task(
        State(mock): State<MockProvider>,
        Query(query): Query<HashMap<String, String>>,
        Json(_profile): Json<Value>,
    ) -> Response {
        if let Some(session) = query.get("session_id") {
            mock.seen_sessions.lock().unwrap().push(session.clone());
        }
        let (status, body) = mock
            .reply
            .lock()
            .unwrap()
            .clone()
            .unwrap_or((204, String::new()));
        (AxumStatus::from_u16(status).unwrap(), body).into_response()
    }

    async fn responses(State(mock): State<MockProvider>, Json(body): Json<Value>) -> AxumStatus {
        mock.responses.lock().unwrap().push(body);
        AxumStatus::CREATED
    }

    async fn spawn_mock(mock: MockProvider) -> Url {
        let app = Router::new()
            .route("/v1/health", get(|| async { Json(json!({"status": "ok"})) }))
            .route("/v1/tasks/request", post(request_task))
            .route("/v1/responses/", post(responses))
            .with_state(mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/v1")).unwrap()
    }

    fn client(base: Url) -> HttpTaskClient {
        HttpTaskClient::new(base, Duration::from_secs(5)).unwrap()
    }

    fn profile() -> BrowsingProfile {
        let doc = crate::document::HostDocument::parse("<p></p>");
        BrowsingProfile::collect(&doc, &ClientEnvironment::default())
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let client = client(Url::parse("https://api.hotlabel.ai/v1").unwrap());
        assert_eq!(
            client.endpoint("tasks/request").unwrap().as_str(),
            "https://api.hotlabel.ai/v1/tasks/request"
        );
    }

    #[test]
    fn empty_payloads_mean_no_task() {
        for body in ["", "  \n", "null", "{}"] {
            assert!(parse_task_payload(body.as_bytes()).unwrap().is_none(), "{body:?}");
        }
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            parse_task_payload(b"<html>"),
            Err(TaskClientError::Decode(_))
        ));
        assert!(matches!(
            parse_task_payload(br#"{"task_id":"t","category":"text","prompt":"","choices":{"a":"x"}}"#),
            Err(TaskClientError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn fetches_task_and_sends_session_id() {
        let mock = MockProvider::default();
        *mock.reply.lock().unwrap() = Some((
            200,
            json!({
                "task_id": "t-42",
                "category": "vqa",
                "prompt": "How many?",
                "image_url": "https://img.example/1.png",
                "choices": {"a": "One", "b": "Two"}
            })
            .to_string(),
        ));
        let client = client(spawn_mock(mock.clone()).await);

        let task = client.request_task("sess-1", &profile()).await.unwrap().unwrap();
        assert_eq!(task.task_id, "t-42");
        assert_eq!(task.category, TaskCategory::Vqa);
        assert_eq!(task.choices.len(), 2);
        assert_eq!(mock.seen_sessions.lock().unwrap().as_slice(), ["sess-1"]);
    }

    #[tokio::test]
    async fn no_content_is_empty_and_server_error_is_status() {
        let mock = MockProvider::default();
        let client = client(spawn_mock(mock.clone()).await);
        assert!(client.request_task("s", &profile()).await.unwrap().is_none());

        *mock.reply.lock().unwrap() = Some((503, "busy".into()));
        let err = client.request_task("s", &profile()).await.unwrap_err();
        assert!(matches!(err, TaskClientError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn submits_responses_and_probes_health() {
        let mock = MockProvider::default();
        let client = client(spawn_mock(mock.clone()).await);
        client.health().await.unwrap();

        let response = TaskResponse {
            task_id: "t-1".into(),
            session_id: "s-1".into(),
            user_id: "u-1".into(),
            publisher_id: "pub-1".into(),
            category: TaskCategory::Image,
            selected_choice: "a".into(),
            response_time_ms: 1200,
            client_info: ClientInfo {
                browser: crate::profile::BrowserFamily::Firefox,
                device: crate::profile::DeviceClass::Desktop,
            },
            submitted_at: "2024-01-01T00:00:00Z".into(),
        };
        client.submit_response(&response).await.unwrap();
        let seen = mock.responses.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["selected_choice"], "a");
        assert_eq!(seen[0]["client_info"]["browser"], "firefox");
    }

    #[tokio::test]
    async fn unreachable_provider_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client(Url::parse(&format!("http://{addr}/v1")).unwrap());
        assert!(matches!(
            client.health().await,
            Err(TaskClientError::Transport(_))
        ));
    }
}
