use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::core::config::ServerConfig;
use crate::core::model::{remote_id, BatchResults, ExecuteAck, LogEntry, Task, TaskDraft, TaskOrder, TaskPatch};
use crate::remote::{RemoteError, TaskBackend};

/// JSON-over-HTTP client for the dashboard API. The session is carried by
/// the configured cookie; every call is bounded by the configured timeout.
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(cfg: &ServerConfig) -> Result<Self, RemoteError> {
        let base = base_url(&cfg.base_url)?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client, base, headers: Self::build_headers(cfg)?, timeout: cfg.timeout() })
    }

    fn build_headers(cfg: &ServerConfig) -> Result<HeaderMap, RemoteError> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| RemoteError::Malformed(format!("invalid header value: {}", e));
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&cfg.user_agent).map_err(invalid)?);
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(cookie) = &cfg.cookie {
            h.insert(COOKIE, HeaderValue::from_str(cookie).map_err(invalid)?);
        }
        Ok(h)
    }

    /// `path` is relative, so a reverse-proxy prefix in the base URL survives.
    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base.join(path)?)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, RemoteError> {
        let url = self.endpoint(path)?;
        debug!(%url, "GET");
        let resp = self.client
            .get(url)
            .headers(self.headers.clone())
            .query(query)
            .timeout(self.timeout)
            .send()
            .await?;
        read_envelope(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, RemoteError> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        let resp = self.client
            .post(url)
            .headers(self.headers.clone())
            .json(body)
            .timeout(self.timeout)
            .send()
            .await?;
        read_envelope(resp).await
    }
}

fn base_url(raw: &str) -> Result<Url, RemoteError> {
    let mut base = Url::parse(raw)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

async fn read_envelope(resp: reqwest::Response) -> Result<Value, RemoteError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(RemoteError::Status(status));
    }

    let is_html = resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false);
    if is_html {
        return Err(RemoteError::SessionExpired);
    }

    let body = resp.bytes().await?;
    let value: Value = serde_json::from_slice(&body).map_err(|e| RemoteError::Malformed(e.to_string()))?;
    check_success(value)
}

pub(crate) fn check_success(envelope: Value) -> Result<Value, RemoteError> {
    match envelope.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(envelope),
        _ => Err(RemoteError::Rejected(message_of(&envelope).unwrap_or_else(|| "request failed".to_string()))),
    }
}

fn message_of(envelope: &Value) -> Option<String> {
    envelope.get("message").and_then(Value::as_str).map(str::to_string)
}

/// Payloads sit either at the top level or under `data`, depending on the
/// server build.
pub(crate) fn payload<T: DeserializeOwned>(envelope: &Value, key: &str) -> Result<T, RemoteError> {
    let raw = envelope
        .get(key)
        .or_else(|| envelope.get("data").and_then(|d| d.get(key)))
        .ok_or_else(|| RemoteError::Malformed(format!("missing `{}`", key)))?;
    serde_json::from_value(raw.clone()).map_err(|e| RemoteError::Malformed(format!("`{}`: {}", key, e)))
}

fn remote_ids(orders: &[TaskOrder]) -> Vec<u32> {
    orders.iter().copied().map(remote_id).collect()
}

#[async_trait]
impl TaskBackend for HttpBackend {
    fn name(&self) -> &'static str { "http-backend" }

    async fn fetch_task_snapshot(&self) -> Result<Vec<Task>, RemoteError> {
        let env = self.get("api/tasks", &[]).await?;
        payload(&env, "tasks")
    }

    async fn fetch_recent_logs(&self, limit: u32) -> Result<Vec<LogEntry>, RemoteError> {
        let env = self.get("api/logs", &[("limit", limit.to_string())]).await?;
        payload(&env, "logs")
    }

    async fn execute_task(&self, order: TaskOrder) -> Result<ExecuteAck, RemoteError> {
        let env = self.post("api/task/execute", &json!({ "task_id": remote_id(order) })).await?;
        Ok(ExecuteAck {
            message: message_of(&env),
            transferred_files: payload(&env, "transferred_files").unwrap_or_default(),
        })
    }

    async fn execute_batch(&self, orders: &[TaskOrder]) -> Result<BatchResults, RemoteError> {
        let env = self.post("api/tasks/execute-all", &json!({ "task_ids": remote_ids(orders) })).await?;
        let mut results: BatchResults = payload(&env, "results")?;
        results.message = message_of(&env);
        Ok(results)
    }

    async fn add_task(&self, draft: &TaskDraft) -> Result<(), RemoteError> {
        let body = serde_json::to_value(draft).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        self.post("api/task/add", &body).await.map(|_| ())
    }

    async fn update_task(&self, order: TaskOrder, patch: &TaskPatch) -> Result<(), RemoteError> {
        let mut body = serde_json::to_value(patch).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("task_id".to_string(), json!(remote_id(order)));
        }
        self.post("api/task/update", &body).await.map(|_| ())
    }

    async fn delete_task(&self, order: TaskOrder) -> Result<(), RemoteError> {
        self.post("api/task/delete", &json!({ "task_id": remote_id(order) })).await.map(|_| ())
    }

    async fn delete_batch(&self, orders: &[TaskOrder]) -> Result<(), RemoteError> {
        self.post("api/tasks/batch-delete", &json!({ "task_ids": remote_ids(orders) })).await.map(|_| ())
    }

    async fn move_task(&self, order: TaskOrder, new_index: u32) -> Result<(), RemoteError> {
        self.post("api/task/move", &json!({ "task_id": remote_id(order), "new_index": new_index }))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::TaskStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn payload_is_found_at_top_level_or_under_data() {
        let top = json!({"success": true, "tasks": [{"order": 1}]});
        let nested = json!({"success": true, "data": {"tasks": [{"order": 2, "status": "error"}]}});
        let a: Vec<Task> = payload(&top, "tasks").unwrap();
        let b: Vec<Task> = payload(&nested, "tasks").unwrap();
        assert_eq!(a[0].order, 1);
        assert_eq!(b[0].status, TaskStatus::Error);
    }

    #[test]
    fn missing_or_wrong_payload_is_malformed() {
        let env = json!({"success": true});
        assert!(matches!(payload::<Vec<Task>>(&env, "tasks"), Err(RemoteError::Malformed(_))));
        let env = json!({"success": true, "tasks": "nope"});
        assert!(matches!(payload::<Vec<Task>>(&env, "tasks"), Err(RemoteError::Malformed(_))));
    }

    #[test]
    fn unsuccessful_envelope_carries_server_message() {
        let err = check_success(json!({"success": false, "message": "任务列表为空"})).unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(ref m) if m == "任务列表为空"));
        assert!(matches!(check_success(json!({"tasks": []})), Err(RemoteError::Rejected(_))));
    }

    /// Serves exactly one canned HTTP response and hands back the raw request.
    async fn serve_once(content_type: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + body_len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                content_type,
                body.len(),
                body
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn backend_for(base_url: String) -> HttpBackend {
        HttpBackend::new(&ServerConfig {
            base_url,
            cookie: Some("session=abc".to_string()),
            ..ServerConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn snapshot_request_sends_session_cookie() {
        let (base, server) = serve_once(
            "application/json",
            r#"{"success":true,"tasks":[{"order":1,"status":"running","progress":40}]}"#,
        )
        .await;
        let tasks = backend_for(base).fetch_task_snapshot().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].progress, Some(40));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/tasks "));
        assert!(request.to_ascii_lowercase().contains("cookie: session=abc"));
    }

    #[tokio::test]
    async fn login_page_means_session_expired() {
        let (base, _server) = serve_once("text/html; charset=utf-8", "<html>login</html>").await;
        let err = backend_for(base).fetch_recent_logs(10).await.unwrap_err();
        assert!(matches!(err, RemoteError::SessionExpired));
    }

    #[tokio::test]
    async fn execute_addresses_task_by_zero_based_id() {
        let (base, server) = serve_once("application/json", r#"{"success":true,"message":"任务执行成功"}"#).await;
        let ack = backend_for(base).execute_task(3).await.unwrap();
        assert_eq!(ack.message.as_deref(), Some("任务执行成功"));
        assert!(ack.transferred_files.is_empty());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/task/execute "));
        assert!(request.contains(r#"{"task_id":2}"#));
    }

    #[test]
    fn endpoints_keep_proxy_prefix() {
        for raw in ["http://nas.local/autosave", "http://nas.local/autosave/"] {
            let b = HttpBackend::new(&ServerConfig { base_url: raw.to_string(), ..ServerConfig::default() }).unwrap();
            assert_eq!(b.endpoint("api/tasks").unwrap().as_str(), "http://nas.local/autosave/api/tasks");
        }
        let root = HttpBackend::new(&ServerConfig::default()).unwrap();
        assert_eq!(root.endpoint("api/logs").unwrap().as_str(), "http://127.0.0.1:5000/api/logs");
    }

    /// Accepts one connection and never answers it.
    async fn serve_silence() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let base = serve_silence().await;
        let backend = HttpBackend::new(&ServerConfig { base_url: base, timeout_secs: 1, ..ServerConfig::default() }).unwrap();
        let err = backend.fetch_task_snapshot().await.unwrap_err();
        assert!(matches!(err, RemoteError::Timeout), "got {:?}", err);
    }
}
