use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::info;

use chron_core::mailbox::{Mailbox, Message};

use crate::module::{Module, ModuleCtx};
use crate::supervisor::{JobStatusView, StatusApi};

/// How many recent runs the status route reports.
const RECENT_RUNS: usize = 3;

#[derive(Clone)]
struct AppState {
    api: Arc<dyn StatusApi>,
    mailbox: Arc<Mailbox>,
}

pub struct WebServer {
    addr: SocketAddr,
    api: Arc<dyn StatusApi>,
    mailbox: Arc<Mailbox>,
}

impl WebServer {
    pub fn new(addr: SocketAddr, api: Arc<dyn StatusApi>, mailbox: Arc<Mailbox>) -> Self {
        Self { addr, api, mailbox }
    }
}

impl Module for WebServer {
    fn name(&self) -> &'static str {
        "web"
    }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(self.api, self.mailbox);
            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("control plane listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;
            Ok(())
        })
    }
}

fn router(api: Arc<dyn StatusApi>, mailbox: Arc<Mailbox>) -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/job/:name/status", get(job_status))
        .route("/job/:name/logs", get(read_logs).delete(delete_logs))
        .route(
            "/job/:name/mailbox",
            get(read_mailbox).post(post_mailbox).delete(clear_mailbox),
        )
        .route("/job/:name/terminate", post(terminate_job))
        .route(
            "/mailbox/messages",
            get(all_messages).delete(clear_all_messages),
        )
        .route("/mailbox/count", get(message_count))
        // CHRON_MAILBOX_URL points jobs here for self-reporting.
        .route(
            "/mailbox/:source",
            get(read_mailbox).post(post_mailbox).delete(clear_mailbox),
        )
        .fallback(unknown_route)
        .with_state(AppState { api, mailbox })
}

#[derive(Serialize)]
struct JobListItem {
    name: String,
    running: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunItem {
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<i32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusBody {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    runs: Vec<RunItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

fn status_body(view: JobStatusView) -> JobStatusBody {
    JobStatusBody {
        name: view.name,
        kind: view.kind.as_str(),
        runs: view
            .runs
            .into_iter()
            .take(RECENT_RUNS)
            .map(|r| RunItem {
                timestamp: r.timestamp,
                status_code: r.status_code,
            })
            .collect(),
        next_run: view.next_run.map(|t| t.to_rfc3339()),
        pid: view.pid,
    }
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobListItem>> {
    Json(
        state
            .api
            .jobs()
            .into_iter()
            .map(|j| JobListItem {
                name: j.name,
                running: j.running,
            })
            .collect(),
    )
}

async fn job_status(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    match state.api.job_status(&name) {
        Some(view) => Json(status_body(view)).into_response(),
        None => (StatusCode::NOT_FOUND, "Unknown job").into_response(),
    }
}

async fn read_logs(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    let Some(path) = state.api.job_log_path(&name) else {
        return (StatusCode::NOT_FOUND, "Unknown job").into_response();
    };
    match tokio::fs::File::open(&path).await {
        Ok(file) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        Err(e) => io_error(e),
    }
}

async fn delete_logs(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    let Some(path) = state.api.job_log_path(&name) else {
        return (StatusCode::NOT_FOUND, "Unknown job").into_response();
    };
    match tokio::fs::remove_file(&path).await {
        Ok(()) => (StatusCode::OK, "Deleted log file").into_response(),
        Err(e) => io_error(e),
    }
}

async fn terminate_job(Path(name): Path<String>, State(state): State<AppState>) -> &'static str {
    if state.api.terminate(&name) {
        "Terminated job"
    } else {
        "Job not running"
    }
}

async fn read_mailbox(
    Path(source): Path<String>,
    State(state): State<AppState>,
) -> Json<Vec<Message>> {
    Json(state.mailbox.list_by(&source))
}

async fn post_mailbox(
    Path(source): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> Response {
    match state.mailbox.add(&source, &body) {
        Ok(record) => Json(record).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

async fn clear_mailbox(Path(source): Path<String>, State(state): State<AppState>) -> Response {
    match state.mailbox.clear_by(&source) {
        Ok(removed) => Json(removed).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

async fn all_messages(State(state): State<AppState>) -> Json<Vec<Message>> {
    Json(state.mailbox.list_all())
}

async fn clear_all_messages(State(state): State<AppState>) -> Response {
    match state.mailbox.clear_all() {
        Ok(removed) => Json(removed).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

async fn message_count(State(state): State<AppState>) -> Json<usize> {
    Json(state.mailbox.count())
}

async fn unknown_route() -> Response {
    (StatusCode::BAD_REQUEST, "Unknown route").into_response()
}

fn io_error(e: std::io::Error) -> Response {
    if e.kind() == std::io::ErrorKind::NotFound {
        (StatusCode::NOT_FOUND, "No log file").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use axum::http::Request;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use serde_json::Value;
    use tower::ServiceExt;

    use chron_core::job::JobKind;
    use chron_core::store::RunStatusEntry;

    use crate::supervisor::JobSummary;

    /// Fixed-state stand-in for the supervisor.
    struct FakeApi {
        log_dir: PathBuf,
        running_pid: Option<u32>,
        terminated: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new(log_dir: PathBuf) -> Self {
            Self {
                log_dir,
                running_pid: None,
                terminated: Mutex::new(Vec::new()),
            }
        }

        fn run(name: &str, millis: i64, code: Option<i32>) -> RunStatusEntry {
            let mut entry = RunStatusEntry::begin(name);
            entry.timestamp = millis;
            entry.status_code = code;
            entry
        }
    }

    impl StatusApi for FakeApi {
        fn jobs(&self) -> Vec<JobSummary> {
            vec![
                JobSummary {
                    name: "backup".to_string(),
                    running: self.running_pid.is_some(),
                },
                JobSummary {
                    name: "server".to_string(),
                    running: false,
                },
            ]
        }

        fn job_status(&self, name: &str) -> Option<JobStatusView> {
            if name != "backup" {
                return None;
            }
            Some(JobStatusView {
                name: name.to_string(),
                kind: JobKind::Scheduled,
                runs: (0..5)
                    .map(|i| Self::run(name, 5_000 - i * 1_000, Some(0)))
                    .collect(),
                next_run: chrono::DateTime::from_timestamp_millis(1_700_000_000_000),
                pid: self.running_pid,
            })
        }

        fn job_log_path(&self, name: &str) -> Option<PathBuf> {
            (name == "backup").then(|| self.log_dir.join(format!("{name}.log")))
        }

        fn terminate(&self, name: &str) -> bool {
            if name != "backup" {
                return false;
            }
            self.terminated.lock().push(name.to_string());
            self.running_pid.is_some()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        api: Arc<FakeApi>,
        mailbox: Arc<Mailbox>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_pid(None)
        }

        fn with_pid(pid: Option<u32>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut api = FakeApi::new(dir.path().to_path_buf());
            api.running_pid = pid;
            let mailbox = Arc::new(Mailbox::open(dir.path().join("mailbox.json")).unwrap());
            Self {
                _dir: dir,
                api: Arc::new(api),
                mailbox,
            }
        }

        fn router(&self) -> Router {
            router(self.api.clone(), self.mailbox.clone())
        }
    }

    async fn send(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn index_lists_every_registered_job() {
        let fx = Fixture::new();
        let (status, body) = send(fx.router(), "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json[0]["name"], "backup");
        assert_eq!(json[0]["running"], false);
        assert_eq!(json[1]["name"], "server");
    }

    #[tokio::test]
    async fn status_reports_at_most_three_recent_runs() {
        let fx = Fixture::with_pid(Some(4242));
        let (status, body) = send(fx.router(), "GET", "/job/backup/status", "").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["name"], "backup");
        assert_eq!(json["type"], "scheduled");
        assert_eq!(json["runs"].as_array().unwrap().len(), 3);
        assert_eq!(json["runs"][0]["statusCode"], 0);
        assert_eq!(json["pid"], 4242);
        assert!(json["nextRun"].as_str().unwrap().starts_with("2023-11-1"));
    }

    #[tokio::test]
    async fn status_of_an_unknown_job_is_404() {
        let fx = Fixture::new();
        let (status, _) = send(fx.router(), "GET", "/job/ghost/status", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_route_streams_then_deletes_the_file() {
        let fx = Fixture::new();
        let log_path = fx.api.job_log_path("backup").unwrap();
        std::fs::write(&log_path, "run output\n").unwrap();

        let (status, body) = send(fx.router(), "GET", "/job/backup/logs", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "run output\n");

        let (status, body) = send(fx.router(), "DELETE", "/job/backup/logs", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Deleted log file");

        let (status, _) = send(fx.router(), "GET", "/job/backup/logs", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(fx.router(), "DELETE", "/job/backup/logs", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn terminate_distinguishes_running_from_idle() {
        let running = Fixture::with_pid(Some(7));
        let (status, body) = send(running.router(), "POST", "/job/backup/terminate", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Terminated job");
        assert_eq!(*running.api.terminated.lock(), vec!["backup"]);

        let idle = Fixture::new();
        let (_, body) = send(idle.router(), "POST", "/job/backup/terminate", "").await;
        assert_eq!(body, "Job not running");

        // Unknown names fall into the not-running reply, not a 404.
        let (status, body) = send(idle.router(), "POST", "/job/ghost/terminate", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Job not running");
    }

    #[tokio::test]
    async fn job_mailbox_round_trip() {
        let fx = Fixture::new();

        let (status, body) = send(fx.router(), "POST", "/job/backup/mailbox", "hello").await;
        assert_eq!(status, StatusCode::OK);
        let record: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(record["source"], "backup");
        assert_eq!(record["message"], "hello");

        let (_, body) = send(fx.router(), "GET", "/job/backup/mailbox", "").await;
        let listed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (_, body) = send(fx.router(), "DELETE", "/job/backup/mailbox", "").await;
        let removed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(removed.as_array().unwrap().len(), 1);
        assert_eq!(fx.mailbox.count(), 0);
    }

    #[tokio::test]
    async fn the_advertised_mailbox_url_accepts_posts() {
        let fx = Fixture::new();
        let (status, _) = send(fx.router(), "POST", "/mailbox/backup", "self-report").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fx.mailbox.list_by("backup").len(), 1);
    }

    #[tokio::test]
    async fn global_mailbox_listing_count_and_clear() {
        let fx = Fixture::new();
        fx.mailbox.add("a", "one").unwrap();
        fx.mailbox.add("b", "two").unwrap();

        let (_, body) = send(fx.router(), "GET", "/mailbox/messages", "").await;
        let all: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (_, body) = send(fx.router(), "GET", "/mailbox/count", "").await;
        assert_eq!(body, "2");

        let (_, body) = send(fx.router(), "DELETE", "/mailbox/messages", "").await;
        let removed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(removed.as_array().unwrap().len(), 2);
        assert_eq!(fx.mailbox.count(), 0);
    }

    #[tokio::test]
    async fn unknown_routes_get_400_and_wrong_methods_405() {
        let fx = Fixture::new();
        let (status, _) = send(fx.router(), "GET", "/no/such/route", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(fx.router(), "DELETE", "/job/backup/status", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, _) = send(fx.router(), "POST", "/mailbox/count", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
