use std::sync::Arc;
use std::time::Duration;

use docflow_api::app::services::AppServices;
use docflow_infra::{
    TaskContext,
    analysis::{AnalysisError, FnAnalyzer},
    documents::{DocumentStore, InMemoryDocumentStore},
    service::{DEFAULT_BUCKET, TaskService},
    worker::{Worker, WorkerConfig, WorkerHandle},
};
use reqwest::StatusCode;
use serde_json::{Value, json};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    worker: Option<WorkerHandle>,
}

impl TestServer {
    /// Same router as prod over in-memory backends, bound to an ephemeral port.
    /// With `with_worker`, a worker thread with a stub analyzer drains the queue.
    async fn spawn(with_worker: bool) -> Self {
        let documents: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let tasks = TaskService::new(TaskContext::in_memory(), documents.clone(), DEFAULT_BUCKET);
        let services = AppServices::new(tasks, documents);

        let worker = with_worker.then(|| {
            let analyzer = Arc::new(FnAnalyzer(|req: &docflow_infra::analysis::AnalysisRequest| {
                if req.text.contains("FAIL") {
                    return Err(AnalysisError::Fatal("model refused the document".into()));
                }
                Ok(json!({
                    "verdict": "ok",
                    "chars": req.text.len(),
                    "product": req.product,
                }))
            }));
            let config = WorkerConfig {
                dequeue_timeout: Duration::from_millis(50),
                upload_poll_interval: Duration::from_millis(20),
                upload_poll_attempts: 100,
                error_backoff: Duration::from_millis(20),
                ..WorkerConfig::default()
            }
            .with_name("black-box-worker");
            Worker::new(services.context().clone(), services.documents.clone(), analyzer, config)
                .spawn()
                .expect("failed to spawn worker")
        });

        let app = docflow_api::app::build_app(Arc::new(services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            worker,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

async fn submit(client: &reqwest::Client, server: &TestServer, body: Value) -> i64 {
    let res = client
        .post(server.url("/tasks"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    body["task_id"].as_i64().unwrap()
}

async fn wait_for_status(
    client: &reqwest::Client,
    server: &TestServer,
    task_id: i64,
    status: &str,
) -> Value {
    for _ in 0..200 {
        let res = client
            .get(server.url(&format!("/tasks/{task_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let task: Value = res.json().await.unwrap();
        if task["status"] == status {
            return task;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    panic!("task {task_id} never reached status {status}");
}

#[tokio::test]
async fn health_is_ok() {
    let server = TestServer::spawn(false).await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn inline_document_is_analyzed() {
    let server = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let task_id = submit(
        &client,
        &server,
        json!({"name": "quarterly review", "doc": "hello world", "product": "billing"}),
    )
    .await;

    let task = wait_for_status(&client, &server, task_id, "success").await;
    assert_eq!(task["task_name"], "quarterly review");
    assert_eq!(task["result"]["chars"], 11);
    assert_eq!(task["result"]["product"], "billing");
    assert!(task["processing_started_at"].is_string());
    assert_eq!(task["retry_count"], 0);
}

#[tokio::test]
async fn uploaded_document_is_analyzed() {
    let server = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/tasks/upload?name=upload&filename=notes.txt"))
        .body("uploaded text")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let receipt: Value = res.json().await.unwrap();
    let task_id = receipt["task_id"].as_i64().unwrap();
    let doc = receipt["doc"].as_str().unwrap().to_string();
    assert_eq!(doc, format!("minio://{DEFAULT_BUCKET}/{task_id}_notes.txt"));

    let task = wait_for_status(&client, &server, task_id, "success").await;
    assert_eq!(task["doc"], doc);
    assert_eq!(task["result"]["chars"], "uploaded text".len());
}

#[tokio::test]
async fn failed_task_can_be_retried_but_successful_cannot() {
    let server = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let failing = submit(&client, &server, json!({"name": "bad", "doc": "please FAIL"})).await;
    let task = wait_for_status(&client, &server, failing, "failed").await;
    assert!(task["result"]["error"].is_string());

    let res = client
        .post(server.url(&format!("/tasks/{failing}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let retried: Value = res.json().await.unwrap();
    assert_eq!(retried["status"], "pending");
    assert!(retried["result"].is_null());
    assert!(retried["processing_started_at"].is_null());

    // Same document, same deterministic failure.
    wait_for_status(&client, &server, failing, "failed").await;

    let ok = submit(&client, &server, json!({"name": "good", "doc": "fine"})).await;
    wait_for_status(&client, &server, ok, "success").await;

    let res = client
        .post(server.url(&format!("/tasks/{ok}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_task_status");
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let server = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/tasks/424242")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "task_not_found");

    let res = client.get(server.url("/tasks/abc")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(server.url("/tasks/424242/retry"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn submit_rejects_invalid_documents() {
    let server = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    for doc in ["", "__PENDING_FILE__", "minio://bucket-only"] {
        let res = client
            .post(server.url("/tasks"))
            .json(&json!({"name": "x", "doc": doc}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "doc {doc:?}");
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"], "bad_request");
    }
}

#[tokio::test]
async fn list_delete_and_stats() {
    let server = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let first = submit(&client, &server, json!({"name": "first", "doc": "one"})).await;
    let second = submit(&client, &server, json!({"name": "second", "doc": "two"})).await;

    let tasks: Value = client
        .get(server.url("/tasks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<i64> = tasks
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["task_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![second, first]);

    let stats: Value = client
        .get(server.url("/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["tasks"]["pending"], 2);
    assert_eq!(stats["queue"]["ready"], 2);
    assert_eq!(stats["queue"]["processing"], 0);

    let res = client
        .post(server.url("/tasks/delete"))
        .json(&json!({"task_ids": [first, 999_999]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["deleted"], 1);

    let res = client
        .get(server.url(&format!("/tasks/{first}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
