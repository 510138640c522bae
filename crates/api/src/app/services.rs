use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;

use docflow_infra::{
    TaskContext,
    analysis::{Analyzer, HttpChatAnalyzer, RetryingAnalyzer},
    config::AppConfig,
    documents::{DocumentStore, FsDocumentStore},
    queue::{InMemoryWorkQueue, WorkQueue},
    reaper::{Reaper, ReaperHandle},
    service::TaskService,
    task_store::{InMemoryTaskStore, PostgresTaskStore, TaskStore},
    worker::{Worker, WorkerHandle},
};

#[cfg(feature = "redis")]
use docflow_infra::queue::RedisWorkQueue;

/// Everything the HTTP handlers (and an embedded worker) share.
#[derive(Clone)]
pub struct AppServices {
    pub tasks: TaskService,
    pub documents: Arc<dyn DocumentStore>,
}

impl AppServices {
    pub fn new(tasks: TaskService, documents: Arc<dyn DocumentStore>) -> Self {
        Self { tasks, documents }
    }

    pub fn context(&self) -> &TaskContext {
        self.tasks.context()
    }
}

/// Wire the task store, queue and document store selected by `config`.
///
/// `DATABASE_URL` selects Postgres and `REDIS_URL` selects Redis; either one
/// unset falls back to the in-memory adapter.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store = build_task_store(config).await?;
    let queue = build_work_queue(config)?;
    let documents: Arc<dyn DocumentStore> =
        Arc::new(FsDocumentStore::new(config.document_root.clone()));

    let ctx = TaskContext::new(store, queue);
    let tasks = TaskService::new(ctx, documents.clone(), config.document_bucket.clone());
    Ok(AppServices::new(tasks, documents))
}

async fn build_task_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TaskStore>> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; tasks are kept in memory");
        return Ok(Arc::new(InMemoryTaskStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresTaskStore::new(pool, Handle::current());
    store.ensure_schema().await?;
    tracing::info!("task store: postgres");
    Ok(Arc::new(store))
}

fn build_work_queue(config: &AppConfig) -> anyhow::Result<Arc<dyn WorkQueue>> {
    if let Some(url) = config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        {
            let queue = RedisWorkQueue::new(url, None)?;
            tracing::info!("work queue: redis");
            return Ok(Arc::new(queue));
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            tracing::warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory");
        }
    }

    Ok(Arc::new(InMemoryWorkQueue::new()))
}

/// Build the analyzer the worker calls: the chat-completions client wrapped in
/// the configured retry policy.
pub fn build_analyzer(config: &AppConfig) -> anyhow::Result<Arc<dyn Analyzer>> {
    let llm = &config.llm;
    let prompt = HttpChatAnalyzer::load_prompt(&llm.prompt_file);
    let client = HttpChatAnalyzer::new(&llm.endpoint, llm.api_key.clone(), &llm.model, prompt)?;
    Ok(Arc::new(RetryingAnalyzer::new(client, llm.retry.clone())))
}

/// Worker and reaper threads running alongside the process.
pub struct BackgroundHandles {
    worker: WorkerHandle,
    reaper: ReaperHandle,
}

impl BackgroundHandles {
    /// Signal both loops and wait for them. Blocks until the worker finishes
    /// its current task.
    pub fn shutdown(self) {
        self.worker.shutdown();
        self.reaper.shutdown();
    }
}

pub fn spawn_background(
    config: &AppConfig,
    services: &AppServices,
    analyzer: Arc<dyn Analyzer>,
) -> anyhow::Result<BackgroundHandles> {
    let worker = Worker::new(
        services.context().clone(),
        services.documents.clone(),
        analyzer,
        config.worker.clone(),
    )
    .spawn()
    .context("failed to spawn worker thread")?;

    let reaper = match Reaper::new(services.context().clone(), config.reaper.clone()).spawn() {
        Ok(reaper) => reaper,
        Err(e) => {
            worker.shutdown();
            return Err(anyhow::Error::new(e).context("failed to spawn reaper thread"));
        }
    };

    Ok(BackgroundHandles { worker, reaper })
}
