//! End-to-end scenarios across the task pipeline.
//!
//! Submit → WorkQueue → Worker (claim, resolve, analyze, finalize) → ack,
//! with the Reaper recovering claims whose worker vanished.
//!
//! Verifies:
//! - Successful analysis lands as a `success` result
//! - Exhausted transient failures end `failed`, and manual retry re-enqueues
//! - A pending upload that never lands fails after the bounded wait
//! - An orphaned claim is reclaimed and handed to the next worker

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};
    use serde_json::json;

    use docflow_core::{NewTask, PENDING_UPLOAD_SENTINEL, TaskStatus};

    use crate::analysis::{AnalysisError, AnalysisRequest, Analyzer, FnAnalyzer, RetryingAnalyzer};
    use crate::context::TaskContext;
    use crate::documents::InMemoryDocumentStore;
    use crate::reaper::{Reaper, ReaperConfig};
    use crate::retry::RetryPolicy;
    use crate::service::{DEFAULT_BUCKET, TaskService};
    use crate::worker::{WorkOutcome, Worker, WorkerConfig};

    struct Pipeline {
        ctx: TaskContext,
        service: TaskService,
        documents: Arc<InMemoryDocumentStore>,
    }

    impl Pipeline {
        fn new() -> Self {
            let ctx = TaskContext::in_memory();
            let documents = Arc::new(InMemoryDocumentStore::new());
            let service = TaskService::new(ctx.clone(), documents.clone(), DEFAULT_BUCKET);
            Self {
                ctx,
                service,
                documents,
            }
        }

        fn worker(&self, analyzer: Arc<dyn Analyzer>) -> Worker {
            Worker::new(
                self.ctx.clone(),
                self.documents.clone(),
                analyzer,
                WorkerConfig {
                    name: "scenario-worker".to_string(),
                    dequeue_timeout: Duration::from_millis(20),
                    upload_poll_interval: Duration::from_millis(5),
                    upload_poll_attempts: 4,
                    error_backoff: Duration::from_millis(5),
                },
            )
        }

        fn reaper(&self) -> Reaper {
            Reaper::new(self.ctx.clone(), ReaperConfig::default())
        }
    }

    #[test]
    fn scenario_a_inline_document_succeeds() {
        let pipeline = Pipeline::new();
        let analyzer: Arc<dyn Analyzer> = Arc::new(FnAnalyzer(|req: &AnalysisRequest| {
            Ok(json!({"issues": [], "length": req.text.len()}))
        }));
        let worker = pipeline.worker(analyzer);

        let id = pipeline.service.submit(NewTask::new("greeting", "hello")).unwrap();
        assert_eq!(
            worker.run_once().unwrap(),
            WorkOutcome::Finished(id, TaskStatus::Success)
        );

        let task = pipeline.service.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.result, Some(json!({"issues": [], "length": 5})));
        assert!(task.processing_started_at.is_some());
        let stats = pipeline.service.stats().unwrap();
        assert_eq!(stats.queue.ready, 0);
        assert_eq!(stats.queue.processing, 0);
    }

    #[test]
    fn scenario_b_transient_errors_exhaust_then_manual_retry() {
        let pipeline = Pipeline::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = FnAnalyzer(move |_: &AnalysisRequest| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err(AnalysisError::Transient(format!("status=503 attempt={n}")))
        });
        let analyzer: Arc<dyn Analyzer> = Arc::new(RetryingAnalyzer::new(
            flaky,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        ));
        let worker = pipeline.worker(analyzer);

        let id = pipeline.service.submit(NewTask::new("flaky", "doc")).unwrap();
        worker.run_once().unwrap();

        let task = pipeline.service.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.result,
            Some(json!({"error": "transient upstream error: status=503 attempt=3"}))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let retried = pipeline.service.retry(id).unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert!(retried.result.is_none());
        assert_eq!(retried.retry_count, 0);
        assert_eq!(pipeline.service.stats().unwrap().queue.ready, 1);
    }

    #[test]
    fn scenario_c_upload_never_lands() {
        let pipeline = Pipeline::new();
        let analyzer: Arc<dyn Analyzer> =
            Arc::new(FnAnalyzer(|_: &AnalysisRequest| Ok(json!({"unexpected": true}))));
        let worker = pipeline.worker(analyzer);

        let task = pipeline
            .ctx
            .store
            .create(NewTask::new("waiting", PENDING_UPLOAD_SENTINEL))
            .unwrap();
        pipeline
            .ctx
            .queue
            .enqueue_ready(&docflow_core::QueueEntry::from(&task))
            .unwrap();

        assert_eq!(
            worker.run_once().unwrap(),
            WorkOutcome::Finished(task.id, TaskStatus::Failed)
        );
        let task = pipeline.service.get(task.id).unwrap();
        let error = task.result.unwrap()["error"].as_str().unwrap().to_string();
        assert!(error.contains("still pending"), "{error}");
    }

    #[test]
    fn scenario_d_orphaned_claim_is_reclaimed() {
        let pipeline = Pipeline::new();
        let id = pipeline.service.submit(NewTask::new("orphan", "doc")).unwrap();

        // A worker dequeues and claims, then dies before finalizing.
        let entry = pipeline
            .ctx
            .queue
            .dequeue_ready(Duration::ZERO)
            .unwrap()
            .unwrap();
        let claimed_at = Utc::now();
        pipeline.ctx.queue.move_to_processing(&entry, claimed_at).unwrap();
        pipeline.ctx.store.claim(id, claimed_at).unwrap().unwrap();

        let report = pipeline
            .reaper()
            .run_once(claimed_at + TimeDelta::seconds(601))
            .unwrap();
        assert_eq!(report.reclaimed, vec![id]);

        let task = pipeline.service.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.processing_started_at.is_none());
        let stats = pipeline.service.stats().unwrap();
        assert_eq!(stats.queue.ready, 1);
        assert_eq!(stats.queue.processing, 0);

        // The next worker picks the fresh entry up.
        let analyzer: Arc<dyn Analyzer> =
            Arc::new(FnAnalyzer(|_: &AnalysisRequest| Ok(json!({"ok": true}))));
        assert_eq!(
            pipeline.worker(analyzer).run_once().unwrap(),
            WorkOutcome::Finished(id, TaskStatus::Success)
        );
        assert_eq!(pipeline.service.get(id).unwrap().retry_count, 1);
    }

    #[test]
    fn upload_flow_runs_end_to_end() {
        let pipeline = Pipeline::new();
        let analyzer: Arc<dyn Analyzer> = Arc::new(FnAnalyzer(|req: &AnalysisRequest| {
            Ok(json!({"text": req.text, "feature": req.feature}))
        }));
        let worker = pipeline.worker(analyzer);

        let receipt = pipeline
            .service
            .submit_with_upload(crate::service::UploadRequest {
                name: "guide".into(),
                product: None,
                feature: Some("export".into()),
                filename: Some("guide.md".into()),
                bytes: "# Export\nSteps".as_bytes().to_vec(),
            })
            .unwrap();

        worker.run_once().unwrap();
        let task = pipeline.service.get(receipt.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(
            task.result,
            Some(json!({"text": "# Export\nSteps", "feature": "export"}))
        );
    }
}
