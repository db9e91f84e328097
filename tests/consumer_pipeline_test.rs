//! Delivery pipeline against the in-memory broker and stores: a plugin run
//! end to end, fault containment, and settlement accounting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use plugin_runtime::database::in_memory::{InMemoryJobStateStore, InMemoryPluginStore};
use plugin_runtime::database::{JobMutation, JobStateStore};
use plugin_runtime::lifecycle::InMemoryConnector;
use plugin_runtime::messaging::in_memory::InMemoryBroker;
use plugin_runtime::messaging::PLUGINS_DISPATCHER_QUEUE;
use plugin_runtime::{
    AnalysisOutput, AnalysisPlugin, CompletionMessage, Connector, DispatchMessage,
    Connections, HandlerContext, JobStateRecord, MessageConsumer, PluginHandler, RuntimeMetrics,
    Step, StepStatus, StoreError, StoreResult, StructuredError,
};

#[derive(Debug, Deserialize)]
struct ScanConfig {
    #[serde(default)]
    panic_first: bool,
}

/// Panics on the first delivery of messages flagged `panic_first`
#[derive(Default)]
struct FragileScanner {
    runs: AtomicU32,
}

#[async_trait]
impl AnalysisPlugin for FragileScanner {
    type Config = ScanConfig;
    type Output = serde_json::Value;

    fn name(&self) -> &str {
        "license-finder"
    }

    fn ecosystem(&self) -> &str {
        "javascript"
    }

    async fn start_analysis(
        &self,
        ctx: &HandlerContext,
        message: &DispatchMessage<ScanConfig>,
        _job: &JobStateRecord,
    ) -> Result<AnalysisOutput<serde_json::Value>, StructuredError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if message.data.panic_first && !ctx.redelivered {
            panic!("scanner crashed");
        }
        Ok(AnalysisOutput::success(json!({ "licenses": ["MIT"] })))
    }
}

fn job() -> JobStateRecord {
    JobStateRecord::new(
        Uuid::new_v4(),
        vec![vec![
            Step::new("license-finder", StepStatus::Ongoing),
            Step::new("js-sbom", StepStatus::Success),
        ]],
    )
}

fn dispatch(job_id: Uuid, panic_first: bool) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "data": { "panic_first": panic_first },
        "analysis_id": job_id
    }))
    .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_panicking_delivery_is_requeued_and_loop_survives() {
    let broker = InMemoryBroker::new();
    let connector = InMemoryConnector::new(broker.clone());
    let connections = connector.connect().await.unwrap();
    let metrics = Arc::new(RuntimeMetrics::new());

    let crashing = job();
    let healthy = job();
    connector.job_states().insert(crashing.clone());
    connector.job_states().insert(healthy.clone());

    let plugin = Arc::new(FragileScanner::default());
    let handler = PluginHandler::from_arc(plugin.clone());
    let queue = handler.queue_name();
    let mut consumer = MessageConsumer::new(1, metrics.clone());
    consumer.register_queue(queue.clone(), true, Arc::new(handler));
    consumer.start_listening(connections.clone()).await.unwrap();

    broker.publish(&queue, &dispatch(crashing.id, true));
    broker.publish(&queue, &dispatch(healthy.id, false));

    wait_until(|| broker.queue_stats(&queue).map(|s| s.total_acked) == Some(2)).await;

    let stats = broker.queue_stats(&queue).unwrap();
    assert_eq!(stats.total_nacked, 1);
    assert_eq!(stats.depth, 0);
    assert_eq!(plugin.runs.load(Ordering::SeqCst), 3);
    assert_eq!(consumer.active_consumers(), 1);

    for id in [crashing.id, healthy.id] {
        let stored = connector.job_states().get(id).unwrap();
        assert_eq!(stored.steps[0][0].status(), Some(StepStatus::Success));
        assert_eq!(stored.steps[0][1].status(), Some(StepStatus::Success));
        assert_eq!(connector.results().for_job(id).len(), 1);
    }

    let mut completed: Vec<Uuid> = broker
        .drain(PLUGINS_DISPATCHER_QUEUE)
        .iter()
        .map(|body| CompletionMessage::from_bytes(body).unwrap().analysis_id)
        .collect();
    completed.sort();
    let mut expected = vec![crashing.id, healthy.id];
    expected.sort();
    assert_eq!(completed, expected);

    let counts = &metrics.snapshot().messages[&queue];
    assert_eq!((counts.success, counts.failure, counts.panic), (2, 0, 1));

    consumer.stop();
    connections.close().await;
}

#[tokio::test]
async fn test_every_delivery_is_settled_exactly_once() {
    let broker = InMemoryBroker::new();
    let connector = InMemoryConnector::new(broker.clone());
    let connections = connector.connect().await.unwrap();
    let metrics = Arc::new(RuntimeMetrics::new());

    let handler = PluginHandler::new(FragileScanner::default());
    let queue = handler.queue_name();
    let mut consumer = MessageConsumer::new(4, metrics.clone());
    consumer.register_queue(queue.clone(), true, Arc::new(handler));
    consumer.start_listening(connections.clone()).await.unwrap();

    // Unknown jobs and malformed bodies are failures, not faults
    let mut published = 0u64;
    for _ in 0..5 {
        let record = job();
        connector.job_states().insert(record.clone());
        broker.publish(&queue, &dispatch(record.id, false));
        published += 1;
    }
    broker.publish(&queue, &dispatch(Uuid::new_v4(), false));
    broker.publish(&queue, b"not json");
    published += 2;

    wait_until(|| broker.queue_stats(&queue).map(|s| s.total_acked) == Some(published)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = broker.queue_stats(&queue).unwrap();
    assert_eq!(stats.total_acked, published);
    assert_eq!(stats.total_nacked, 0);
    assert_eq!(stats.depth, 0);

    let counts = &metrics.snapshot().messages[&queue];
    assert_eq!(counts.success, 5);
    assert_eq!(counts.failure, 2);
    assert_eq!(broker.drain(PLUGINS_DISPATCHER_QUEUE).len(), 5);

    consumer.stop();
    connections.close().await;
}

/// Job state store whose database is down for the first `outage` loads
struct RecoveringJobStates {
    inner: InMemoryJobStateStore,
    outage: AtomicU32,
}

#[async_trait]
impl JobStateStore for RecoveringJobStates {
    async fn load(&self, job_id: Uuid) -> StoreResult<JobStateRecord> {
        let down = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(StoreError::database("load analysis", "connection refused"));
        }
        self.inner.load(job_id).await
    }

    async fn modify(&self, job_id: Uuid, mutation: JobMutation) -> StoreResult<JobStateRecord> {
        self.inner.modify(job_id, mutation).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_requeues_until_the_run_completes() {
    let broker = InMemoryBroker::new();
    let connector = InMemoryConnector::new(broker.clone());
    let generation = connector.connect().await.unwrap();
    let job_states = Arc::new(RecoveringJobStates {
        inner: InMemoryJobStateStore::new(),
        outage: AtomicU32::new(2),
    });
    let record = job();
    job_states.inner.insert(record.clone());
    let connections = Arc::new(Connections::new(
        generation.broker().clone(),
        job_states.clone(),
        connector.results().clone(),
        Arc::new(InMemoryPluginStore::new()),
    ));
    let metrics = Arc::new(RuntimeMetrics::new());

    let plugin = Arc::new(FragileScanner::default());
    let handler = PluginHandler::from_arc(plugin.clone());
    let queue = handler.queue_name();
    let mut consumer = MessageConsumer::new(1, metrics.clone());
    consumer.register_queue(queue.clone(), true, Arc::new(handler));
    consumer.start_listening(connections.clone()).await.unwrap();

    broker.publish(&queue, &dispatch(record.id, false));
    wait_until(|| broker.queue_stats(&queue).map(|s| s.total_acked) == Some(1)).await;

    let stats = broker.queue_stats(&queue).unwrap();
    assert_eq!((stats.total_nacked, stats.depth), (2, 0));
    assert_eq!(plugin.runs.load(Ordering::SeqCst), 1);

    let stored = job_states.inner.get(record.id).unwrap();
    assert_eq!(stored.steps[0][0].status(), Some(StepStatus::Success));
    assert_eq!(connector.results().for_job(record.id).len(), 1);
    assert_eq!(broker.drain(PLUGINS_DISPATCHER_QUEUE).len(), 1);

    let counts = &metrics.snapshot().messages[&queue];
    assert_eq!((counts.success, counts.requeued, counts.failure), (1, 2, 0));

    consumer.stop();
    connections.close().await;
    generation.close().await;
}
