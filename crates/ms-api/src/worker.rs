//! Admission-controlled consumer of provisioning requests.
//!
//! Each admitted message is handled on its own task. Messages that arrive
//! while the build or live-server limit is reached are released uncommitted
//! and picked up again after a fixed backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ms_infra::{Orchestrator, ProvisionRequest, Stage};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::events::{CREATE_KEY, EventKind, EventStatus, ProgressEvent};
use crate::publisher::EventPublisher;
use crate::queue::{Delivery, MessageSource, QueueError};

pub const ADMISSION_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    pub max_concurrent_builds: usize,
    pub max_alive_servers: usize,
}

#[derive(Default)]
struct Counters {
    builds: AtomicUsize,
    live: AtomicUsize,
}

/// A held build slot; released when dropped.
pub struct BuildSlot {
    counters: Arc<Counters>,
}

impl Drop for BuildSlot {
    fn drop(&mut self) {
        self.counters.builds.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestState {
    InFlight,
    Provisioned { server_id: String },
}

pub struct Worker {
    source: Arc<dyn MessageSource>,
    orchestrator: Arc<Orchestrator>,
    publisher: Arc<dyn EventPublisher>,
    limits: WorkerLimits,
    counters: Arc<Counters>,
    requests: Mutex<HashMap<String, RequestState>>,
}

impl Worker {
    pub fn new(
        source: Arc<dyn MessageSource>,
        orchestrator: Arc<Orchestrator>,
        publisher: Arc<dyn EventPublisher>,
        limits: WorkerLimits,
    ) -> Self {
        Self {
            source,
            orchestrator,
            publisher,
            limits,
            counters: Arc::new(Counters::default()),
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn builds_in_flight(&self) -> usize {
        self.counters.builds.load(Ordering::SeqCst)
    }

    pub fn live_servers(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Take a build slot if both limits allow it.
    pub fn admit(&self) -> Option<BuildSlot> {
        if self.counters.live.load(Ordering::SeqCst) >= self.limits.max_alive_servers {
            return None;
        }

        let builds = &self.counters.builds;
        let mut current = builds.load(Ordering::SeqCst);
        loop {
            if current >= self.limits.max_concurrent_builds {
                return None;
            }
            match builds.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return Some(BuildSlot {
                        counters: self.counters.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Consume until the source fails.
    pub async fn run(self: Arc<Self>) -> Result<(), QueueError> {
        info!(
            max_concurrent_builds = self.limits.max_concurrent_builds,
            max_alive_servers = self.limits.max_alive_servers,
            "worker started"
        );

        loop {
            let delivery = self.source.next().await?;

            if delivery.key != CREATE_KEY {
                warn!(key = %delivery.key, "unknown message type, skipping");
                self.commit(&delivery).await;
                continue;
            }

            let Some(slot) = self.admit() else {
                warn!(
                    builds = self.builds_in_flight(),
                    live = self.live_servers(),
                    "at capacity, deferring message"
                );
                if let Err(e) = self.source.release(delivery).await {
                    warn!(error = %e, "failed to release deferred message");
                }
                tokio::time::sleep(ADMISSION_BACKOFF).await;
                continue;
            };

            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle_create(delivery, slot).await;
            });
        }
    }

    async fn handle_create(&self, delivery: Delivery, _slot: BuildSlot) {
        let decoded = serde_json::from_slice::<ProvisionRequest>(&delivery.payload);
        let server_id = decoded
            .as_ref()
            .ok()
            .and_then(|req| req.server_id.as_deref())
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4)
            .to_string();

        // Redeliveries carry the same key, so they are recognized here.
        let dedup_key = decoded
            .as_ref()
            .ok()
            .and_then(|req| req.request_id.clone().or_else(|| req.server_id.clone()));
        let duplicate = match &dedup_key {
            Some(key) => !self.claim(key),
            None => false,
        };
        if duplicate {
            self.commit(&delivery).await;
            return;
        }

        self.emit(
            EventKind::CreateStarted,
            ProgressEvent::new(&server_id, EventStatus::Building, "", "server creation started"),
        )
        .await;

        let request = match decoded {
            Ok(request) => request,
            Err(e) => {
                error!(%server_id, error = %e, "malformed provisioning request");
                self.emit(
                    EventKind::CreateFailed,
                    ProgressEvent::new(
                        &server_id,
                        EventStatus::Failed,
                        Stage::Decoding.as_str(),
                        format!("failed to decode server request: {e}"),
                    ),
                )
                .await;
                self.commit(&delivery).await;
                return;
            }
        };

        info!(
            %server_id,
            server_type = %request.server_type,
            plan = %request.plan_type,
            "provisioning server"
        );

        match self.orchestrator.provision(&server_id, request).await {
            Ok(state) => {
                self.counters.live.fetch_add(1, Ordering::SeqCst);
                self.settle(dedup_key, Some(&server_id));
                let port = state.host_port.unwrap_or_default();
                info!(%server_id, port, "server created");
                self.emit(
                    EventKind::CreateSuccess,
                    ProgressEvent::new(
                        &server_id,
                        EventStatus::Completed,
                        Stage::Ready.as_str(),
                        format!("server ready on port {port}"),
                    ),
                )
                .await;
            }
            Err(failure) => {
                self.settle(dedup_key, None);
                error!(%server_id, stage = %failure.stage, error = %failure.error, "server build failed");
                self.emit(
                    EventKind::CreateFailed,
                    ProgressEvent::new(
                        &server_id,
                        EventStatus::Failed,
                        failure.stage.as_str(),
                        failure.error.to_string(),
                    ),
                )
                .await;
            }
        }

        self.commit(&delivery).await;
    }

    /// Record `key` as in flight. False when it is already known.
    fn claim(&self, key: &str) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        match requests.get(key) {
            Some(RequestState::InFlight) => {
                info!(key, "duplicate request, original still in flight");
                return false;
            }
            Some(RequestState::Provisioned { server_id }) => {
                info!(key, %server_id, "duplicate request, already provisioned");
                return false;
            }
            None => {}
        }
        requests.insert(key.to_string(), RequestState::InFlight);
        true
    }

    /// Failed requests are forgotten so a redelivery may try again.
    fn settle(&self, key: Option<String>, server_id: Option<&str>) {
        let Some(key) = key else {
            return;
        };
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        match server_id {
            Some(server_id) => {
                requests.insert(
                    key,
                    RequestState::Provisioned {
                        server_id: server_id.to_string(),
                    },
                );
            }
            None => {
                requests.remove(&key);
            }
        }
    }

    async fn emit(&self, kind: EventKind, event: ProgressEvent) {
        self.publisher.publish(kind, event).await;
    }

    async fn commit(&self, delivery: &Delivery) {
        if let Err(e) = self.source.commit(delivery).await {
            warn!(error = %e, "failed to commit message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::recording::RecordingPublisher;
    use crate::queue::MemoryQueue;
    use ms_infra::testing::{MockEngine, StubArtifacts, request};

    const READY: &str = "Done (1.0s)! For help, type \"help\"";

    struct Harness {
        queue: Arc<MemoryQueue>,
        engine: Arc<MockEngine>,
        events: Arc<RecordingPublisher>,
        worker: Arc<Worker>,
    }

    fn harness(limits: WorkerLimits) -> Harness {
        let queue = Arc::new(MemoryQueue::new());
        let engine = Arc::new(MockEngine::new());
        engine.script_logs([READY]);
        let events = Arc::new(RecordingPublisher::default());
        let orchestrator = Arc::new(Orchestrator::new(
            engine.clone(),
            Arc::new(StubArtifacts::new()),
            Duration::from_secs(30),
        ));
        let worker = Arc::new(Worker::new(queue.clone(), orchestrator, events.clone(), limits));
        Harness {
            queue,
            engine,
            events,
            worker,
        }
    }

    fn limits(builds: usize, alive: usize) -> WorkerLimits {
        WorkerLimits {
            max_concurrent_builds: builds,
            max_alive_servers: alive,
        }
    }

    async fn wait_for_commits(queue: &MemoryQueue, n: usize) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while queue.committed().len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("messages were not committed in time");
    }

    fn payload(req: &ProvisionRequest) -> Vec<u8> {
        serde_json::to_vec(req).unwrap()
    }

    #[test]
    fn build_slots_are_bounded_and_released_on_drop() {
        let h = harness(limits(2, 10));

        let a = h.worker.admit().expect("first slot");
        let _b = h.worker.admit().expect("second slot");
        assert!(h.worker.admit().is_none());
        assert_eq!(h.worker.builds_in_flight(), 2);

        drop(a);
        assert!(h.worker.admit().is_some());
    }

    #[test]
    fn live_server_limit_blocks_admission() {
        let h = harness(limits(2, 1));
        h.worker.counters.live.store(1, Ordering::SeqCst);
        assert!(h.worker.admit().is_none());
        assert_eq!(h.worker.builds_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_request_emits_started_then_success() {
        let h = harness(limits(2, 10));
        h.queue.push(CREATE_KEY, payload(&request("paper", "1.20.1", "free")));
        tokio::spawn(h.worker.clone().run());

        wait_for_commits(&h.queue, 1).await;

        let kinds = h.events.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::CreateStarted));
        assert_eq!(kinds.last(), Some(&EventKind::CreateSuccess));
        assert_eq!(kinds.len(), 2);

        let (_, last) = h.events.events().pop().unwrap();
        assert_eq!(last.status, EventStatus::Completed);
        assert_eq!(h.worker.live_servers(), 1);
        assert_eq!(h.worker.builds_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_committed_with_decoding_failure() {
        let h = harness(limits(2, 10));
        h.queue.push(CREATE_KEY, b"{not json".to_vec());
        tokio::spawn(h.worker.clone().run());

        wait_for_commits(&h.queue, 1).await;

        let events = h.events.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, EventKind::CreateStarted);
        assert_eq!(events[1].0, EventKind::CreateFailed);
        assert_eq!(events[1].1.stage, "decoding");
        assert_eq!(events[0].1.server_id, events[1].1.server_id);
        assert!(h.engine.created_specs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_reports_stage() {
        let h = harness(limits(2, 10));
        h.engine.fail_builds(true);
        h.queue.push(CREATE_KEY, payload(&request("vanilla", "1.20.1", "free")));
        tokio::spawn(h.worker.clone().run());

        wait_for_commits(&h.queue, 1).await;

        let (kind, event) = h.events.events().pop().unwrap();
        assert_eq!(kind, EventKind::CreateFailed);
        assert_eq!(event.stage, "building_image");
        assert_eq!(h.worker.live_servers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_keys_are_committed_without_events() {
        let h = harness(limits(2, 10));
        h.queue.push("server.delete", b"{}".to_vec());
        tokio::spawn(h.worker.clone().run());

        wait_for_commits(&h.queue, 1).await;
        assert!(h.events.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_worker_leaves_message_uncommitted() {
        let h = harness(limits(2, 0));
        h.queue.push(CREATE_KEY, payload(&request("paper", "1.20.1", "free")));
        tokio::spawn(h.worker.clone().run());

        tokio::time::sleep(ADMISSION_BACKOFF * 2 + Duration::from_secs(1)).await;

        assert!(h.queue.committed().is_empty());
        assert_eq!(h.queue.pending(), 1);
        assert!(h.events.events().is_empty());
    }

    /// Memory queue whose `release` always fails.
    #[derive(Default)]
    struct StuckRelease {
        queue: MemoryQueue,
        releases: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageSource for StuckRelease {
        async fn next(&self) -> Result<Delivery, QueueError> {
            self.queue.next().await
        }

        async fn commit(&self, delivery: &Delivery) -> Result<(), QueueError> {
            self.queue.commit(delivery).await
        }

        async fn release(&self, _delivery: Delivery) -> Result<(), QueueError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::Broker("seek failed".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn release_failure_keeps_the_worker_running() {
        let source = Arc::new(StuckRelease::default());
        source.queue.push(CREATE_KEY, payload(&request("paper", "1.20.1", "free")));
        source.queue.push(CREATE_KEY, payload(&request("paper", "1.20.1", "free")));

        let h = harness(limits(2, 0));
        let worker = Arc::new(Worker::new(
            source.clone(),
            h.worker.orchestrator.clone(),
            h.events.clone(),
            limits(2, 0),
        ));
        let running = tokio::spawn(worker.run());

        tokio::time::sleep(ADMISSION_BACKOFF * 2 + Duration::from_secs(1)).await;

        assert_eq!(source.releases.load(Ordering::SeqCst), 2);
        assert!(!running.is_finished());
        assert!(h.events.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn intake_server_id_names_the_server() {
        let h = harness(limits(2, 10));
        let server_id = Uuid::new_v4().to_string();
        let mut req = request("paper", "1.20.1", "free");
        req.server_id = Some(server_id.clone());
        h.queue.push(CREATE_KEY, payload(&req));
        h.queue.push(CREATE_KEY, payload(&req));
        tokio::spawn(h.worker.clone().run());

        wait_for_commits(&h.queue, 2).await;

        let created = h.engine.created_specs();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, format!("ms-{server_id}"));
        assert!(h.events.events().iter().all(|(_, e)| e.server_id == server_id));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_server_id_is_replaced() {
        let h = harness(limits(2, 10));
        let mut req = request("paper", "1.20.1", "free");
        req.server_id = Some("../escape".into());
        h.queue.push(CREATE_KEY, payload(&req));
        tokio::spawn(h.worker.clone().run());

        wait_for_commits(&h.queue, 1).await;

        let (_, last) = h.events.events().pop().unwrap();
        assert_eq!(last.status, EventStatus::Completed);
        assert!(Uuid::parse_str(&last.server_id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_request_id_provisions_once() {
        let h = harness(limits(1, 10));
        let mut req = request("paper", "1.20.1", "free");
        req.request_id = Some("req-42".into());
        h.queue.push(CREATE_KEY, payload(&req));
        h.queue.push(CREATE_KEY, payload(&req));
        tokio::spawn(h.worker.clone().run());

        wait_for_commits(&h.queue, 2).await;

        assert_eq!(h.engine.created_specs().len(), 1);
        assert_eq!(h.worker.live_servers(), 1);
    }
}
