//! # Scheduler del Nodo
//! src/jobs/scheduler.rs
//!
//! Dueño de los slots de ejecución de un nodo. Las reglas:
//!
//! - `submit`: si hay slot libre arranca el executor ya; si no, el item va a
//!   la cola compartida (o al backlog local si la cola no responde).
//! - Los executors no tocan el estado del scheduler: emiten eventos por un
//!   canal y un único thread (el event loop) los consume.
//! - Un slot se libera sacando el job del mapa `running`; quien no lo
//!   encuentra no libera nada, así cada slot se libera exactamente una vez
//!   aunque compitan la terminación normal y la forzada.
//! - Todo arranque desde cola pasa por [`Inner::try_start_next`], que corre
//!   al terminar un job y en cada tick del drenado periódico. Un item sacado
//!   de la cola entra a `running` antes de chequearlo o lanzarlo, para que
//!   una cancelación nunca lo encuentre fuera de todo registro.
//!
//! ## Terminación forzada
//!
//! Un thread no se puede matar desde afuera. Pasada la gracia de cancelación
//! el scheduler desvincula el executor: libera su slot, marca el job
//! `Cancelled` y descarta cualquier evento posterior de ese executor, que
//! termina solo en su siguiente chequeo del token.

use crate::error::{ClusterError, Result};
use crate::jobs::aggregator::Aggregator;
use crate::jobs::executor::{self, CancellationToken, ExecEvent, ExecutorConfig, WorkUnit};
use crate::jobs::peer::CancelOutcome;
use crate::jobs::queue::OverflowQueue;
use crate::jobs::storage::JobStore;
use crate::jobs::types::{JobUpdate, WorkItem};
use crate::metrics::MetricsCollector;
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub node_name: String,
    /// Dirección de este nodo; los items con otro `home` son ajenos
    pub own_addr: String,
    pub max_concurrent: usize,
    pub drain_interval: Duration,
    pub cancel_grace: Duration,
}

impl SchedulerConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            node_name: config.node_name.clone(),
            own_addr: config.advertised_address(),
            max_concurrent: config.max_concurrent,
            drain_interval: Duration::from_millis(config.drain_interval_ms),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
        }
    }
}

/// Resultado de `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Immediate,
    /// `position` es el largo de la cola tras encolar
    Queued { position: usize },
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Immediate => "immediate",
            Admission::Queued { .. } => "queued",
        }
    }

    pub fn position(&self) -> Option<usize> {
        match self {
            Admission::Immediate => None,
            Admission::Queued { position } => Some(*position),
        }
    }
}

enum SchedulerEvent {
    Exec(ExecEvent),
    /// Venció la gracia de una cancelación
    ForceCancel(String),
    Shutdown,
}

struct RunningJob {
    item: WorkItem,
    token: CancellationToken,
}

#[derive(Default)]
struct SlotState {
    running: HashMap<String, RunningJob>,
    /// Slots apartados mientras se busca el próximo item
    reserved: usize,
    acquired: u64,
    released: u64,
}

impl SlotState {
    fn has_free_slot(&self, max: usize) -> bool {
        self.running.len() + self.reserved < max
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub running_count: usize,
    pub max_concurrent: usize,
    pub running_jobs: Vec<String>,
    pub backlog: usize,
    pub slots_acquired: u64,
    pub slots_released: u64,
}

struct Inner {
    config: SchedulerConfig,
    executor: ExecutorConfig,
    state: Mutex<SlotState>,
    /// Items que no pudieron subir a la cola compartida
    backlog: Mutex<VecDeque<WorkItem>>,
    queue: Arc<dyn OverflowQueue>,
    store: Arc<dyn JobStore>,
    aggregator: Aggregator,
    metrics: MetricsCollector,
    events: Sender<SchedulerEvent>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Crea el scheduler y arranca su event loop
    pub fn start(
        config: SchedulerConfig,
        executor: ExecutorConfig,
        queue: Arc<dyn OverflowQueue>,
        store: Arc<dyn JobStore>,
        aggregator: Aggregator,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let (tx, rx) = unbounded();
        let inner = Arc::new(Inner {
            config,
            executor,
            state: Mutex::new(SlotState::default()),
            backlog: Mutex::new(VecDeque::new()),
            queue,
            store,
            aggregator,
            metrics,
            events: tx,
        });

        let loop_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("scheduler-{}", inner.config.node_name))
            .spawn(move || loop_inner.event_loop(rx))?;

        tracing::info!(
            node = %inner.config.node_name,
            slots = inner.config.max_concurrent,
            drain_ms = inner.config.drain_interval.as_millis() as u64,
            "scheduler started"
        );
        Ok(Self {
            inner,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    /// Admite un item: lo arranca si hay slot, si no lo encola
    pub fn submit(&self, item: WorkItem) -> Result<Admission> {
        let slot = {
            let mut state = self.inner.state.lock();
            if state.has_free_slot(self.inner.config.max_concurrent) {
                state.reserved += 1;
                true
            } else {
                false
            }
        };

        if slot {
            self.inner.launch(item)?;
            return Ok(Admission::Immediate);
        }

        let job_id = item.job_id.clone();
        match self.inner.queue.push(item.clone()) {
            Ok(position) => {
                tracing::info!(job_id = %job_id, position, "no free slot, job queued");
                Ok(Admission::Queued { position })
            }
            Err(e @ ClusterError::QueueFull(_)) => Err(e),
            Err(e) => {
                let mut backlog = self.inner.backlog.lock();
                backlog.push_back(item);
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    backlog = backlog.len(),
                    "shared queue unavailable, job kept in local backlog"
                );
                Ok(Admission::Queued {
                    position: backlog.len(),
                })
            }
        }
    }

    /// Detiene o quita un job de este nodo
    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        self.inner.cancel(job_id)
    }

    pub fn stats(&self) -> SchedulerStats {
        let backlog = self.inner.backlog.lock().len();
        let state = self.inner.state.lock();
        let mut running_jobs: Vec<String> = state.running.keys().cloned().collect();
        running_jobs.sort();
        SchedulerStats {
            running_count: state.running.len(),
            max_concurrent: self.inner.config.max_concurrent,
            running_jobs,
            backlog,
            slots_acquired: state.acquired,
            slots_released: state.released,
        }
    }

    /// Cancela lo que esté corriendo y detiene el event loop
    pub fn shutdown(&self) {
        for running in self.inner.state.lock().running.values() {
            running.token.cancel();
        }
        let _ = self.inner.events.send(SchedulerEvent::Shutdown);
        if let Some(handle) = self.event_loop.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Inner {
    fn event_loop(&self, events: Receiver<SchedulerEvent>) {
        let ticker = tick(self.config.drain_interval);
        loop {
            select! {
                recv(events) -> msg => match msg {
                    Ok(SchedulerEvent::Exec(event)) => self.handle_exec(event),
                    Ok(SchedulerEvent::ForceCancel(job_id)) => self.force_cancel(&job_id),
                    Ok(SchedulerEvent::Shutdown) | Err(_) => break,
                },
                recv(ticker) -> _ => self.try_start_next(),
            }
        }
        tracing::info!(node = %self.config.node_name, "scheduler stopped");
    }

    /// Convierte una reserva en un job corriendo y lanza su executor
    fn launch(&self, item: WorkItem) -> Result<()> {
        let token = self.claim(&item);
        self.start_claimed(item, token)
    }

    /// Pasa la reserva a `running`; desde aquí una cancelación lo encuentra
    fn claim(&self, item: &WorkItem) -> CancellationToken {
        let token = CancellationToken::new();
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        state.acquired += 1;
        state.running.insert(
            item.job_id.clone(),
            RunningJob {
                item: item.clone(),
                token: token.clone(),
            },
        );
        token
    }

    fn start_claimed(&self, item: WorkItem, token: CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            if self.release(&item.job_id).is_some() {
                tracing::info!(job_id = %item.job_id, "job cancelled before its executor started");
                self.aggregator.enqueue_for(&item, JobUpdate::Cancelled);
            }
            return Ok(());
        }

        tracing::info!(
            job_id = %item.job_id,
            kind = ?item.kind,
            range = %item.range,
            home = %item.home,
            "job started"
        );
        self.aggregator.enqueue_for(
            &item,
            JobUpdate::Started {
                node: self.config.node_name.clone(),
            },
        );

        let events = self.events.clone();
        let unit = WorkUnit {
            job_id: item.job_id.clone(),
            range: item.range,
            seed: item.seed.clone(),
        };
        match executor::spawn(&self.executor, unit, token, move |event| {
            let _ = events.send(SchedulerEvent::Exec(event));
        }) {
            Ok(_detached) => Ok(()),
            Err(e) => {
                tracing::error!(job_id = %item.job_id, error = %e, "executor could not be started");
                self.release(&item.job_id);
                self.aggregator.enqueue_for(
                    &item,
                    JobUpdate::Failed {
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Saca el job del mapa; `None` si ya se había liberado
    fn release(&self, job_id: &str) -> Option<RunningJob> {
        let mut state = self.state.lock();
        let running = state.running.remove(job_id)?;
        state.released += 1;
        Some(running)
    }

    fn handle_exec(&self, event: ExecEvent) {
        let job_id = event.job_id().to_string();
        let node = self.config.node_name.clone();

        if !event.is_terminal() {
            let item = self.state.lock().running.get(&job_id).map(|r| r.item.clone());
            match item {
                Some(item) => self.aggregator.enqueue_for(&item, Self::to_update(node, event)),
                None => tracing::debug!(job_id = %job_id, "progress from detached executor ignored"),
            }
            return;
        }

        match self.release(&job_id) {
            Some(running) => {
                self.aggregator
                    .enqueue_for(&running.item, Self::to_update(node, event));
                self.try_start_next();
            }
            None => {
                tracing::debug!(job_id = %job_id, "terminal event for released slot ignored");
            }
        }
    }

    fn to_update(node: String, event: ExecEvent) -> JobUpdate {
        match event {
            ExecEvent::Progress {
                percent,
                value,
                step,
                ..
            } => JobUpdate::Progress {
                node,
                percent,
                value,
                step,
            },
            ExecEvent::Done { result, .. } => JobUpdate::Completed { node, result },
            ExecEvent::Failed { reason, .. } => JobUpdate::Failed { reason },
            ExecEvent::Cancelled { .. } => JobUpdate::Cancelled,
        }
    }

    fn force_cancel(&self, job_id: &str) {
        if let Some(running) = self.release(job_id) {
            tracing::warn!(
                job_id = %job_id,
                grace_ms = self.config.cancel_grace.as_millis() as u64,
                "executor ignored cancellation, slot reclaimed"
            );
            self.metrics.record_forced_termination();
            self.aggregator.enqueue_for(&running.item, JobUpdate::Cancelled);
            self.try_start_next();
        }
    }

    fn cancel(&self, job_id: &str) -> CancelOutcome {
        let token = self
            .state
            .lock()
            .running
            .get(job_id)
            .map(|r| r.token.clone());
        if let Some(token) = token {
            token.cancel();
            self.arm_grace_timer(job_id);
            tracing::info!(job_id = %job_id, "cancellation signalled");
            return CancelOutcome::Signalled;
        }

        {
            let mut backlog = self.backlog.lock();
            if let Some(pos) = backlog.iter().position(|i| i.job_id == job_id) {
                backlog.remove(pos);
                tracing::info!(job_id = %job_id, "queued job removed from backlog");
                return CancelOutcome::Removed;
            }
        }

        match self.queue.remove(job_id) {
            Ok(true) => {
                tracing::info!(job_id = %job_id, "queued job removed from shared queue");
                CancelOutcome::Removed
            }
            Ok(false) => CancelOutcome::NotHere,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "shared queue unavailable during cancel");
                CancelOutcome::NotHere
            }
        }
    }

    fn arm_grace_timer(&self, job_id: &str) {
        let events = self.events.clone();
        let id = job_id.to_string();
        let grace = self.config.cancel_grace;
        let spawned = thread::Builder::new()
            .name(format!("grace-{}", job_id))
            .spawn(move || {
                thread::sleep(grace);
                let _ = events.send(SchedulerEvent::ForceCancel(id));
            });
        if spawned.is_err() {
            let _ = self
                .events
                .send(SchedulerEvent::ForceCancel(job_id.to_string()));
        }
    }

    /// Llena los slots libres desde el backlog y luego desde la cola compartida
    fn try_start_next(&self) {
        loop {
            {
                let mut state = self.state.lock();
                if !state.has_free_slot(self.config.max_concurrent) {
                    return;
                }
                state.reserved += 1;
            }

            let Some(item) = self.next_item() else {
                self.unreserve();
                return;
            };
            let token = self.claim(&item);

            if self.is_stale(&item) {
                tracing::debug!(job_id = %item.job_id, "skipping queued job that already finished");
                self.release(&item.job_id);
                continue;
            }

            // Un fallo de arranque ya quedó registrado en el job
            let _ = self.start_claimed(item, token);
        }
    }

    fn unreserve(&self) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
    }

    fn next_item(&self) -> Option<WorkItem> {
        if let Some(item) = self.backlog.lock().pop_front() {
            return Some(item);
        }
        match self.queue.pop_oldest() {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, "cannot poll shared queue");
                None
            }
        }
    }

    /// Items propios cuyo registro ya es terminal (o no existe) no se ejecutan
    fn is_stale(&self, item: &WorkItem) -> bool {
        if item.home != self.config.own_addr {
            return false;
        }
        self.store
            .find(&item.job_id)
            .map_or(true, |record| record.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClient;
    use crate::jobs::aggregator::FlushPolicy;
    use crate::jobs::peer::PeerClient;
    use crate::jobs::queue::LocalQueue;
    use crate::jobs::storage::JobStorage;
    use crate::jobs::types::{JobRecord, JobStatus};
    use std::time::Instant;

    const HOME: &str = "127.0.0.1:9901";

    struct Harness {
        scheduler: Scheduler,
        store: Arc<JobStorage>,
        metrics: MetricsCollector,
    }

    fn harness(max: usize, step_delay_ms: u64, queue: Arc<dyn OverflowQueue>, grace_ms: u64) -> Harness {
        let store = Arc::new(JobStorage::in_memory());
        let metrics = MetricsCollector::new();
        let aggregator = Aggregator::new(
            HOME,
            store.clone(),
            PeerClient::new(HttpClient::new("node1", Duration::from_millis(200))),
            FlushPolicy {
                retries: 3,
                retry_delay: Duration::from_millis(5),
            },
            metrics.clone(),
        );
        let scheduler = Scheduler::start(
            SchedulerConfig {
                node_name: "node1".into(),
                own_addr: HOME.into(),
                max_concurrent: max,
                drain_interval: Duration::from_millis(20),
                cancel_grace: Duration::from_millis(grace_ms),
            },
            ExecutorConfig {
                node_name: "node1".into(),
                step_delay: Duration::from_millis(step_delay_ms),
                setup_delay: Duration::ZERO,
            },
            queue,
            store.clone(),
            aggregator,
            metrics.clone(),
        )
        .unwrap();
        Harness {
            scheduler,
            store,
            metrics,
        }
    }

    fn item(h: &Harness, id: &str, n: u64) -> WorkItem {
        let record = JobRecord::single(id, n, "node1");
        h.store.create(&record).unwrap();
        WorkItem::from_record(&record, HOME)
    }

    fn wait_for(h: &Harness, id: &str, status: JobStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if h.store.find(id).map(|r| r.status) == Some(status) {
                return;
            }
            assert!(Instant::now() < deadline, "{} never reached {}", id, status);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_slots_balanced(h: &Harness) -> SchedulerStats {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = h.scheduler.stats();
            if stats.running_count == 0 && stats.slots_acquired == stats.slots_released {
                return stats;
            }
            assert!(Instant::now() < deadline, "slots never balanced: {:?}", stats);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_immediate_then_queued_then_drained() {
        let h = harness(1, 2, Arc::new(LocalQueue::new(10)), 500);
        let first = item(&h, "a", 20);
        let second = item(&h, "b", 5);

        assert_eq!(h.scheduler.submit(first).unwrap(), Admission::Immediate);
        assert_eq!(
            h.scheduler.submit(second).unwrap(),
            Admission::Queued { position: 1 }
        );

        wait_for(&h, "a", JobStatus::Completed);
        wait_for(&h, "b", JobStatus::Completed);
        assert_eq!(h.store.find("b").unwrap().accumulated_result.unwrap().to_string(), "120");

        let stats = wait_slots_balanced(&h);
        assert_eq!(stats.slots_acquired, 2);
    }

    #[test]
    fn test_cancel_queued_job_never_runs() {
        let h = harness(1, 5, Arc::new(LocalQueue::new(10)), 500);
        let first = item(&h, "a", 10);
        let second = item(&h, "b", 10);
        h.scheduler.submit(first).unwrap();
        h.scheduler.submit(second).unwrap();

        assert_eq!(h.scheduler.cancel("b"), CancelOutcome::Removed);
        wait_for(&h, "a", JobStatus::Completed);
        thread::sleep(Duration::from_millis(100));

        let b = h.store.find("b").unwrap();
        assert_eq!(b.status, JobStatus::Queued);
        assert!(b.started_at_ms.is_none());
        assert_eq!(h.scheduler.cancel("b"), CancelOutcome::NotHere);
        assert_eq!(wait_slots_balanced(&h).slots_acquired, 1);
    }

    #[test]
    fn test_cancel_running_job_reclaims_slot_once() {
        let h = harness(1, 50, Arc::new(LocalQueue::new(10)), 500);
        let job = item(&h, "a", 100);
        h.scheduler.submit(job).unwrap();
        thread::sleep(Duration::from_millis(60));

        assert_eq!(h.scheduler.cancel("a"), CancelOutcome::Signalled);
        wait_for(&h, "a", JobStatus::Cancelled);

        // Después de la gracia no se libera nada más
        thread::sleep(Duration::from_millis(600));
        let stats = wait_slots_balanced(&h);
        assert_eq!(stats.slots_acquired, 1);
        assert_eq!(stats.slots_released, 1);
        assert_eq!(h.metrics.get_snapshot().jobs.forced_terminations, 0);
    }

    #[test]
    fn test_zero_grace_races_are_counted_once() {
        let h = harness(2, 20, Arc::new(LocalQueue::new(10)), 0);
        for id in ["a", "b"] {
            let job = item(&h, id, 100);
            h.scheduler.submit(job).unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        h.scheduler.cancel("a");
        h.scheduler.cancel("b");

        wait_for(&h, "a", JobStatus::Cancelled);
        wait_for(&h, "b", JobStatus::Cancelled);
        thread::sleep(Duration::from_millis(100));
        let stats = wait_slots_balanced(&h);
        assert_eq!(stats.slots_acquired, 2);
        assert_eq!(stats.slots_released, 2);
    }

    #[test]
    fn test_queue_full_is_reported() {
        let h = harness(1, 20, Arc::new(LocalQueue::new(1)), 500);
        let a = item(&h, "a", 50);
        let b = item(&h, "b", 5);
        let c = item(&h, "c", 5);
        h.scheduler.submit(a).unwrap();
        h.scheduler.submit(b).unwrap();
        assert!(matches!(h.scheduler.submit(c), Err(ClusterError::QueueFull(1))));
        h.scheduler.cancel("a");
    }

    /// Cola que nunca responde
    struct DownQueue;

    impl OverflowQueue for DownQueue {
        fn push(&self, _item: WorkItem) -> Result<usize> {
            Err(ClusterError::PeerUnreachable {
                addr: "queue".into(),
                reason: "down".into(),
            })
        }
        fn pop_oldest(&self) -> Result<Option<WorkItem>> {
            Err(ClusterError::PeerUnreachable {
                addr: "queue".into(),
                reason: "down".into(),
            })
        }
        fn len(&self) -> Result<usize> {
            Ok(0)
        }
        fn remove(&self, _job_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_unreachable_queue_falls_back_to_backlog() {
        let h = harness(1, 2, Arc::new(DownQueue), 500);
        let a = item(&h, "a", 10);
        let b = item(&h, "b", 6);
        h.scheduler.submit(a).unwrap();
        assert_eq!(
            h.scheduler.submit(b).unwrap(),
            Admission::Queued { position: 1 }
        );
        assert_eq!(h.scheduler.stats().backlog, 1);

        wait_for(&h, "b", JobStatus::Completed);
        assert_eq!(h.scheduler.stats().backlog, 0);
    }

    #[test]
    fn test_stale_queued_item_is_skipped() {
        let h = harness(1, 5, Arc::new(LocalQueue::new(10)), 500);
        let a = item(&h, "a", 10);
        let b = item(&h, "b", 10);
        h.scheduler.submit(a).unwrap();
        h.scheduler.submit(b).unwrap();

        // El registro se cancela sin sacar el item de la cola
        let mut record = h.store.find("b").unwrap();
        record.apply(JobUpdate::Cancelled);
        h.store.save(&record).unwrap();

        wait_for(&h, "a", JobStatus::Completed);
        let stats = wait_slots_balanced(&h);
        // "b" ocupó un slot al salir de la cola, pero nunca arrancó
        assert_eq!(stats.slots_acquired, 2);
        assert!(h.store.find("b").unwrap().started_at_ms.is_none());
    }

    #[test]
    fn test_cancel_between_pop_and_start_prevents_execution() {
        let h = harness(1, 5, Arc::new(LocalQueue::new(10)), 500);
        let remote = JobRecord::single("r", 30, "node2");
        h.store.create(&remote).unwrap();
        let popped = WorkItem::from_record(&remote, HOME);

        h.scheduler.inner.state.lock().reserved += 1;
        let token = h.scheduler.inner.claim(&popped);
        assert_eq!(h.scheduler.stats().running_jobs, vec!["r".to_string()]);

        assert_eq!(h.scheduler.cancel("r"), CancelOutcome::Signalled);
        h.scheduler.inner.start_claimed(popped, token).unwrap();

        wait_for(&h, "r", JobStatus::Cancelled);
        let record = h.store.find("r").unwrap();
        assert!(record.started_at_ms.is_none());
        assert!(record.accumulated_result.is_none());

        thread::sleep(Duration::from_millis(600));
        let stats = wait_slots_balanced(&h);
        assert_eq!(stats.slots_acquired, 1);
        assert_eq!(stats.slots_released, 1);
        assert_eq!(h.metrics.get_snapshot().jobs.forced_terminations, 0);
    }
}
