//! # Collector de Métricas
//! src/metrics/collector.rs
//!
//! Métricas del nodo: requests HTTP (contadores, latencias) y decisiones del
//! planificador (admisiones, fallbacks al nodo local, terminaciones forzadas).

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Máximo de latencias guardadas para calcular percentiles
const MAX_LATENCIES: usize = 10_000;

/// Collector de métricas thread-safe
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<RequestData>>,
    jobs: Arc<JobCounters>,
    start_time: Instant,
}

struct RequestData {
    total_requests: u64,
    status_codes: HashMap<u16, u64>,
    /// Latencias en microsegundos (ventana deslizante)
    latencies: Vec<u64>,
    requests_per_path: HashMap<String, u64>,
    active_threads: u64,
}

/// Contadores del planificador
#[derive(Default)]
struct JobCounters {
    immediate: AtomicU64,
    queued: AtomicU64,
    distributed: AtomicU64,
    peer_fallbacks: AtomicU64,
    forced_terminations: AtomicU64,
    dropped_updates: AtomicU64,
}

/// Evento de admisión que se cuenta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    Immediate,
    Queued,
    Distributed,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RequestData {
                total_requests: 0,
                status_codes: HashMap::new(),
                latencies: Vec::with_capacity(1024),
                requests_per_path: HashMap::new(),
                active_threads: 0,
            })),
            jobs: Arc::new(JobCounters::default()),
            start_time: Instant::now(),
        }
    }

    /// Registra un request atendido
    pub fn record_request(&self, path: &str, status_code: u16, latency: Duration) {
        let mut data = self.inner.lock();
        data.total_requests += 1;
        *data.status_codes.entry(status_code).or_insert(0) += 1;

        if data.latencies.len() >= MAX_LATENCIES {
            data.latencies.remove(0);
        }
        data.latencies.push(latency.as_micros() as u64);

        *data.requests_per_path.entry(path.to_string()).or_insert(0) += 1;
    }

    pub fn increment_active_threads(&self) {
        self.inner.lock().active_threads += 1;
    }

    pub fn decrement_active_threads(&self) {
        let mut data = self.inner.lock();
        data.active_threads = data.active_threads.saturating_sub(1);
    }

    pub fn active_threads(&self) -> u64 {
        self.inner.lock().active_threads
    }

    pub fn record_admission(&self, kind: AdmissionKind) {
        let counter = match kind {
            AdmissionKind::Immediate => &self.jobs.immediate,
            AdmissionKind::Queued => &self.jobs.queued,
            AdmissionKind::Distributed => &self.jobs.distributed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Una parte que iba al peer terminó corriendo en este nodo
    pub fn record_peer_fallback(&self) {
        self.jobs.peer_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_termination(&self) {
        self.jobs.forced_terminations.fetch_add(1, Ordering::Relaxed);
    }

    /// Un update agotó sus reintentos y se descartó
    pub fn record_dropped_update(&self) {
        self.jobs.dropped_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Calcula percentiles (p50, p95, p99) y promedio
    fn calculate_percentiles(latencies: &[u64]) -> (u64, u64, u64, u64) {
        if latencies.is_empty() {
            return (0, 0, 0, 0);
        }

        let mut sorted = latencies.to_vec();
        sorted.sort_unstable();

        let len = sorted.len();
        let p50 = sorted[len * 50 / 100];
        let p95 = sorted[len * 95 / 100];
        let p99 = sorted[len * 99 / 100];
        let avg = sorted.iter().sum::<u64>() / len as u64;

        (p50, p95, p99, avg)
    }

    /// Snapshot serializable, es lo que devuelve `GET /metrics`
    pub fn get_snapshot(&self) -> MetricsSnapshot {
        let data = self.inner.lock();
        let (p50, p95, p99, avg) = Self::calculate_percentiles(&data.latencies);

        let mut paths: Vec<PathCount> = data
            .requests_per_path
            .iter()
            .map(|(path, count)| PathCount {
                path: path.clone(),
                count: *count,
            })
            .collect();
        paths.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        paths.truncate(10);

        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            total_requests: data.total_requests,
            active_threads: data.active_threads,
            status_codes: data
                .status_codes
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
            top_paths: paths,
            latency_us: LatencySummary {
                p50,
                p95,
                p99,
                avg,
                samples: data.latencies.len(),
            },
            jobs: JobCountersSnapshot {
                admitted_immediate: self.jobs.immediate.load(Ordering::Relaxed),
                admitted_queued: self.jobs.queued.load(Ordering::Relaxed),
                admitted_distributed: self.jobs.distributed.load(Ordering::Relaxed),
                peer_fallbacks: self.jobs.peer_fallbacks.load(Ordering::Relaxed),
                forced_terminations: self.jobs.forced_terminations.load(Ordering::Relaxed),
                dropped_updates: self.jobs.dropped_updates.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub active_threads: u64,
    pub status_codes: HashMap<String, u64>,
    pub top_paths: Vec<PathCount>,
    pub latency_us: LatencySummary,
    pub jobs: JobCountersSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathCount {
    pub path: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub avg: u64,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCountersSnapshot {
    pub admitted_immediate: u64,
    pub admitted_queued: u64,
    pub admitted_distributed: u64,
    pub peer_fallbacks: u64,
    pub forced_terminations: u64,
    pub dropped_updates: u64,
}
