//! # Executor de Unidades de Trabajo
//! src/jobs/executor.rs
//!
//! Ejecuta un rango de multiplicaciones en su propio thread y reporta eventos
//! por un callback:
//!
//! ```text
//! 0% → (setup) 10% → ... cada ~10% de los pasos ... → 99% → Done
//!                     ↘ Cancelled | Failed
//! ```
//!
//! La cancelación es cooperativa: el token se revisa entre multiplicaciones
//! y durante las pausas, en tramos de a lo sumo [`CANCEL_POLL`]. Después de
//! un `Cancelled` no se emite nada más.

use crate::error::{ClusterError, Result};
use crate::jobs::types::{BigValue, FactorRange};
use num_bigint::BigUint;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularidad máxima con la que se revisa la cancelación durante una pausa
pub const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Token de cancelación cooperativa
///
/// ```
/// use factorial_cluster::jobs::executor::CancellationToken;
///
/// let token = CancellationToken::new();
/// let seen_by_worker = token.clone();
/// token.cancel();
/// assert!(seen_by_worker.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Ritmo de ejecución
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub node_name: String,
    /// Pausa por multiplicación
    pub step_delay: Duration,
    /// Pausa antes del checkpoint de setup
    pub setup_delay: Duration,
}

impl ExecutorConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            node_name: config.node_name.clone(),
            step_delay: Duration::from_millis(config.step_delay_ms),
            setup_delay: Duration::from_millis(config.setup_delay_ms),
        }
    }
}

/// Evento emitido por un executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Progress {
        job_id: String,
        percent: u8,
        value: Option<BigValue>,
        step: Option<String>,
    },
    Done {
        job_id: String,
        result: BigValue,
    },
    Failed {
        job_id: String,
        reason: String,
    },
    Cancelled {
        job_id: String,
    },
}

impl ExecEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ExecEvent::Progress { job_id, .. }
            | ExecEvent::Done { job_id, .. }
            | ExecEvent::Failed { job_id, .. }
            | ExecEvent::Cancelled { job_id } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecEvent::Progress { .. })
    }
}

/// Unidad de trabajo lista para ejecutarse
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub job_id: String,
    pub range: FactorRange,
    pub seed: BigValue,
}

enum Outcome {
    Done(BigUint),
    Cancelled,
}

/// Lanza el executor en un thread nuevo
///
/// Si el thread no puede crearse retorna `ExecutorFault` sin haber emitido
/// ningún evento.
pub fn spawn<F>(
    config: &ExecutorConfig,
    unit: WorkUnit,
    token: CancellationToken,
    emit: F,
) -> Result<JoinHandle<()>>
where
    F: Fn(ExecEvent) + Send + 'static,
{
    let config = config.clone();
    let name = format!("exec-{}", unit.job_id);
    thread::Builder::new()
        .name(name)
        .spawn(move || run(&config, unit, &token, &emit))
        .map_err(|e| ClusterError::ExecutorFault(format!("cannot start executor thread: {}", e)))
}

/// Cuerpo del executor; siempre termina con exactamente un evento terminal
pub fn run<F>(config: &ExecutorConfig, unit: WorkUnit, token: &CancellationToken, emit: &F)
where
    F: Fn(ExecEvent),
{
    let job_id = unit.job_id.clone();
    let started = Instant::now();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| compute(config, &unit, token, emit)));

    let event = match outcome {
        Ok(Outcome::Done(result)) => {
            tracing::debug!(job_id = %job_id, elapsed_ms = started.elapsed().as_millis() as u64, "executor finished");
            ExecEvent::Done {
                job_id,
                result: BigValue(result),
            }
        }
        Ok(Outcome::Cancelled) => {
            tracing::debug!(job_id = %job_id, "executor acknowledged cancellation");
            ExecEvent::Cancelled { job_id }
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(job_id = %job_id, reason = %reason, "executor fault");
            ExecEvent::Failed {
                job_id,
                reason: format!("executor fault: {}", reason),
            }
        }
    };
    emit(event);
}

fn compute<F>(config: &ExecutorConfig, unit: &WorkUnit, token: &CancellationToken, emit: &F) -> Outcome
where
    F: Fn(ExecEvent),
{
    let progress = |percent: u8, value: Option<BigValue>, step: Option<String>| {
        emit(ExecEvent::Progress {
            job_id: unit.job_id.clone(),
            percent,
            value,
            step,
        })
    };

    progress(0, None, Some(format!("{} starting {}", config.node_name, unit.range)));

    if !pause(config.setup_delay, token) {
        return Outcome::Cancelled;
    }
    progress(10, None, Some("setup complete".to_string()));

    let total = unit.range.width();
    let every = (total / 10).max(1);
    let mut acc = unit.seed.as_biguint().clone();
    let mut done = 0u64;

    for k in unit.range.start..=unit.range.end {
        if token.is_cancelled() {
            return Outcome::Cancelled;
        }
        acc *= k;
        done += 1;

        if done % every == 0 || done == total {
            let percent = (10 + done * 85 / total).min(95) as u8;
            progress(
                percent,
                Some(BigValue(acc.clone())),
                Some(format!("multiplied through {}", k)),
            );
        }

        if !pause(config.step_delay, token) {
            return Outcome::Cancelled;
        }
    }

    if token.is_cancelled() {
        return Outcome::Cancelled;
    }
    progress(99, Some(BigValue(acc.clone())), Some("finalizing".to_string()));
    Outcome::Done(acc)
}

/// Duerme `total` en tramos cortos; `false` si llegó la cancelación
fn pause(total: Duration, token: &CancellationToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use num_traits::One;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            node_name: "node1".into(),
            step_delay: Duration::ZERO,
            setup_delay: Duration::ZERO,
        }
    }

    fn unit(id: &str, range: FactorRange) -> WorkUnit {
        WorkUnit {
            job_id: id.into(),
            range,
            seed: BigValue::one(),
        }
    }

    fn collect(config: &ExecutorConfig, unit: WorkUnit, token: CancellationToken) -> Vec<ExecEvent> {
        let (tx, rx) = unbounded();
        let handle = spawn(config, unit, token, move |ev| {
            let _ = tx.send(ev);
        })
        .unwrap();
        handle.join().unwrap();
        rx.try_iter().collect()
    }

    #[test]
    fn test_computes_factorial_with_progress() {
        let events = collect(&fast_config(), unit("a", FactorRange::for_target(20)), CancellationToken::new());

        let last = events.last().unwrap();
        assert_eq!(
            last,
            &ExecEvent::Done {
                job_id: "a".into(),
                result: BigValue(FactorRange::for_target(20).product()),
            }
        );

        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents[1], 10);
        assert_eq!(percents.last(), Some(&99));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        // Cadencia acotada: ~10 checkpoints, no uno por multiplicación
        assert!(percents.len() <= 14);
    }

    #[test]
    fn test_seed_and_subrange() {
        let seed = BigValue(BigUint::from(7u32));
        let events = collect(
            &fast_config(),
            WorkUnit {
                job_id: "p".into(),
                range: FactorRange::new(4, 6),
                seed,
            },
            CancellationToken::new(),
        );
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Done { result, .. }) if result.0 == BigUint::from(7u32 * 4 * 5 * 6)
        ));
    }

    #[test]
    fn test_empty_range_yields_seed() {
        let events = collect(&fast_config(), unit("zero", FactorRange::for_target(0)), CancellationToken::new());
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Done { result, .. }) if result.0 == BigUint::one()
        ));
    }

    #[test]
    fn test_cancel_before_start_emits_only_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let events = collect(&fast_config(), unit("c", FactorRange::for_target(50)), token);

        assert_eq!(events.last(), Some(&ExecEvent::Cancelled { job_id: "c".into() }));
        assert!(!events.iter().any(|e| matches!(e, ExecEvent::Done { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn test_cancel_latency_is_bounded() {
        let config = ExecutorConfig {
            node_name: "node1".into(),
            step_delay: Duration::from_secs(5),
            setup_delay: Duration::ZERO,
        };
        let token = CancellationToken::new();
        let (tx, rx) = unbounded();
        let handle = spawn(&config, unit("slow", FactorRange::for_target(100)), token.clone(), move |ev| {
            let _ = tx.send(ev);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        let cancelled_at = Instant::now();
        token.cancel();
        handle.join().unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&ExecEvent::Cancelled { job_id: "slow".into() }));
    }

    #[test]
    fn test_panic_becomes_failed_event() {
        let (tx, rx) = unbounded();
        run(
            &fast_config(),
            unit("boom", FactorRange::for_target(3)),
            &CancellationToken::new(),
            &move |ev: ExecEvent| {
                if matches!(ev, ExecEvent::Progress { percent: 10, .. }) {
                    panic!("simulated fault");
                }
                let _ = tx.send(ev);
            },
        );
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Failed { reason, .. }) if reason.contains("simulated fault")
        ));
    }
}
