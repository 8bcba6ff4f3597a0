//! # Sistema de Métricas
//! src/metrics/mod.rs
//!
//! Recolección de métricas del nodo:
//! - Contadores de requests y latencias (p50, p95, p99)
//! - Threads de conexión activos
//! - Admisiones (immediate / queued / distributed), fallbacks y terminaciones forzadas

pub mod collector;

pub use collector::{AdmissionKind, MetricsCollector, MetricsSnapshot};
