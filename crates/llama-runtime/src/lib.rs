//! # llama-runtime
//!
//! Runtime pieces for llama-serve: a deterministic reference implementation
//! of the `llama-engine` compute traits, and telemetry hooks (TTFT, tok/s).
//!
//! The reference backend reads a small JSON model card instead of real
//! weights. It keeps a real KV cell table per context, so cache reuse and
//! clearing behave the way a native backend does, and it records every
//! load/free into a shared [`BackendLog`] so ownership can be audited.

pub mod reference;
pub mod telemetry;

pub use reference::{BackendEvent, BackendLog, ModelCard, ReferenceBackend};
pub use telemetry::{
    InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, SequenceKind, TelemetryHook,
};
