//! Ideaworks — asynchronous generation-job orchestration.
//!
//! A user describes a business idea; external AI generators asynchronously
//! produce derived documents (Lean Canvas, requirements docs, workflows).
//! This crate is the orchestration core: it creates generation jobs,
//! dispatches them to external generators, reconciles results arriving via
//! webhook callback or client polling, force-terminates stuck jobs, and
//! pushes status transitions to subscribers over WebSocket — all behind a
//! tenant-scoped storage gateway.

pub mod api;
pub mod config;
pub mod errors;
pub mod events;
pub mod generate;
pub mod reconcile;
pub mod server;
pub mod store;
pub mod sweeper;
