//! Spreadsheet to PDF conversion service.
//!
//! Conversions run either synchronously inside an HTTP request or
//! asynchronously through a job queue consumed by a worker pool. Results are
//! written to a shared directory and discovered by polling for the expected
//! output file.
//!
//! ## Module Overview
//!
//! - `storage`: shared directory, filename sanitizing, atomic commits
//! - `converter`: conversion engine capability and the timeout-bounded invoker
//! - `job`: queue message model
//! - `queue`: Redis reliable queue and in-memory queue
//! - `worker`: worker pool and per-message settlement
//! - `service`: request-facing operations (convert, enqueue, poll, delete)
//! - `auth`, `server`: HTTP surface behind basic authentication
//! - `config`, `error`, `telemetry`: environment configuration, error
//!   taxonomy, logging and OpenTelemetry spans

pub mod auth;
pub mod config;
pub mod converter;
pub mod error;
pub mod job;
pub mod queue;
pub mod server;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod worker;
