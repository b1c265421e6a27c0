//! Core library entry point that wires together the PharmaGenie subsystems.
//!
//! - [`ai`] keeps the provider catalogue, stored credentials and the chat backend.
//! - [`model_manager`] walks the provider fallback chain for every chat call.
//! - [`agents`] wraps the public biomedical data sources.
//! - [`briefing`] assembles, summarises and stores per-drug reports.
//! - [`workers`] runs batches of reports as tracked jobs.
//! - [`api`] exposes the JSON HTTP surface.
//! - [`db`] initialises the SQLite database and applies migrations.
//! - [`config`] reads the environment once into an [`config::AppConfig`].
//! - [`errors`] keeps the central error catalogue with human friendly metadata.
//! - [`logging`] writes structured diagnostics to the event log table.
//! - [`cache`] memoises data-source responses.

pub mod agents;
pub mod ai;
pub mod api;
pub mod briefing;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod model_manager;
pub mod workers;
