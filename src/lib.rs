//! Lead batch-ingestion pipeline
//!
//! Operators submit jobs naming candidate property/owner records. A polling
//! worker claims each job, fetches the records from the lead-data provider in
//! batches, drops do-not-mail subjects, mints a unique identifier for every
//! new record and persists it, reporting progress per batch.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
