pub mod admin;
pub mod candidates;
pub mod dnm;
pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;
