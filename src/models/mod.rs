pub mod candidate;
pub mod dnm;
pub mod job;
pub mod record;
