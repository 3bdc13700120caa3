pub mod criteria;
pub mod dnm;
pub mod duplicates;
pub mod export;
pub mod identifier;
pub mod progress;
pub mod provider;
pub mod purge;
pub mod scheduler;
pub mod sequence;
pub mod store;
pub mod submission;
pub mod worker;
