pub mod analysis;
pub mod clock;
pub mod compression;
pub mod counter_store;
pub mod health_monitor;
pub mod image_validation;
pub mod inference;
pub mod rate_limit;
pub mod recovery;
