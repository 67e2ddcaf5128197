pub mod clock;
pub mod config;
pub mod engine;
pub mod identity;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod scheduler;
pub mod transition;
pub mod wal;
