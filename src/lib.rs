pub mod allocator;
pub mod config;
pub mod db;
pub mod emitter;
pub mod error;
pub mod medications;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod schedule;
pub mod store;
pub mod validation;
