pub mod calendar;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod service;
pub mod stats;
pub mod sync;
