pub mod config;
pub mod db;
pub mod diff;
pub mod drive;
pub mod error;
pub mod model;
pub mod notion;
pub mod reconcile;
pub mod recorder;
pub mod sync;
pub mod text;
