pub mod args;
pub mod database;
pub mod error;
pub mod ingest;
pub mod model;
pub mod utils;
