pub mod campaign;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod server;
