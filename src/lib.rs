pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod models;
pub mod registry;
pub mod service;
pub mod store;
pub mod stream;
