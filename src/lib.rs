pub mod config;
pub mod errors;
pub mod metadata;
pub mod models;
pub mod pathmap;
pub mod playlist;
pub mod proxy;
pub mod streaming;
pub mod web;
