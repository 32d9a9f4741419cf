//! Error type definitions for the scene proxy.
//!
//! This module defines the error types used throughout the application:
//! `StreamError` for the transcoding core, `ProxyError` for the variant
//! passthrough path, and `MetadataError` for the upstream metadata service.
//! The web layer maps each onto HTTP status codes in `web::responses`.

pub mod types;

pub use types::{MetadataError, ProxyError, StreamError};
