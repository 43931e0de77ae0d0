pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod http;
pub mod ingest;
pub mod metrics;
pub mod publish;
pub mod rest;
pub mod runtime;
