//! Photo processing pipeline and search ranking.
//!
//! A durable per-user job queue turns uploaded photos into captions,
//! embeddings and face profiles; a three-stage ranker re-orders raw
//! vector-similarity hits for a query. The HTTP API lives in `main.rs`, the
//! queue consumer in `bin/worker.rs`.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
