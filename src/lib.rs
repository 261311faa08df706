//! Altify asynchronous alt-text pipeline
//!
//! Accepts images paired with surrounding page context, stages them through
//! blob storage, a durable task table, and a work queue, and generates two
//! candidate alt strings per image on a pool of inference workers. Failed
//! deliveries are recovered through a dead-letter queue under a retry
//! budget, and the worker pool is resized from observed queue depth.

pub mod app_state;
pub mod autoscaler;
pub mod config;
pub mod db;
pub mod dlq;
pub mod error;
pub mod ingest;
pub mod models;
pub mod reconciler;
pub mod routes;
pub mod services;
pub mod worker;
