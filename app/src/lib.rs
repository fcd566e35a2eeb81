//! # Flashsale
//!
//! The application crate: admission service, materialization worker, HTTP
//! surface and wiring.
//!
//! The split mirrors the two halves of the pipeline:
//!
//! - [`admission`]: the synchronous hot path behind `POST /seckill/{id}`
//! - [`worker`]: the asynchronous consumer that turns admitted messages into
//!   durable order rows
//! - [`server`]: axum routes and the HTTP error mapping
//! - [`config`]: environment-based configuration

pub mod admission;
pub mod config;
pub mod server;
pub mod worker;

pub use admission::SeckillService;
pub use config::Config;
pub use worker::OrderWorker;
