//! Agricultural Vision Job Queue
//!
//! GPU-aware job queue for pest detection and plant disease diagnosis.
//! Uploaded images are analysed asynchronously by a worker pool that shares
//! a fixed VRAM budget between a YOLO detector and a vision-language model.

pub mod app_state;
pub mod clock;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
