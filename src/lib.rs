//! # swf-monitor
//!
//! Monitoring backend for the streaming workflow testbed.
//!
//! Listens to the shared STOMP topic, tracks every STF file through the
//! agent pipeline in Postgres, and fans live events out to dashboard
//! subscribers over server-sent events.

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod model;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod tracker;
pub mod web;
