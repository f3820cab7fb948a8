pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod ingest;
pub mod notify;
pub mod repo;
pub mod telemetry;
