//! SCORM package ingestion and runtime tracking service.

pub mod aggregate;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod launch;
pub mod manifest;
pub mod models;
pub mod progress;
pub mod repo;
pub mod routes;
pub mod runtime;
pub mod storage;

#[cfg(test)]
mod testutil;
