//! Stockpipe Core: statement builder, relational stores, checkpointing and
//! the data collaborators of the SSI market-data crawler.
//!
//! This crate contains everything below the crawl orchestrator:
//! - T-SQL statement builder with bound parameters (DDL, DML, MERGE)
//! - `Store` trait with a SQL Server backend and an in-process backend
//! - Table definitions of the crawl database and the checkpoint row
//! - InfluxDB v2 time-series collaborator
//! - SSI FastConnect market-data collaborator, pacing and circuit breaker

pub mod checkpoint;
pub mod market;
pub mod schema;
pub mod sql;
pub mod store;
pub mod timeseries;
