//! sqljson-gateway - serves the rows of a SQL query as JSON over FastCGI.
//!
//! This library exposes the core modules for use in integration tests.

pub mod cli;
pub mod config;
pub mod db;
pub mod encode;
pub mod error;
pub mod fcgi;
pub mod gateway;
pub mod logging;
pub mod safety;
