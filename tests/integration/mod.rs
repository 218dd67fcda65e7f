//! Integration tests for sqljson-gateway.
//!
//! The database tests require a running MySQL or PostgreSQL server.
//! Set DATABASE_URL environment variable to run them.

pub mod encode_test;
pub mod fcgi_test;
pub mod query_test;
