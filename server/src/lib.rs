//! Huddle realtime server library.
//! Exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod keyed_lock;
pub mod push;
pub mod routes;
pub mod state;
pub mod ws;
