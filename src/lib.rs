//! Ringmaster backend library.
//!
//! Web dashboard backend for circus-compatible process supervisor daemons:
//! refcounted RPC connections, stats fan-out to browser sessions, and UDP
//! multicast endpoint discovery.

pub mod api;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod rpc;
pub mod session;
pub mod stats;
