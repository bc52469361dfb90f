//! agentguard-http: health probes for remote agent servers.
//!
//! [`ProbeClient`] composes the `agentguard-core` policies around a
//! `reqwest` GET against an agent's health endpoint.

pub mod client;

pub use client::{dependency_name, HealthStatus, ProbeClient, ProbeConfig, ProbeReport};
