//! Adaptive per-flow QoS control plane: observes declared UDP customer
//! flows across a set of OpenFlow/OVSDB switches and continuously reshapes
//! their rate limits so idle flows yield bandwidth to active ones.
//!
//! The crate is organized leaves-first: [`flow`] and [`config`] define the
//! value types everything else builds on; [`qos`] programs switch state;
//! [`controller`] is the adaptation algorithm; [`concurrency`] serializes
//! access to [`qos::QosManager`]; [`orchestrator`] wires the lifecycle loops
//! and event handling together.

pub mod concurrency;
pub mod config;
pub mod controller;
pub mod error;
pub mod flow;
pub mod orchestrator;
pub mod qos;

pub use error::{Error, Result};
