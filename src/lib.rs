//! Brute Guard - Brute-Force Mitigation Engine
//!
//! This crate decides whether an identified attempt (a login, a password
//! reset, any action worth protecting) may proceed now or must wait. Waits
//! escalate along a Fibonacci-shaped schedule once an identity has used up
//! its free retries, and attempt state lives behind a pluggable store.

pub mod config;
pub mod error;
pub mod guard;

pub use guard::{Attempt, DecisionEngine, MemoryStore, Outcome, Policy};
