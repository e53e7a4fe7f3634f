//! localnet: brings up sets of interdependent apps on one machine.
//!
//! Apps are declared in a catalog, deployed in order onto a target (a tmux
//! session, a container runtime, or plain processes), and described in a
//! persisted spec so later invocations can inspect and stop them.

pub mod app;
pub mod catalog;
pub mod config;
pub mod error;
pub mod health;
pub mod ip_pool;
pub mod logging;
pub mod pipeline;
pub mod runner;
pub mod session;
pub mod spec;
pub mod target;
pub mod tools;

pub use error::{Error, Result};
