//! HTTP control API
//!
//! A small JSON API for starting and stopping the stream, reading metrics and
//! adjusting settings at runtime.

pub mod handlers;
pub mod server;

pub use server::{AppState, ControlServer};
