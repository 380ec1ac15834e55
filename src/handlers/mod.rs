//! HTTP handlers

pub mod actions;
pub mod events;
pub mod health;
pub mod stream;
pub mod threats;
