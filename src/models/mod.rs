//! Data models

mod action;
mod threat;

pub use action::{ActionFilter, ActionStatus, ActionType, RemediationAction, RiskTier};
pub use threat::{Priority, ThreatEvent, ThreatFilter, ThreatStatus, ThreatType};
