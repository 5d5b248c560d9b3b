// Tactical decision layer
pub mod scoring;
pub mod tactical;

pub use scoring::{score_engagement, EngagementScore};
pub use tactical::{
    Diagnostics, Evaluation, ProximityReport, TacticalDecisionEngine, ZoneCandidate,
};
