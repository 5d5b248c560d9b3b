// Performance audit of closed positions
pub mod metrics;

pub use metrics::{IntentBreakdown, PerformanceAuditor, PerformanceSummary, TradeRecord};
