// Risk management module
pub mod capital_ledger;
pub mod perimeter;

pub use capital_ledger::{Allocation, AllocationRequest, AllocationTicket, CapitalLedger, TicketId};
pub use perimeter::{PerimeterArchitect, ProfitTarget, RiskPlan, StopAnchor};
