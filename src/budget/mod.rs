pub mod alerts;
pub mod governor;
pub mod usage;

pub use self::alerts::{AlertCallback, AlertEvent, AlertManager, AlertState, log_alert};
pub use self::governor::{BudgetExceeded, BudgetGovernor, BudgetStatus, Reservation};
pub use self::usage::{ModelUsage, UsageRecord, UsageSummary};
