// Models module - Booking engine entities and value types

pub mod audit_log;
pub mod booking;
pub mod field;
pub mod identity;
pub mod money;
pub mod notification;
pub mod transaction;

pub use audit_log::AuditLogEntry;
pub use booking::{Booking, BookingStatus, MoneyBreakdown, TimeSlot};
pub use field::Field;
pub use identity::{Action, Caller, Role};
pub use money::Money;
pub use notification::Notification;
pub use transaction::Transaction;
