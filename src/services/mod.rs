// Services module - Business logic

pub mod availability;
pub mod cancellation;
pub mod dispatcher;
pub mod inbox;
pub mod lifecycle;
pub mod payment_gateway;
pub mod pricing;
pub mod signature;
pub mod slot_ledger;

pub use dispatcher::SideEffectDispatcher;
pub use inbox::Inbox;
pub use lifecycle::{BookingPolicy, BookingService, PaymentResult};
