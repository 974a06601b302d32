use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::services::payment_gateway::{GatewayError, HostedCheckoutGateway, PaymentGateway, SimulatedGateway};
use crate::services::slot_ledger::SlotLedger;
use crate::services::{BookingPolicy, BookingService, Inbox, SideEffectDispatcher};
use crate::store::{AuditStore, BookingStore, FieldCatalog, MemoryStore, NotificationStore, PgStore};

/// Wired-up core handed to whatever transport sits in front of it.
#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<BookingService>,
    pub inbox: Arc<Inbox>,
    pub dispatcher: Arc<SideEffectDispatcher>,
    pub ledger: Arc<dyn SlotLedger>,
    pub audit: Arc<dyn AuditStore>,
}

impl AppState {
    /// Single-process wiring over [`MemoryStore`] with the simulated gateway.
    pub fn in_memory(store: MemoryStore, clock: Arc<dyn Clock>, policy: BookingPolicy) -> Self {
        Self::in_memory_with_gateway(store, Arc::new(SimulatedGateway), clock, policy)
    }

    pub fn in_memory_with_gateway(
        store: MemoryStore,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> Self {
        let ledger: Arc<dyn SlotLedger> = Arc::new(store.ledger());
        Self::assemble(Arc::new(store), ledger, gateway, clock, policy)
    }

    /// Production wiring. Falls back to the simulated gateway when no processor
    /// is configured.
    pub fn postgres(
        store: PgStore,
        gateway: Option<&GatewayConfig>,
        policy: BookingPolicy,
    ) -> Result<Self, GatewayError> {
        let gateway: Arc<dyn PaymentGateway> = match gateway {
            Some(gateway) => Arc::new(HostedCheckoutGateway::new(gateway)?),
            None => {
                tracing::warn!("No payment gateway configured; using simulated payments");
                Arc::new(SimulatedGateway)
            }
        };

        let store = Arc::new(store);
        let ledger: Arc<dyn SlotLedger> = store.clone();
        Ok(Self::assemble(
            store,
            ledger,
            gateway,
            Arc::new(SystemClock),
            policy,
        ))
    }

    fn assemble<S>(
        store: Arc<S>,
        ledger: Arc<dyn SlotLedger>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> Self
    where
        S: BookingStore + FieldCatalog + NotificationStore + AuditStore + 'static,
    {
        let notifications: Arc<dyn NotificationStore> = store.clone();
        let audit: Arc<dyn AuditStore> = store.clone();
        let bookings: Arc<dyn BookingStore> = store.clone();
        let fields: Arc<dyn FieldCatalog> = store;

        let dispatcher = Arc::new(SideEffectDispatcher::new(
            notifications.clone(),
            audit.clone(),
            policy.local_offset,
        ));

        let service = BookingService::new(
            ledger.clone(),
            bookings,
            fields,
            gateway,
            dispatcher.clone(),
            clock,
            policy,
        );

        Self {
            bookings: Arc::new(service),
            inbox: Arc::new(Inbox::new(notifications)),
            dispatcher,
            ledger,
            audit,
        }
    }
}
