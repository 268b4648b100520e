use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL as a snapshot of current state. Takes the gate
    /// exclusively, so no commit is in flight while the snapshot is built.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = tokio::time::timeout(self.lock_timeout, self.gate.write())
            .await
            .map_err(|_| self.lock_timed_out("engine gate"))?;

        let mut events = Vec::new();

        let mut resource_ids: Vec<Ulid> = self.tables.resources.iter().map(|e| *e.key()).collect();
        resource_ids.sort();
        for id in &resource_ids {
            let Some(rs) = self.get_resource(id) else { continue };
            let guard = rs.read().await;
            events.push(Event::ResourceRegistered {
                id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
            });
            if guard.flag.is_some() {
                events.push(Event::ResourceFlagged {
                    id: guard.id,
                    flag: guard.flag,
                });
            }
            if guard.status != ResourceStatus::Available {
                events.push(Event::ResourceStatusReconciled {
                    id: guard.id,
                    status: guard.status,
                });
            }
        }

        let mut customers = Vec::new();
        let mut customer_ids: Vec<Ulid> = self.tables.customers.iter().map(|e| *e.key()).collect();
        customer_ids.sort();
        for id in &customer_ids {
            let Some(handle) = self.get_customer_handle(id) else { continue };
            let c = handle.lock().await.clone();
            events.push(Event::CustomerRegistered {
                id: c.id,
                name: c.name.clone(),
                phone: c.phone.clone(),
            });
            customers.push(c);
        }

        let mut bookings: Vec<Booking> = self.tables.bookings.iter().map(|b| b.clone()).collect();
        bookings.sort_by_key(|b| b.seq);
        for booking in bookings {
            let reminder = self.tables.reminders.get(&booking.id).map(|r| r.clone());
            events.push(Event::BookingRestored { booking, reminder });
        }

        let mut payments: Vec<Payment> = self.tables.payments.iter().map(|p| p.clone()).collect();
        payments.sort_by_key(|p| p.id);
        events.extend(payments.into_iter().map(|payment| Event::PaymentRestored { payment }));

        let mut charges: Vec<Charge> = self.tables.charges.iter().map(|c| c.clone()).collect();
        charges.sort_by_key(|c| c.id);
        events.extend(charges.into_iter().map(|charge| Event::ChargeRecorded { charge }));

        let mut installments: Vec<Installment> =
            self.tables.installments.iter().map(|i| i.clone()).collect();
        installments.sort_by_key(|i| i.id);
        events.extend(
            installments
                .into_iter()
                .map(|installment| Event::InstallmentScheduled { installment }),
        );

        // Balances last: they overwrite whatever the charges above added.
        events.extend(customers.into_iter().map(|c| Event::BalanceReconciled {
            customer_id: c.id,
            balance: c.balance,
        }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }
}
