use rust_decimal::Decimal;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::lifecycle::validate_amount;
use super::{Engine, EngineError, Tables, Txn};

/// Balance implied by the rows: on-account bookings and charges, less payments.
fn ledger_balance(tables: &Tables, customer_id: Ulid) -> Decimal {
    let bookings: Decimal = tables
        .bookings
        .iter()
        .filter(|b| b.customer_id == customer_id)
        .map(|b| b.charge())
        .sum();
    let charges: Decimal = tables
        .charges
        .iter()
        .filter(|c| c.customer_id == customer_id)
        .map(|c| c.amount)
        .sum();
    let payments: Decimal = tables
        .payments
        .iter()
        .filter(|p| p.customer_id == customer_id)
        .map(|p| p.amount)
        .sum();
    bookings + charges - payments
}

fn locked_balance(txn: &Txn, customer_id: Ulid) -> Result<Decimal, EngineError> {
    txn.customer()
        .map(|c| c.balance)
        .ok_or(EngineError::NotFound(customer_id))
}

impl Engine {
    /// Record a payment and return the customer's new balance. A payment
    /// against a booking that now covers its total marks the booking paid.
    pub async fn apply_payment(
        &self,
        customer_id: Ulid,
        amount: Decimal,
        booking_id: Option<Ulid>,
    ) -> Result<Decimal, EngineError> {
        validate_amount(amount, false)?;
        self.expect_customer(customer_id)?;

        let mut txn = self.begin().await?;
        if let Some(bid) = booking_id {
            let booking = self.lock_booking(&mut txn, bid, |_| Vec::new(), true).await?;
            if booking.customer_id != customer_id {
                return Err(EngineError::NotFound(bid));
            }
            if booking.status == BookingStatus::Cancelled {
                return Err(EngineError::InvalidTransition {
                    id: bid,
                    from: booking.status.as_str(),
                    action: "take a payment",
                });
            }
        } else {
            self.lock_customer(&mut txn, customer_id).await?;
        }

        let balance = locked_balance(&txn, customer_id)? - amount;
        let payment = Payment {
            id: Ulid::new(),
            customer_id,
            booking_id,
            installment_id: None,
            amount,
            created_at: self.now(),
        };
        self.commit(txn, Event::PaymentApplied { payment }).await?;

        metrics::counter!(observability::PAYMENTS_APPLIED_TOTAL).increment(1);
        info!("payment of {amount} from customer {customer_id}, balance now {balance}");
        Ok(balance)
    }

    /// Record a hotel, flight or tour charge. Returns the new balance.
    pub async fn record_charge(
        &self,
        customer_id: Ulid,
        kind: ChargeKind,
        amount: Decimal,
        reference: Option<String>,
    ) -> Result<Decimal, EngineError> {
        validate_amount(amount, false)?;
        if reference.as_ref().is_some_and(|r| r.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("charge reference too long"));
        }
        self.expect_customer(customer_id)?;

        let mut txn = self.begin().await?;
        self.lock_customer(&mut txn, customer_id).await?;
        let balance = locked_balance(&txn, customer_id)? + amount;
        let charge = Charge {
            id: Ulid::new(),
            customer_id,
            kind,
            amount,
            reference,
            created_at: self.now(),
        };
        self.commit(txn, Event::ChargeRecorded { charge }).await?;
        Ok(balance)
    }

    /// Split part of a booking's total into an installment due at `due_at`.
    pub async fn schedule_installment(
        &self,
        booking_id: Ulid,
        amount: Decimal,
        due_at: Ms,
    ) -> Result<Installment, EngineError> {
        validate_amount(amount, false)?;
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&due_at) {
            return Err(RangeError::OutOfRange.into());
        }

        let mut txn = self.begin().await?;
        let booking = self.lock_booking(&mut txn, booking_id, |_| Vec::new(), false).await?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: booking.status.as_str(),
                action: "schedule an installment",
            });
        }
        let scheduled: Decimal = self
            .tables
            .installments
            .iter()
            .filter(|i| i.booking_id == booking_id)
            .map(|i| i.amount)
            .sum();
        if scheduled + amount > booking.total_amount {
            return Err(EngineError::LimitExceeded("installments exceed booking total"));
        }

        let installment = Installment {
            id: Ulid::new(),
            booking_id,
            customer_id: booking.customer_id,
            amount,
            due_at,
            status: InstallmentStatus::Pending,
            payment_id: None,
        };
        self.commit(
            txn,
            Event::InstallmentScheduled {
                installment: installment.clone(),
            },
        )
        .await?;
        Ok(installment)
    }

    /// Pay an installment in full. The installment becomes paid only
    /// through the payment created here.
    pub async fn pay_installment(&self, installment_id: Ulid) -> Result<Payment, EngineError> {
        let booking_id = self
            .tables
            .installments
            .get(&installment_id)
            .map(|i| i.booking_id)
            .ok_or(EngineError::NotFound(installment_id))?;

        let mut txn = self.begin().await?;
        let booking = self.lock_booking(&mut txn, booking_id, |_| Vec::new(), true).await?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: booking.status.as_str(),
                action: "take a payment",
            });
        }
        // Re-read under the booking's locks: a concurrent payment may have won.
        let installment = self
            .tables
            .installments
            .get(&installment_id)
            .map(|i| i.clone())
            .ok_or(EngineError::NotFound(installment_id))?;
        if installment.status == InstallmentStatus::Paid {
            return Err(EngineError::InvalidTransition {
                id: installment_id,
                from: "paid",
                action: "pay again",
            });
        }

        let payment = Payment {
            id: Ulid::new(),
            customer_id: installment.customer_id,
            booking_id: Some(booking_id),
            installment_id: Some(installment_id),
            amount: installment.amount,
            created_at: self.now(),
        };
        self.commit(
            txn,
            Event::PaymentApplied {
                payment: payment.clone(),
            },
        )
        .await?;

        metrics::counter!(observability::PAYMENTS_APPLIED_TOTAL).increment(1);
        info!("installment {installment_id} paid ({})", payment.amount);
        Ok(payment)
    }

    /// Flip pending installments past due to overdue. Returns their ids.
    pub async fn mark_overdue_installments(&self) -> Result<Vec<Ulid>, EngineError> {
        let txn = self.begin().await?;
        let now = self.now();
        let ids: Vec<Ulid> = self
            .tables
            .installments
            .iter()
            .filter(|i| i.status == InstallmentStatus::Pending && i.due_at < now)
            .map(|i| i.id)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }
        self.commit(txn, Event::InstallmentsOverdue { ids: ids.clone() })
            .await?;
        info!("{} installments overdue", ids.len());
        Ok(ids)
    }

    /// Recompute the customer's balance from the rows and correct the
    /// stored value if it drifted. Running it twice gives the same result.
    pub async fn recompute_balance(&self, customer_id: Ulid) -> Result<Decimal, EngineError> {
        Ok(self.reconcile_balance(customer_id).await?.0)
    }

    /// Returns the corrected balance and whether a correction was written.
    pub(super) async fn reconcile_balance(&self, customer_id: Ulid) -> Result<(Decimal, bool), EngineError> {
        let mut txn = self.begin().await?;
        self.lock_customer(&mut txn, customer_id).await?;
        let stored = locked_balance(&txn, customer_id)?;
        let expected = ledger_balance(&self.tables, customer_id);
        if (stored - expected).abs() <= BALANCE_TOLERANCE {
            return Ok((stored, false));
        }

        metrics::counter!(observability::RECONCILE_DRIFT_TOTAL, "kind" => "balance").increment(1);
        warn!("customer {customer_id} balance drifted: stored {stored}, ledger {expected}");
        self.commit(
            txn,
            Event::BalanceReconciled {
                customer_id,
                balance: expected,
            },
        )
        .await?;
        Ok((expected, true))
    }

    /// Like `recompute_balance` but only reports drift.
    pub async fn verify_balance(&self, customer_id: Ulid) -> Result<Decimal, EngineError> {
        let handle = self
            .get_customer_handle(&customer_id)
            .ok_or(EngineError::NotFound(customer_id))?;
        let customer = tokio::time::timeout(self.lock_timeout, handle.lock())
            .await
            .map_err(|_| self.lock_timed_out("customer lock"))?;
        let expected = ledger_balance(&self.tables, customer_id);
        if (customer.balance - expected).abs() > BALANCE_TOLERANCE {
            return Err(EngineError::Consistency(format!(
                "customer {customer_id} balance {} but ledger says {expected}",
                customer.balance
            )));
        }
        Ok(customer.balance)
    }
}
