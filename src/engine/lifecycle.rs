use std::sync::atomic::Ordering;
use std::time::Instant;

use rust_decimal::Decimal;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_capacity, releasable, resolve_all, validate_booking_window};
use super::{Engine, EngineError, Txn};

pub(super) fn validate_amount(amount: Decimal, allow_zero: bool) -> Result<(), EngineError> {
    if amount.is_sign_negative() || amount > MAX_AMOUNT || (!allow_zero && amount.is_zero()) {
        return Err(EngineError::InvalidAmount);
    }
    Ok(())
}

fn validate_text(notes: Option<&String>, location: &Location) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    let too_long = |s: &Option<String>| s.as_ref().is_some_and(|s| s.len() > MAX_LOCATION_LEN);
    if too_long(&location.pickup) || too_long(&location.dropoff) {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    Ok(())
}

fn check_kind(txn: &Txn, id: Ulid, kind: ResourceKind) -> Result<(), EngineError> {
    match txn.resource(&id) {
        Some(rs) if rs.kind == kind => Ok(()),
        _ => Err(EngineError::NotFound(id)),
    }
}

fn transition_error(booking: &Booking, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: booking.id,
        from: booking.status.as_str(),
        action,
    }
}

/// A reminder is due `REMINDER_LEAD_MS` before pickup, and only worth
/// scheduling when that moment is still ahead.
pub(super) fn reminder_for(booking: &Booking, customer: &Customer, now: Ms) -> Option<Reminder> {
    if booking.window.start - now <= REMINDER_LEAD_MS {
        return None;
    }
    Some(Reminder {
        booking_id: booking.id,
        reference: booking.reference(),
        customer_id: customer.id,
        recipient_name: customer.name.clone(),
        recipient_phone: customer.phone.clone(),
        pickup_at: booking.window.start,
        scheduled_at: booking.window.start - REMINDER_LEAD_MS,
    })
}

fn record_duration(op: &'static str, started: Instant) {
    metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}

impl Engine {
    /// Create a confirmed booking, claiming the vehicle (and driver, if any).
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let started = Instant::now();
        validate_booking_window(&req.window)?;
        validate_amount(req.total_amount, true)?;
        validate_text(req.notes.as_ref(), &req.location)?;
        self.expect_customer(req.customer_id)?;

        let mut resource_ids = vec![req.vehicle_id];
        resource_ids.extend(req.driver_id);

        let mut txn = self.begin().await?;
        self.lock_resources(&mut txn, &resource_ids).await?;
        check_kind(&txn, req.vehicle_id, ResourceKind::Vehicle)?;
        if let Some(driver_id) = req.driver_id {
            check_kind(&txn, driver_id, ResourceKind::Driver)?;
        }
        self.lock_customer(&mut txn, req.customer_id).await?;
        check_capacity(&txn, &resource_ids)?;
        resolve_all(&txn, &resource_ids, &req.window, None)?;

        let now = self.now();
        let prepaid = if req.payment_status == PaymentStatus::Paid {
            req.total_amount
        } else {
            Decimal::ZERO
        };
        let booking = Booking {
            id: Ulid::new(),
            seq: self.tables.last_seq.fetch_add(1, Ordering::SeqCst) + 1,
            vehicle_id: req.vehicle_id,
            driver_id: req.driver_id,
            customer_id: req.customer_id,
            window: req.window,
            payment_status: req.payment_status,
            status: BookingStatus::Confirmed,
            total_amount: req.total_amount,
            amount_paid: prepaid,
            prepaid,
            location: req.location,
            notes: req.notes,
            created_at: now,
        };
        if self.tables.bookings.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        let reminder = txn.customer().and_then(|c| reminder_for(&booking, c, now));

        self.commit(
            txn,
            Event::BookingCreated {
                booking: booking.clone(),
                reminder,
            },
        )
        .await?;

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        record_duration("create_booking", started);
        info!(
            "booking {} ({}) confirmed on vehicle {} {}",
            booking.reference(),
            booking.id,
            booking.vehicle_id,
            booking.window
        );
        Ok(booking)
    }

    /// Patch a booking. Moves re-run conflict resolution excluding the
    /// booking itself; on conflict nothing changes.
    pub async fn update_booking(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        let started = Instant::now();
        if let Some(ref w) = patch.window {
            validate_booking_window(w)?;
        }
        if let Some(total) = patch.total_amount {
            validate_amount(total, true)?;
        }
        validate_text(
            patch.notes.as_ref().and_then(|n| n.as_ref()),
            patch.location.as_ref().unwrap_or(&Location::default()),
        )?;

        let mut txn = self.begin().await?;
        let current = self
            .lock_booking(&mut txn, id, |b| patch.apply_to(b).resources(), true)
            .await?;
        if !current.status.is_active() {
            return Err(transition_error(&current, "update"));
        }
        if patch.payment_status == Some(PaymentStatus::Paid)
            && current.payment_status != PaymentStatus::Paid
        {
            return Err(transition_error(&current, "be marked paid without a payment"));
        }

        let mut after = patch.apply_to(&current);
        if after.vehicle_id != current.vehicle_id {
            check_kind(&txn, after.vehicle_id, ResourceKind::Vehicle)?;
        }
        if let Some(driver_id) = after.driver_id
            && current.driver_id != Some(driver_id)
        {
            check_kind(&txn, driver_id, ResourceKind::Driver)?;
        }
        // Paid tracks whether what was paid covers the current total.
        if after.amount_paid < after.total_amount {
            if after.payment_status == PaymentStatus::Paid {
                after.payment_status = PaymentStatus::Pending;
            }
        } else if !after.total_amount.is_zero() {
            after.payment_status = PaymentStatus::Paid;
        }

        let before_resources = current.resources();
        let after_resources = after.resources();
        let window_changed = after.window != current.window;
        let to_check: Vec<Ulid> = if window_changed {
            after_resources.clone()
        } else {
            after_resources
                .iter()
                .copied()
                .filter(|r| !before_resources.contains(r))
                .collect()
        };
        check_capacity(&txn, &to_check)?;
        resolve_all(&txn, &to_check, &after.window, Some(id))?;

        let now = self.now();
        let mut released = Vec::new();
        for rid in before_resources.iter().filter(|r| !after_resources.contains(r)) {
            let Some(rs) = txn.resource(rid) else { continue };
            if releasable(rs, id, now) {
                released.push(*rid);
            } else {
                metrics::counter!(observability::RELEASES_SKIPPED_TOTAL).increment(1);
                warn!("{} {rid} left booking {} but is still held by another booking", rs.kind.as_str(), current.reference());
            }
        }

        let reminder = if window_changed {
            match txn.customer().and_then(|c| reminder_for(&after, c, now)) {
                Some(r) => ReminderChange::Replace(r),
                None => ReminderChange::Revoke,
            }
        } else {
            ReminderChange::Keep
        };

        self.commit(
            txn,
            Event::BookingUpdated {
                before: current,
                after: after.clone(),
                released,
                reminder,
            },
        )
        .await?;

        record_duration("update_booking", started);
        info!("booking {} updated {}", after.reference(), after.window);
        Ok(after)
    }

    /// Pickup happened: confirmed → in_progress.
    pub async fn start_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut txn = self.begin().await?;
        let current = self.lock_booking(&mut txn, id, |_| Vec::new(), false).await?;
        if current.status != BookingStatus::Confirmed {
            return Err(transition_error(&current, "start"));
        }
        self.commit(txn, Event::BookingStarted { id }).await?;
        info!("booking {} picked up", current.reference());
        self.booking_snapshot(&id)
    }

    /// Cancel an active booking. Each resource goes back to `Available`
    /// only if no other active booking still holds it from now on.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let mut txn = self.begin().await?;
        let current = self.lock_booking(&mut txn, id, |_| Vec::new(), true).await?;
        if !current.status.is_active() {
            return Err(transition_error(&current, "cancel"));
        }

        let now = self.now();
        let mut released = Vec::new();
        for rid in current.resources() {
            let Some(rs) = txn.resource(&rid) else { continue };
            if releasable(rs, id, now) {
                released.push(rid);
            } else {
                metrics::counter!(observability::RELEASES_SKIPPED_TOTAL).increment(1);
                warn!(
                    "not releasing {} {rid}: still held after cancelling {}",
                    rs.kind.as_str(),
                    current.reference()
                );
            }
        }
        metrics::counter!(observability::RESOURCES_RELEASED_TOTAL).increment(released.len() as u64);

        self.commit(txn, Event::BookingCancelled { id, released }).await?;
        record_duration("cancel_booking", started);
        info!("booking {} cancelled", current.reference());
        Ok(())
    }

    /// Vehicle returned: in_progress → completed. Releases unconditionally.
    pub async fn complete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let mut txn = self.begin().await?;
        let current = self.lock_booking(&mut txn, id, |_| Vec::new(), false).await?;
        if current.status != BookingStatus::InProgress {
            return Err(transition_error(&current, "complete"));
        }
        let resources = current.resources();
        self.commit(txn, Event::BookingCompleted { id }).await?;
        metrics::counter!(observability::RESOURCES_RELEASED_TOTAL).increment(resources.len() as u64);
        info!("booking {} completed", current.reference());
        Ok(())
    }
}
