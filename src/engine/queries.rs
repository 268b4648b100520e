use rust_decimal::Decimal;
use tokio::sync::RwLockReadGuard;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{conflicting, resolve};
use super::{Engine, EngineError, SharedResourceState};

impl Engine {
    async fn read_resource<'a>(
        &self,
        rs: &'a SharedResourceState,
    ) -> Result<RwLockReadGuard<'a, ResourceState>, EngineError> {
        tokio::time::timeout(self.lock_timeout, rs.read())
            .await
            .map_err(|_| self.lock_timed_out("resource lock"))
    }

    /// Existing bookings on `resource_id` that overlap `window`.
    /// A resource in maintenance is a conflict outright.
    pub async fn find_conflicts(
        &self,
        resource_id: Ulid,
        window: Window,
        exclude_booking_id: Option<Ulid>,
    ) -> Result<Vec<ConflictingBooking>, EngineError> {
        let window = Window::new(window.start, window.end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = self.read_resource(&rs).await?;
        if guard.in_maintenance() {
            return Err(EngineError::Conflict(vec![ResourceConflict {
                resource_id,
                kind: guard.kind,
                maintenance: true,
                bookings: Vec::new(),
            }]));
        }
        Ok(conflicting(&guard, &window, exclude_booking_id))
    }

    pub async fn is_available(
        &self,
        resource_id: Ulid,
        window: Window,
        exclude_booking_id: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let window = Window::new(window.start, window.end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = self.read_resource(&rs).await?;
        Ok(resolve(&guard, &window, exclude_booking_id).is_ok())
    }

    pub async fn resource_status(&self, resource_id: Ulid) -> Result<ResourceStatus, EngineError> {
        Ok(self.resource_info(resource_id).await?.status)
    }

    pub async fn resource_info(&self, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = self.read_resource(&rs).await?;
        Ok(ResourceInfo {
            id: guard.id,
            kind: guard.kind,
            name: guard.name.clone(),
            status: guard.effective_status(),
            active_bookings: guard.allocations.len(),
        })
    }

    /// All resources, optionally of one kind, in id order.
    pub async fn list_resources(&self, kind: Option<ResourceKind>) -> Result<Vec<ResourceInfo>, EngineError> {
        let mut ids: Vec<Ulid> = self.tables.resources.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.resource_info(id).await {
                Ok(info) if kind.is_none_or(|k| k == info.kind) => out.push(info),
                Ok(_) => {}
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.booking_snapshot(&id)
    }

    /// Every booking, active or not, that ever claimed `resource_id`,
    /// ordered by pickup.
    pub fn bookings_for_resource(&self, resource_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.tables.resources.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        let mut out: Vec<Booking> = self
            .tables
            .bookings
            .iter()
            .filter(|b| b.resources().contains(&resource_id))
            .map(|b| b.clone())
            .collect();
        out.sort_by_key(|b| (b.window.start, b.seq));
        Ok(out)
    }

    pub fn bookings_for_customer(&self, customer_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.expect_customer(customer_id)?;
        let mut out: Vec<Booking> = self
            .tables
            .bookings
            .iter()
            .filter(|b| b.customer_id == customer_id)
            .map(|b| b.clone())
            .collect();
        out.sort_by_key(|b| b.seq);
        Ok(out)
    }

    pub async fn get_customer(&self, customer_id: Ulid) -> Result<Customer, EngineError> {
        let handle = self
            .get_customer_handle(&customer_id)
            .ok_or(EngineError::NotFound(customer_id))?;
        let guard = tokio::time::timeout(self.lock_timeout, handle.lock())
            .await
            .map_err(|_| self.lock_timed_out("customer lock"))?;
        Ok(guard.clone())
    }

    pub async fn balance(&self, customer_id: Ulid) -> Result<Decimal, EngineError> {
        Ok(self.get_customer(customer_id).await?.balance)
    }

    pub fn payments_for_customer(&self, customer_id: Ulid) -> Result<Vec<Payment>, EngineError> {
        self.expect_customer(customer_id)?;
        let mut out: Vec<Payment> = self
            .tables
            .payments
            .iter()
            .filter(|p| p.customer_id == customer_id)
            .map(|p| p.clone())
            .collect();
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    pub fn charges_for_customer(&self, customer_id: Ulid) -> Result<Vec<Charge>, EngineError> {
        self.expect_customer(customer_id)?;
        let mut out: Vec<Charge> = self
            .tables
            .charges
            .iter()
            .filter(|c| c.customer_id == customer_id)
            .map(|c| c.clone())
            .collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }

    pub fn installments_for_booking(&self, booking_id: Ulid) -> Result<Vec<Installment>, EngineError> {
        if !self.tables.bookings.contains_key(&booking_id) {
            return Err(EngineError::NotFound(booking_id));
        }
        let mut out: Vec<Installment> = self
            .tables
            .installments
            .iter()
            .filter(|i| i.booking_id == booking_id)
            .map(|i| i.clone())
            .collect();
        out.sort_by_key(|i| (i.due_at, i.id));
        Ok(out)
    }

    /// Reminders scheduled at or before `due_by`, earliest first.
    pub fn pending_reminders(&self, due_by: Ms) -> Vec<Reminder> {
        let mut out: Vec<Reminder> = self
            .tables
            .reminders
            .iter()
            .filter(|r| r.scheduled_at <= due_by)
            .map(|r| r.clone())
            .collect();
        out.sort_by_key(|r| (r.scheduled_at, r.booking_id));
        out
    }
}
