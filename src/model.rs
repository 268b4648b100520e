use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Why a window was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("window start {start} is after end {end}")]
    Reversed { start: Ms, end: Ms },
    #[error("pickup and return are the same instant ({0})")]
    Empty(Ms),
    #[error("malformed {field}: {value:?}")]
    Malformed { field: &'static str, value: String },
    #[error("timestamp out of range")]
    OutOfRange,
    #[error("booking window too long")]
    TooLong,
}

/// Closed interval `[start, end]`. Touching endpoints overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::Reversed { start, end });
        }
        Ok(Self { start, end })
    }

    /// A booking window: pickup strictly before return.
    pub fn booking(start: Ms, end: Ms) -> Result<Self, RangeError> {
        let w = Self::new(start, end)?;
        if w.start == w.end {
            return Err(RangeError::Empty(start));
        }
        Ok(w)
    }

    /// Zero-length window at a single instant.
    pub fn at(t: Ms) -> Self {
        Self { start: t, end: t }
    }

    pub fn from_datetimes(pickup: NaiveDateTime, ret: NaiveDateTime) -> Result<Self, RangeError> {
        Self::booking(to_ms(pickup), to_ms(ret))
    }

    pub fn from_parts(
        pickup_date: NaiveDate,
        pickup_time: NaiveTime,
        return_date: NaiveDate,
        return_time: NaiveTime,
    ) -> Result<Self, RangeError> {
        Self::from_datetimes(
            pickup_date.and_time(pickup_time),
            return_date.and_time(return_time),
        )
    }

    /// Parse the date + time-of-day pairs bookings arrive with
    /// (`2025-07-01`, `10:00` or `10:00:00`).
    pub fn parse(
        pickup_date: &str,
        pickup_time: &str,
        return_date: &str,
        return_time: &str,
    ) -> Result<Self, RangeError> {
        Self::from_parts(
            parse_date("pickup_date", pickup_date)?,
            parse_time("pickup_time", pickup_time)?,
            parse_date("return_date", return_date)?,
            parse_time("return_time", return_time)?,
        )
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (from_ms(self.start), from_ms(self.end)) {
            (Some(s), Some(e)) => write!(f, "[{s}, {e}]"),
            _ => write!(f, "[{}, {}]", self.start, self.end),
        }
    }
}

/// Inclusive overlap of `[a_start, a_end]` and `[b_start, b_end]`.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> Result<bool, RangeError> {
    let a = Window::new(a_start, a_end)?;
    let b = Window::new(b_start, b_end)?;
    Ok(a.overlaps(&b))
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn from_ms(ms: Ms) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

fn parse_date(field: &'static str, s: &str) -> Result<NaiveDate, RangeError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| RangeError::Malformed {
        field,
        value: s.to_string(),
    })
}

fn parse_time(field: &'static str, s: &str) -> Result<NaiveTime, RangeError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| RangeError::Malformed {
            field,
            value: s.to_string(),
        })
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Vehicle,
    Driver,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vehicle => "vehicle",
            ResourceKind::Driver => "driver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Available,
    Booked,
    Maintenance,
    Off,
}

/// Operator-set status. Sticky: booking lifecycle never clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceFlag {
    Maintenance,
    Off,
}

impl From<ResourceFlag> for ResourceStatus {
    fn from(flag: ResourceFlag) -> Self {
        match flag {
            ResourceFlag::Maintenance => ResourceStatus::Maintenance,
            ResourceFlag::Off => ResourceStatus::Off,
        }
    }
}

/// One active booking's claim on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub booking_id: Ulid,
    pub seq: u64,
    pub customer_id: Ulid,
    pub window: Window,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    /// Lifecycle projection: `Available` or `Booked`.
    pub status: ResourceStatus,
    pub flag: Option<ResourceFlag>,
    /// Active allocations, sorted by `window.start`.
    pub allocations: Vec<Allocation>,
}

impl ResourceState {
    pub fn new(id: Ulid, kind: ResourceKind, name: Option<String>) -> Self {
        Self {
            id,
            kind,
            name,
            status: ResourceStatus::Available,
            flag: None,
            allocations: Vec::new(),
        }
    }

    pub fn effective_status(&self) -> ResourceStatus {
        self.flag.map(ResourceStatus::from).unwrap_or(self.status)
    }

    pub fn in_maintenance(&self) -> bool {
        self.flag == Some(ResourceFlag::Maintenance)
    }

    /// Insert allocation maintaining sort order by window.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .partition_point(|a| a.window.start <= allocation.window.start);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, booking_id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.booking_id == booking_id)?;
        Some(self.allocations.remove(pos))
    }

    /// Allocations whose window overlaps the query (inclusive).
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &Window) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.window.start <= query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.window.end >= query.start)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings occupy their resources.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaymentStatus {
    Paid,
    #[default]
    Pending,
    Hold,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub pickup: Option<String>,
    pub dropoff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Per-tenant sequence number behind the display reference.
    pub seq: u64,
    pub vehicle_id: Ulid,
    pub driver_id: Option<Ulid>,
    pub customer_id: Ulid,
    pub window: Window,
    pub payment_status: PaymentStatus,
    pub status: BookingStatus,
    pub total_amount: Decimal,
    pub amount_paid: Decimal,
    /// Settled when the booking was made, outside the payments ledger.
    /// Whatever the total exceeds this by is carried on the customer's balance.
    pub prepaid: Decimal,
    pub location: Location,
    pub notes: Option<String>,
    pub created_at: Ms,
}

impl Booking {
    /// Human-readable reference, e.g. `BK-000042`.
    pub fn reference(&self) -> String {
        format_reference(self.seq)
    }

    pub fn resources(&self) -> Vec<Ulid> {
        let mut ids = vec![self.vehicle_id];
        ids.extend(self.driver_id);
        ids
    }

    /// Amount this booking contributes to the customer's balance.
    pub fn charge(&self) -> Decimal {
        if self.status == BookingStatus::Cancelled {
            Decimal::ZERO
        } else {
            self.total_amount - self.prepaid
        }
    }

    pub fn allocation(&self) -> Allocation {
        Allocation {
            booking_id: self.id,
            seq: self.seq,
            customer_id: self.customer_id,
            window: self.window,
        }
    }
}

pub fn format_reference(seq: u64) -> String {
    format!("BK-{seq:06}")
}

/// Input to `Engine::create_booking`.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub customer_id: Ulid,
    pub vehicle_id: Ulid,
    pub driver_id: Option<Ulid>,
    pub window: Window,
    pub total_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub location: Location,
    pub notes: Option<String>,
}

impl NewBooking {
    pub fn new(customer_id: Ulid, vehicle_id: Ulid, window: Window) -> Self {
        Self {
            customer_id,
            vehicle_id,
            driver_id: None,
            window,
            total_amount: Decimal::ZERO,
            payment_status: PaymentStatus::Pending,
            location: Location::default(),
            notes: None,
        }
    }
}

/// Partial update: `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct BookingPatch {
    pub vehicle_id: Option<Ulid>,
    /// `Some(None)` removes the driver.
    pub driver_id: Option<Option<Ulid>>,
    pub window: Option<Window>,
    pub total_amount: Option<Decimal>,
    pub payment_status: Option<PaymentStatus>,
    pub location: Option<Location>,
    pub notes: Option<Option<String>>,
}

impl BookingPatch {
    pub fn apply_to(&self, booking: &Booking) -> Booking {
        let mut merged = booking.clone();
        if let Some(v) = self.vehicle_id {
            merged.vehicle_id = v;
        }
        if let Some(d) = self.driver_id {
            merged.driver_id = d;
        }
        if let Some(w) = self.window {
            merged.window = w;
        }
        if let Some(t) = self.total_amount {
            merged.total_amount = t;
        }
        if let Some(p) = self.payment_status {
            merged.payment_status = p;
        }
        if let Some(ref l) = self.location {
            merged.location = l.clone();
        }
        if let Some(ref n) = self.notes {
            merged.notes = n.clone();
        }
        merged
    }
}

// ── Customers & ledger ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    pub phone: Option<String>,
    /// Positive = owed by the customer.
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub booking_id: Option<Ulid>,
    pub installment_id: Option<Ulid>,
    pub amount: Decimal,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeKind {
    Hotel,
    Flight,
    Tour,
}

/// Non-rental charge carried on the customer's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub kind: ChargeKind,
    pub amount: Decimal,
    pub reference: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallmentStatus {
    Pending,
    Paid,
    Overdue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub customer_id: Ulid,
    pub amount: Decimal,
    pub due_at: Ms,
    pub status: InstallmentStatus,
    pub payment_id: Option<Ulid>,
}

// ── Reminders ────────────────────────────────────────────────────

/// "Pickup approaching" notice for the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub booking_id: Ulid,
    pub reference: String,
    pub customer_id: Ulid,
    pub recipient_name: String,
    pub recipient_phone: Option<String>,
    pub pickup_at: Ms,
    pub scheduled_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderChange {
    Keep,
    Replace(Reminder),
    Revoke,
}

/// The event types: flat, no nesting. This is the WAL record format.
/// Each committed operation is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
    },
    ResourceFlagged {
        id: Ulid,
        flag: Option<ResourceFlag>,
    },
    ResourceStatusReconciled {
        id: Ulid,
        status: ResourceStatus,
    },
    CustomerRegistered {
        id: Ulid,
        name: String,
        phone: Option<String>,
    },
    BookingCreated {
        booking: Booking,
        reminder: Option<Reminder>,
    },
    BookingUpdated {
        before: Booking,
        after: Booking,
        /// Resources dropped by the update that nothing else holds.
        released: Vec<Ulid>,
        reminder: ReminderChange,
    },
    BookingStarted {
        id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        released: Vec<Ulid>,
    },
    BookingCompleted {
        id: Ulid,
    },
    PaymentApplied {
        payment: Payment,
    },
    ChargeRecorded {
        charge: Charge,
    },
    InstallmentScheduled {
        installment: Installment,
    },
    InstallmentsOverdue {
        ids: Vec<Ulid>,
    },
    BalanceReconciled {
        customer_id: Ulid,
        balance: Decimal,
    },
    // Compaction-only records: restore rows without re-running their side effects.
    BookingRestored {
        booking: Booking,
        reminder: Option<Reminder>,
    },
    PaymentRestored {
        payment: Payment,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub status: ResourceStatus,
    pub active_bookings: usize,
}

/// An existing booking standing in the way of a proposed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingBooking {
    pub booking_id: Ulid,
    pub reference: String,
    pub customer_id: Ulid,
    pub window: Window,
}

impl From<&Allocation> for ConflictingBooking {
    fn from(a: &Allocation) -> Self {
        Self {
            booking_id: a.booking_id,
            reference: format_reference(a.seq),
            customer_id: a.customer_id,
            window: a.window,
        }
    }
}

/// Everything blocking one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConflict {
    pub resource_id: Ulid,
    pub kind: ResourceKind,
    pub maintenance: bool,
    pub bookings: Vec<ConflictingBooking>,
}

impl fmt::Display for ResourceConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.resource_id)?;
        if self.maintenance {
            write!(f, " is in maintenance")?;
        }
        for b in &self.bookings {
            write!(f, "; held by {} (customer {}) {}", b.reference, b.customer_id, b.window)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub resource_id: Ulid,
    pub previous: ResourceStatus,
    pub current: ResourceStatus,
}

impl StatusReport {
    pub fn drifted(&self) -> bool {
        self.previous != self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn alloc(start: Ms, end: Ms) -> Allocation {
        Allocation {
            booking_id: Ulid::new(),
            seq: 1,
            customer_id: Ulid::new(),
            window: Window::new(start, end).unwrap(),
        }
    }

    #[test]
    fn window_basics() {
        let w = Window::new(100, 200).unwrap();
        assert_eq!(w.duration_ms(), 100);
        assert!(w.contains_instant(100));
        assert!(w.contains_instant(200)); // closed
        assert!(!w.contains_instant(201));
    }

    #[test]
    fn reversed_window_rejected() {
        assert_eq!(
            Window::new(200, 100),
            Err(RangeError::Reversed { start: 200, end: 100 })
        );
        assert!(Window::new(100, 100).is_ok());
        assert_eq!(Window::booking(100, 100), Err(RangeError::Empty(100)));
    }

    #[test]
    fn touching_endpoints_overlap() {
        let a = Window::new(100, 200).unwrap();
        let b = Window::new(200, 300).unwrap();
        let c = Window::new(201, 300).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn overlaps_is_symmetric() {
        let points = [0, 50, 100, 150, 200, 250];
        for &a0 in &points {
            for &a1 in points.iter().filter(|p| **p >= a0) {
                for &b0 in &points {
                    for &b1 in points.iter().filter(|p| **p >= b0) {
                        assert_eq!(
                            overlaps(a0, a1, b0, b1).unwrap(),
                            overlaps(b0, b1, a0, a1).unwrap(),
                            "[{a0},{a1}] vs [{b0},{b1}]"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn overlaps_rejects_reversed_input() {
        assert!(overlaps(10, 5, 0, 100).is_err());
        assert!(overlaps(0, 100, 10, 5).is_err());
    }

    #[test]
    fn parse_normalizes_time_formats() {
        let a = Window::parse("2025-07-01", "10:00", "2025-07-05", "10:00").unwrap();
        let b = Window::parse("2025-07-01", "10:00:00", "2025-07-05", " 10:00:00 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.duration_ms(), 4 * 24 * H);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = Window::parse("2025-07-01", "ten", "2025-07-05", "10:00").unwrap_err();
        assert!(matches!(err, RangeError::Malformed { field: "pickup_time", .. }));
        let err = Window::parse("07/01/2025", "10:00", "2025-07-05", "10:00").unwrap_err();
        assert!(matches!(err, RangeError::Malformed { field: "pickup_date", .. }));
    }

    #[test]
    fn parse_compares_chronologically() {
        // A lexicographic comparison of "2025-07-05 9:00" and "2025-07-05 10:00" gets this wrong.
        let early = Window::parse("2025-07-05", "09:00", "2025-07-05", "09:30").unwrap();
        let late = Window::parse("2025-07-05", "10:00", "2025-07-05", "11:00").unwrap();
        assert!(early.end < late.start);
        assert!(!early.overlaps(&late));
    }

    #[test]
    fn booking_window_requires_pickup_before_return() {
        let err = Window::parse("2025-07-05", "10:00", "2025-07-01", "10:00").unwrap_err();
        assert!(matches!(err, RangeError::Reversed { .. }));
    }

    #[test]
    fn allocation_ordering() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Vehicle, None);
        rs.insert_allocation(alloc(300, 400));
        rs.insert_allocation(alloc(100, 200));
        rs.insert_allocation(alloc(200, 300));
        let starts: Vec<Ms> = rs.allocations.iter().map(|a| a.window.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_allocation() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Driver, None);
        let a = alloc(100, 200);
        let id = a.booking_id;
        rs.insert_allocation(a);
        assert!(rs.remove_allocation(Ulid::new()).is_none());
        assert!(rs.remove_allocation(id).is_some());
        assert!(rs.allocations.is_empty());
    }

    #[test]
    fn overlapping_includes_boundaries() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Vehicle, None);
        rs.insert_allocation(alloc(100, 200));
        rs.insert_allocation(alloc(450, 600));
        rs.insert_allocation(alloc(1000, 1100));

        let hits: Vec<_> = rs.overlapping(&Window::new(200, 450).unwrap()).collect();
        assert_eq!(hits.len(), 2);

        let hits: Vec<_> = rs.overlapping(&Window::new(601, 999).unwrap()).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_long_allocation_spanning_query() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Vehicle, None);
        rs.insert_allocation(alloc(0, 10_000));
        let hits: Vec<_> = rs.overlapping(&Window::at(500)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn flag_wins_over_lifecycle_status() {
        let mut rs = ResourceState::new(Ulid::new(), ResourceKind::Vehicle, None);
        rs.status = ResourceStatus::Booked;
        assert_eq!(rs.effective_status(), ResourceStatus::Booked);
        rs.flag = Some(ResourceFlag::Maintenance);
        assert_eq!(rs.effective_status(), ResourceStatus::Maintenance);
        assert!(rs.in_maintenance());
        rs.flag = Some(ResourceFlag::Off);
        assert_eq!(rs.effective_status(), ResourceStatus::Off);
        assert!(!rs.in_maintenance());
    }

    #[test]
    fn patch_keeps_unspecified_fields() {
        let booking = Booking {
            id: Ulid::new(),
            seq: 7,
            vehicle_id: Ulid::new(),
            driver_id: Some(Ulid::new()),
            customer_id: Ulid::new(),
            window: Window::new(0, 100).unwrap(),
            payment_status: PaymentStatus::Pending,
            status: BookingStatus::Confirmed,
            total_amount: Decimal::new(100, 0),
            amount_paid: Decimal::ZERO,
            prepaid: Decimal::ZERO,
            location: Location::default(),
            notes: Some("child seat".into()),
            created_at: 0,
        };
        let patch = BookingPatch {
            window: Some(Window::new(50, 150).unwrap()),
            driver_id: Some(None),
            ..Default::default()
        };
        let merged = patch.apply_to(&booking);
        assert_eq!(merged.window, Window::new(50, 150).unwrap());
        assert_eq!(merged.driver_id, None);
        assert_eq!(merged.vehicle_id, booking.vehicle_id);
        assert_eq!(merged.notes, booking.notes);
        assert_eq!(merged.reference(), "BK-000007");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ChargeRecorded {
            charge: Charge {
                id: Ulid::new(),
                customer_id: Ulid::new(),
                kind: ChargeKind::Hotel,
                amount: Decimal::new(12_345, 2),
                reference: Some("Hilton 2 nights".into()),
                created_at: 1,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
