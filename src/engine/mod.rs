mod compact;
mod conflict;
mod error;
mod ledger;
mod lifecycle;
mod queries;
mod reconcile;
mod registry;

pub use conflict::{conflicting, releasable, resolve, validate_booking_window};
pub use error::EngineError;
pub use reconcile::ReconcileSummary;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{
    Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot,
};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{NotifyHub, ReminderNotice};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedCustomer = Arc<Mutex<Customer>>;

// ── Clock ────────────────────────────────────────────────

/// Source of "now" for reminder, release and reconciliation decisions.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct EngineOptions {
    /// Upper bound on waiting for any lock.
    pub lock_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            clock: Arc::new(SystemClock),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, fsync once,
/// answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = wal.append_batch(batch.iter().map(|(event, _)| event));
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

// ── Tables ───────────────────────────────────────────────

/// Every row the engine owns. Rows change only inside `apply_event`.
#[derive(Default)]
pub(super) struct Tables {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) customers: DashMap<Ulid, SharedCustomer>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) payments: DashMap<Ulid, Payment>,
    pub(super) charges: DashMap<Ulid, Charge>,
    pub(super) installments: DashMap<Ulid, Installment>,
    pub(super) reminders: DashMap<Ulid, Reminder>,
    /// Highest booking sequence number handed out.
    pub(super) last_seq: AtomicU64,
}

/// Locks held by one in-flight operation. Moved into the commit task so the
/// checks and the write happen under the same guards.
#[derive(Default)]
pub(super) struct Txn {
    _gate: Option<OwnedRwLockReadGuard<()>>,
    pub(super) resources: Vec<OwnedRwLockWriteGuard<ResourceState>>,
    pub(super) customer: Option<OwnedMutexGuard<Customer>>,
}

impl Txn {
    pub(super) fn resource(&self, id: &Ulid) -> Option<&ResourceState> {
        self.resources.iter().find(|g| g.id == *id).map(|g| &**g)
    }

    fn resource_mut(&mut self, id: &Ulid) -> Option<&mut ResourceState> {
        self.resources.iter_mut().find(|g| g.id == *id).map(|g| &mut **g)
    }

    pub(super) fn customer(&self) -> Option<&Customer> {
        self.customer.as_deref()
    }

    fn adjust_balance(&mut self, delta: rust_decimal::Decimal) {
        if let Some(c) = self.customer.as_deref_mut() {
            c.balance += delta;
        } else if !delta.is_zero() {
            tracing::error!("balance change of {delta} applied without a customer lock");
        }
    }
}

/// Resources and customer an event touches.
fn event_scope(tables: &Tables, event: &Event) -> (Vec<Ulid>, Option<Ulid>) {
    let booking_scope = |id: &Ulid| {
        tables
            .bookings
            .get(id)
            .map(|b| (b.resources(), Some(b.customer_id)))
            .unwrap_or_default()
    };
    match event {
        Event::ResourceFlagged { id, .. } | Event::ResourceStatusReconciled { id, .. } => {
            (vec![*id], None)
        }
        Event::BookingCreated { booking, .. } | Event::BookingRestored { booking, .. } => {
            (booking.resources(), Some(booking.customer_id))
        }
        Event::BookingUpdated { before, after, .. } => {
            let mut ids = before.resources();
            ids.extend(after.resources());
            ids.sort();
            ids.dedup();
            (ids, Some(after.customer_id))
        }
        Event::BookingStarted { id }
        | Event::BookingCancelled { id, .. }
        | Event::BookingCompleted { id } => booking_scope(id),
        Event::PaymentApplied { payment } => {
            let resources = payment
                .booking_id
                .and_then(|b| tables.bookings.get(&b).map(|b| b.resources()))
                .unwrap_or_default();
            (resources, Some(payment.customer_id))
        }
        Event::ChargeRecorded { charge } => (Vec::new(), Some(charge.customer_id)),
        Event::BalanceReconciled { customer_id, .. } => (Vec::new(), Some(*customer_id)),
        Event::ResourceRegistered { .. }
        | Event::CustomerRegistered { .. }
        | Event::InstallmentScheduled { .. }
        | Event::InstallmentsOverdue { .. }
        | Event::PaymentRestored { .. } => (Vec::new(), None),
    }
}

fn set_reminder(tables: &Tables, booking_id: Ulid, reminder: Option<&Reminder>) -> Option<ReminderNotice> {
    match reminder {
        Some(r) => {
            tables.reminders.insert(booking_id, r.clone());
            Some(ReminderNotice::Scheduled(r.clone()))
        }
        None => tables
            .reminders
            .remove(&booking_id)
            .map(|_| ReminderNotice::Revoked { booking_id }),
    }
}

/// Apply a committed event. The caller holds every lock in `event_scope`.
/// Returns the reminder notice the event implies, if any.
fn apply_event(tables: &Tables, txn: &mut Txn, event: &Event) -> Option<ReminderNotice> {
    match event {
        Event::ResourceRegistered { id, kind, name } => {
            let rs = ResourceState::new(*id, *kind, name.clone());
            tables.resources.insert(*id, Arc::new(RwLock::new(rs)));
            None
        }
        Event::ResourceFlagged { id, flag } => {
            if let Some(rs) = txn.resource_mut(id) {
                rs.flag = *flag;
            }
            None
        }
        Event::ResourceStatusReconciled { id, status } => {
            if let Some(rs) = txn.resource_mut(id) {
                rs.status = *status;
            }
            None
        }
        Event::CustomerRegistered { id, name, phone } => {
            let customer = Customer {
                id: *id,
                name: name.clone(),
                phone: phone.clone(),
                balance: rust_decimal::Decimal::ZERO,
            };
            tables.customers.insert(*id, Arc::new(Mutex::new(customer)));
            None
        }
        Event::BookingCreated { booking, reminder } => {
            for rid in booking.resources() {
                if let Some(rs) = txn.resource_mut(&rid) {
                    rs.insert_allocation(booking.allocation());
                    rs.status = ResourceStatus::Booked;
                }
            }
            txn.adjust_balance(booking.charge());
            tables.last_seq.fetch_max(booking.seq, Ordering::SeqCst);
            tables.bookings.insert(booking.id, booking.clone());
            reminder.as_ref().and_then(|r| set_reminder(tables, booking.id, Some(r)))
        }
        Event::BookingRestored { booking, reminder } => {
            if booking.status.is_active() {
                for rid in booking.resources() {
                    if let Some(rs) = txn.resource_mut(&rid) {
                        rs.insert_allocation(booking.allocation());
                    }
                }
            }
            tables.last_seq.fetch_max(booking.seq, Ordering::SeqCst);
            tables.bookings.insert(booking.id, booking.clone());
            if let Some(r) = reminder {
                tables.reminders.insert(booking.id, r.clone());
            }
            None
        }
        Event::BookingUpdated {
            before,
            after,
            released,
            reminder,
        } => {
            for rid in before.resources() {
                if let Some(rs) = txn.resource_mut(&rid) {
                    rs.remove_allocation(before.id);
                }
            }
            for rid in after.resources() {
                if let Some(rs) = txn.resource_mut(&rid) {
                    rs.insert_allocation(after.allocation());
                    rs.status = ResourceStatus::Booked;
                }
            }
            for rid in released {
                if let Some(rs) = txn.resource_mut(rid) {
                    rs.status = ResourceStatus::Available;
                }
            }
            txn.adjust_balance(after.charge() - before.charge());
            tables.bookings.insert(after.id, after.clone());
            match reminder {
                ReminderChange::Keep => None,
                ReminderChange::Replace(r) => set_reminder(tables, after.id, Some(r)),
                ReminderChange::Revoke => set_reminder(tables, after.id, None),
            }
        }
        Event::BookingStarted { id } => {
            if let Some(mut b) = tables.bookings.get_mut(id) {
                b.status = BookingStatus::InProgress;
            }
            None
        }
        Event::BookingCancelled { id, released } => {
            let booking = tables.bookings.get(id).map(|b| b.clone())?;
            for rid in booking.resources() {
                if let Some(rs) = txn.resource_mut(&rid) {
                    rs.remove_allocation(*id);
                }
            }
            for rid in released {
                if let Some(rs) = txn.resource_mut(rid) {
                    rs.status = ResourceStatus::Available;
                }
            }
            txn.adjust_balance(-booking.charge());
            if let Some(mut b) = tables.bookings.get_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
            set_reminder(tables, *id, None)
        }
        Event::BookingCompleted { id } => {
            let booking = tables.bookings.get(id).map(|b| b.clone())?;
            for rid in booking.resources() {
                if let Some(rs) = txn.resource_mut(&rid) {
                    rs.remove_allocation(*id);
                    rs.status = ResourceStatus::Available;
                }
            }
            if let Some(mut b) = tables.bookings.get_mut(id) {
                b.status = BookingStatus::Completed;
            }
            set_reminder(tables, *id, None)
        }
        Event::PaymentApplied { payment } => {
            txn.adjust_balance(-payment.amount);
            if let Some(bid) = payment.booking_id
                && let Some(mut b) = tables.bookings.get_mut(&bid)
            {
                b.amount_paid += payment.amount;
                if b.amount_paid >= b.total_amount {
                    b.payment_status = PaymentStatus::Paid;
                }
            }
            if let Some(iid) = payment.installment_id
                && let Some(mut i) = tables.installments.get_mut(&iid)
            {
                i.status = InstallmentStatus::Paid;
                i.payment_id = Some(payment.id);
            }
            tables.payments.insert(payment.id, payment.clone());
            None
        }
        Event::PaymentRestored { payment } => {
            tables.payments.insert(payment.id, payment.clone());
            None
        }
        Event::ChargeRecorded { charge } => {
            txn.adjust_balance(charge.amount);
            tables.charges.insert(charge.id, charge.clone());
            None
        }
        Event::InstallmentScheduled { installment } => {
            tables.installments.insert(installment.id, installment.clone());
            None
        }
        Event::InstallmentsOverdue { ids } => {
            for id in ids {
                if let Some(mut i) = tables.installments.get_mut(id)
                    && i.status == InstallmentStatus::Pending
                {
                    i.status = InstallmentStatus::Overdue;
                }
            }
            None
        }
        Event::BalanceReconciled { balance, .. } => {
            if let Some(c) = txn.customer.as_deref_mut() {
                c.balance = *balance;
            }
            None
        }
    }
}

/// Lock an event's scope during replay. Nothing else can see these Arcs yet,
/// so try-locks always succeed; never block here since replay may run inside
/// an async context (lazy tenant creation).
fn lock_for_replay(tables: &Tables, event: &Event) -> Txn {
    let (resource_ids, customer_id) = event_scope(tables, event);
    let mut txn = Txn::default();
    for rid in resource_ids {
        if let Some(rs) = tables.resources.get(&rid).map(|e| e.value().clone()) {
            txn.resources
                .push(rs.try_write_owned().expect("replay: uncontended write"));
        }
    }
    if let Some(cid) = customer_id
        && let Some(c) = tables.customers.get(&cid).map(|e| e.value().clone())
    {
        txn.customer = Some(c.try_lock_owned().expect("replay: uncontended lock"));
    }
    txn
}

// ── Engine ───────────────────────────────────────────────

/// One tenant's booking engine: registry, conflict resolver, lifecycle and ledger.
pub struct Engine {
    pub(super) tables: Arc<Tables>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Mutating operations hold this shared; compaction holds it exclusively.
    pub(super) gate: Arc<RwLock<()>>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) lock_timeout: Duration,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, EngineOptions::default())
    }

    pub fn with_options(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let tables = Arc::new(Tables::default());
        for event in &events {
            let mut txn = lock_for_replay(&tables, event);
            apply_event(&tables, &mut txn, event);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} resources, {} customers, {} bookings",
                events.len(),
                tables.resources.len(),
                tables.customers.len(),
                tables.bookings.len()
            );
        }

        Ok(Self {
            tables,
            wal_tx,
            notify,
            gate: Arc::new(RwLock::new(())),
            clock: options.clock,
            lock_timeout: options.lock_timeout,
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.tables.resources.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_customer_handle(&self, id: &Ulid) -> Option<SharedCustomer> {
        self.tables.customers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn booking_snapshot(&self, id: &Ulid) -> Result<Booking, EngineError> {
        self.tables
            .bookings
            .get(id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(*id))
    }

    fn lock_timed_out(&self, what: &'static str) -> EngineError {
        metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL, "lock" => what).increment(1);
        tracing::warn!("gave up waiting for {what} after {:?}", self.lock_timeout);
        EngineError::Timeout(what)
    }

    /// Start a mutating operation.
    pub(super) async fn begin(&self) -> Result<Txn, EngineError> {
        let gate = tokio::time::timeout(self.lock_timeout, self.gate.clone().read_owned())
            .await
            .map_err(|_| self.lock_timed_out("engine gate"))?;
        Ok(Txn {
            _gate: Some(gate),
            ..Txn::default()
        })
    }

    /// Write-lock resources in id order. Unknown ids are `NotFound`.
    pub(super) async fn lock_resources(&self, txn: &mut Txn, ids: &[Ulid]) -> Result<(), EngineError> {
        let held: Vec<Ulid> = txn.resources.iter().map(|g| g.id).collect();
        let mut wanted: Vec<Ulid> = ids.iter().copied().filter(|id| !held.contains(id)).collect();
        wanted.sort();
        wanted.dedup();
        let Some(lowest) = wanted.first().copied() else {
            return Ok(());
        };
        if held.iter().any(|h| *h > lowest) {
            // Taking a lower id while holding a higher one can deadlock: start over in order.
            wanted.extend(held);
            wanted.sort();
            txn.resources.clear();
        }
        for id in wanted {
            let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
            let guard = tokio::time::timeout(self.lock_timeout, rs.write_owned())
                .await
                .map_err(|_| self.lock_timed_out("resource lock"))?;
            txn.resources.push(guard);
        }
        Ok(())
    }

    /// Lock the customer row. Always taken after resource locks.
    pub(super) async fn lock_customer(&self, txn: &mut Txn, id: Ulid) -> Result<(), EngineError> {
        let c = self.get_customer_handle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = tokio::time::timeout(self.lock_timeout, c.lock_owned())
            .await
            .map_err(|_| self.lock_timed_out("customer lock"))?;
        txn.customer = Some(guard);
        Ok(())
    }

    /// Lock a booking's resources (plus `extra`), re-checking afterwards that
    /// the booking still points at the resources we locked.
    pub(super) async fn lock_booking(
        &self,
        txn: &mut Txn,
        booking_id: Ulid,
        extra: impl Fn(&Booking) -> Vec<Ulid>,
        with_customer: bool,
    ) -> Result<Booking, EngineError> {
        for attempt in 0..MAX_LOCK_RETRIES {
            let snapshot = self.booking_snapshot(&booking_id)?;
            let mut ids = snapshot.resources();
            ids.extend(extra(&snapshot));
            self.lock_resources(txn, &ids).await?;

            let current = self.booking_snapshot(&booking_id)?;
            if current.resources() == snapshot.resources() {
                if with_customer {
                    self.lock_customer(txn, current.customer_id).await?;
                }
                return Ok(current);
            }
            tracing::debug!("booking {booking_id} moved while locking (attempt {attempt}), retrying");
            txn.resources.clear();
        }
        Err(self.lock_timed_out("booking lock"))
    }

    /// Make `event` durable, then apply it under the locks in `txn`.
    ///
    /// Runs detached: once the event is handed to the WAL, a caller that
    /// drops its future can't leave the log ahead of memory.
    pub(super) async fn commit(&self, mut txn: Txn, event: Event) -> Result<(), EngineError> {
        let tables = self.tables.clone();
        let wal_tx = self.wal_tx.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            wal_append(&wal_tx, &event).await?;
            let (touched, _) = event_scope(&tables, &event);
            let notice = apply_event(&tables, &mut txn, &event);
            drop(txn);
            for rid in touched {
                notify.send(rid, &event);
            }
            if let Some(notice) = notice {
                notify.send_reminder(notice);
            }
            Ok::<(), EngineError>(())
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
