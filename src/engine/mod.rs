mod availability;
mod error;
mod lifecycle;
mod payment;
mod queries;
mod requests;
mod rules;
#[cfg(test)]
mod tests;

pub use availability::{first_conflict, free_windows, is_available, merge_overlapping, subtract_stays};
pub use error::EngineError;
pub use rules::BookingPolicy;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::{Notification, NotificationKind, Notifier, Recipient};
use crate::wal::Wal;

pub type SharedVanState = Arc<RwLock<VanState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for one fsync on behalf of the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Compaction must see every append queued ahead of it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so stray buffered bytes never ride
    // along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
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
        // Appends never reach here; the writer loop batches them.
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside batch")));
        }
    }
}

/// Apply an event to its van. Caller holds the van's write lock, and the
/// event is already durable. `VanAdded` is handled at the map level.
fn apply_event(vs: &mut VanState, event: &Event, locator: &DashMap<Ulid, Ulid>) {
    match event {
        Event::VanAdded { .. } => {}
        Event::VanRepriced { daily_rate, .. } => vs.van.daily_rate = *daily_rate,
        Event::BookingCreated {
            id,
            van_id,
            requester_id,
            stay,
            total_price,
            created_at,
        } => {
            vs.insert_booking(Booking {
                id: *id,
                van_id: *van_id,
                requester_id: *requester_id,
                stay: *stay,
                total_price: *total_price,
                status: BookingStatus::Pending,
                created_at: *created_at,
            });
        }
        Event::BookingRescheduled { id, stay, total_price, .. } => {
            vs.reschedule(*id, *stay, *total_price);
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(b) = vs.booking_mut(id) {
                b.status = BookingStatus::Confirmed;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = vs.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::ChangeRequested {
            id,
            booking_id,
            proposed,
            created_at,
            ..
        } => {
            vs.change_requests.push(ChangeRequest {
                id: *id,
                booking_id: *booking_id,
                proposed: *proposed,
                status: RequestStatus::Pending,
                created_at: *created_at,
            });
        }
        Event::ChangeApproved {
            id,
            booking_id,
            stay,
            total_price,
            ..
        } => {
            vs.reschedule(*booking_id, *stay, *total_price);
            if let Some(r) = vs.change_request_mut(id) {
                r.status = RequestStatus::Approved;
            }
        }
        Event::ChangeRejected { id, .. } => {
            if let Some(r) = vs.change_request_mut(id) {
                r.status = RequestStatus::Rejected;
            }
        }
        Event::CancellationRequested {
            id,
            booking_id,
            created_at,
            ..
        } => {
            vs.cancellation_requests.push(CancellationRequest {
                id: *id,
                booking_id: *booking_id,
                status: RequestStatus::Pending,
                created_at: *created_at,
            });
        }
        Event::CancellationApproved { id, booking_id, .. } => {
            if let Some(b) = vs.booking_mut(booking_id) {
                b.status = BookingStatus::Cancelled;
            }
            if let Some(r) = vs.cancellation_request_mut(id) {
                r.status = RequestStatus::Approved;
            }
        }
        Event::CancellationRejected { id, .. } => {
            if let Some(r) = vs.cancellation_request_mut(id) {
                r.status = RequestStatus::Rejected;
            }
        }
    }
    if let Some(id) = event.introduced_entity() {
        locator.insert(id, event.van_id());
    }
}

/// Metrics label for a committed event.
fn event_label(event: &Event) -> &'static str {
    match event {
        Event::VanAdded { .. } => "van_added",
        Event::VanRepriced { .. } => "van_repriced",
        Event::BookingCreated { .. } => "booking_created",
        Event::BookingRescheduled { .. } => "booking_rescheduled",
        Event::BookingConfirmed { .. } => "booking_confirmed",
        Event::BookingCancelled { .. } => "booking_cancelled",
        Event::ChangeRequested { .. } => "change_requested",
        Event::ChangeApproved { .. } => "change_approved",
        Event::ChangeRejected { .. } => "change_rejected",
        Event::CancellationRequested { .. } => "cancellation_requested",
        Event::CancellationApproved { .. } => "cancellation_approved",
        Event::CancellationRejected { .. } => "cancellation_rejected",
    }
}

/// Minimal event sequence that rebuilds `vs` on replay.
fn snapshot_events(vs: &VanState, events: &mut Vec<Event>) {
    let van = &vs.van;
    events.push(Event::VanAdded {
        id: van.id,
        name: van.name.clone(),
        daily_rate: van.daily_rate,
        capacity: van.capacity,
    });
    for b in &vs.bookings {
        events.push(Event::BookingCreated {
            id: b.id,
            van_id: van.id,
            requester_id: b.requester_id,
            stay: b.stay,
            total_price: b.total_price,
            created_at: b.created_at,
        });
        match b.status {
            BookingStatus::Pending => {}
            BookingStatus::Confirmed => events.push(Event::BookingConfirmed { id: b.id, van_id: van.id }),
            BookingStatus::Cancelled => events.push(Event::BookingCancelled { id: b.id, van_id: van.id }),
        }
    }
    for r in &vs.change_requests {
        events.push(Event::ChangeRequested {
            id: r.id,
            booking_id: r.booking_id,
            van_id: van.id,
            proposed: r.proposed,
            created_at: r.created_at,
        });
        match r.status {
            RequestStatus::Pending => {}
            // The booking already carries the approved dates; re-applying
            // its current stay only closes the request.
            RequestStatus::Approved => {
                if let Some(b) = vs.booking(&r.booking_id) {
                    events.push(Event::ChangeApproved {
                        id: r.id,
                        booking_id: b.id,
                        van_id: van.id,
                        stay: b.stay,
                        total_price: b.total_price,
                    });
                }
            }
            RequestStatus::Rejected => events.push(Event::ChangeRejected { id: r.id, van_id: van.id }),
        }
    }
    for r in &vs.cancellation_requests {
        events.push(Event::CancellationRequested {
            id: r.id,
            booking_id: r.booking_id,
            van_id: van.id,
            created_at: r.created_at,
        });
        match r.status {
            RequestStatus::Pending => {}
            RequestStatus::Approved => events.push(Event::CancellationApproved {
                id: r.id,
                booking_id: r.booking_id,
                van_id: van.id,
            }),
            RequestStatus::Rejected => {
                events.push(Event::CancellationRejected { id: r.id, van_id: van.id });
            }
        }
    }
}

/// A locator entry held for an id whose introducing event is not yet durable.
pub(super) struct IdReservation<'a> {
    locator: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    committed: bool,
}

impl IdReservation<'_> {
    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.locator.remove(&self.id);
        }
    }
}

pub struct Engine {
    vans: DashMap<Ulid, SharedVanState>,
    wal_tx: mpsc::Sender<WalCommand>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
    /// Booking or request id → owning van.
    locator: DashMap<Ulid, Ulid>,
    /// Serializes van registration against compaction.
    catalog: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the background writer.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf, notifier: Arc<dyn Notifier>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(path = %wal_path.display(), "discarded damaged WAL tail");
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let locator = DashMap::new();
        let mut vans: HashMap<Ulid, VanState> = HashMap::new();
        for event in &replay.events {
            if let Event::VanAdded { id, name, daily_rate, capacity } = event {
                vans.insert(
                    *id,
                    VanState::new(Van {
                        id: *id,
                        name: name.clone(),
                        daily_rate: *daily_rate,
                        capacity: *capacity,
                    }),
                );
                continue;
            }
            match vans.get_mut(&event.van_id()) {
                Some(vs) => apply_event(vs, event, &locator),
                None => warn!(van = %event.van_id(), "WAL event for unknown van skipped"),
            }
        }
        info!(
            vans = vans.len(),
            events = replay.events.len(),
            "replayed WAL from {}",
            wal_path.display()
        );

        Ok(Self {
            vans: vans
                .into_iter()
                .map(|(id, vs)| (id, Arc::new(RwLock::new(vs))))
                .collect(),
            wal_tx,
            notifier,
            clock: Arc::new(SystemClock),
            policy: BookingPolicy::default(),
            locator,
            catalog: Mutex::new(()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: BookingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> BookingPolicy {
        self.policy
    }

    async fn wal_send(&self, cmd: WalCommand) -> Result<(), EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn van(&self, id: &Ulid) -> Option<SharedVanState> {
        self.vans.get(id).map(|e| e.value().clone())
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        vs: &mut VanState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(vs, event, &self.locator);
        metrics::counter!(crate::observability::EVENTS_COMMITTED_TOTAL, "event" => event_label(event))
            .increment(1);
        Ok(())
    }

    /// Locate the van owning a booking or request and take its write lock.
    pub(super) async fn resolve_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<VanState>, EngineError> {
        let van = self.locate(entity_id)?;
        Ok(van.write_owned().await)
    }

    pub(super) async fn resolve_read(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<VanState>, EngineError> {
        let van = self.locate(entity_id)?;
        Ok(van.read_owned().await)
    }

    /// Claim a fresh booking or request id for `van_id`. The claim is
    /// atomic across vans and is released on drop unless committed.
    pub(super) fn reserve_id(&self, id: Ulid, van_id: Ulid) -> Result<IdReservation<'_>, EngineError> {
        match self.locator.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(van_id);
                Ok(IdReservation {
                    locator: &self.locator,
                    id,
                    committed: false,
                })
            }
        }
    }

    fn locate(&self, entity_id: &Ulid) -> Result<SharedVanState, EngineError> {
        let van_id = self
            .locator
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.van(&van_id).ok_or(EngineError::NotFound(*entity_id))
    }

    pub(super) fn today(&self) -> chrono::NaiveDate {
        self.clock.today()
    }

    pub(super) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Publish after the mutation is durable. Failures stay with the notifier.
    pub(super) fn notify(
        &self,
        kind: NotificationKind,
        recipient: Recipient,
        vs: &VanState,
        booking: &Booking,
        request_id: Option<Ulid>,
        stay: Stay,
    ) {
        let notification = Notification {
            kind,
            recipient,
            booking_id: booking.id,
            request_id,
            van_id: vs.van.id,
            van_name: vs.van.name.clone(),
            requester_id: booking.requester_id,
            stay,
            total_price: booking.total_price,
        };
        if let Err(e) = self.notifier.publish(notification) {
            warn!(kind = kind.as_str(), booking = %booking.id, "notification publish failed: {e}");
            metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
        }
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    /// Holds every van's read lock until the new file is in place, so no
    /// mutation can slip between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut van_ids: Vec<Ulid> = self.vans.iter().map(|e| *e.key()).collect();
        van_ids.sort();

        let mut guards = Vec::with_capacity(van_ids.len());
        for id in &van_ids {
            if let Some(van) = self.van(id) {
                guards.push(van.read_owned().await);
            }
        }
        let mut events = Vec::new();
        for guard in &guards {
            snapshot_events(guard, &mut events);
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_send(WalCommand::Compact { events, response: tx }).await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(vans = guards.len(), events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
