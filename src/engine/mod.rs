mod availability;
mod catalog;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod payment;
mod queries;
mod reference;
mod store;

pub use availability::{free_slots, merge_overlapping, open_hours, subtract_intervals, within_open_hours};
pub use conflict::{find_conflicts, has_conflict, occupies_slot};
pub use error::{EngineError, ErrorKind};
pub use lifecycle::{initial_status, next_status, Action, CancellationPolicy};
pub use payment::{
    sign_webhook, verify_webhook, CheckoutRequest, CheckoutSession, GatewayError, GatewaySession,
    MockPaymentGateway, PaymentEvent, PaymentEventKind, PaymentGateway, PaymentOutcome,
};
pub use reference::{is_well_formed as is_well_formed_reference, random_reference};
pub use store::{InMemoryStore, RoomState, SharedRoomState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

use payment::PendingCheckout;
use store::event_room_id;

/// Behavioural switches, fixed at startup.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bookings are only created from completed payment sessions.
    pub payment_required: bool,
    pub cancellation_policy: CancellationPolicy,
    /// How long an unpaid checkout keeps its reference reserved.
    pub checkout_ttl: chrono::Duration,
    /// Upper bound on waiting for a room lock or a WAL queue slot.
    pub lock_timeout: Duration,
    pub currency: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            payment_required: false,
            cancellation_policy: CancellationPolicy::Lenient,
            checkout_ttl: chrono::Duration::minutes(30),
            lock_timeout: Duration::from_secs(5),
            currency: "aud".into(),
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
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

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal<Event>, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} event(s): {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // Every sender hears Err, so no part of the batch may survive on disk.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("WAL rollback failed, refusing writes until compaction: {e}");
    }
    result
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

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The booking engine: in-memory state rebuilt from the WAL, one lock per room.
///
/// Every write that claims or releases a slot holds its room's write lock across
/// conflict check, WAL append and in-memory apply, so check-and-insert is atomic
/// per room. Writes also hold a shared commit gate that compaction takes
/// exclusively, so a snapshot never misses an acknowledged write.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Serializes read-modify-write of visitor and admin rows.
    pub(super) accounts: Mutex<()>,
    pub(super) options: EngineOptions,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    /// Unpaid checkouts by payment session id. Never persisted.
    pub(super) checkouts: DashMap<String, PendingCheckout>,
}

impl Engine {
    /// Engine on the system clock with the local mock payment gateway.
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        Self::with_collaborators(
            wal_path,
            options,
            Arc::new(SystemClock),
            Arc::new(MockPaymentGateway::new()),
        )
    }

    pub fn with_collaborators(
        wal_path: PathBuf,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> io::Result<Self> {
        let (events, wal) = Wal::<Event>::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            accounts: Mutex::new(()),
            options,
            clock,
            gateway,
            checkouts: DashMap::new(),
        };

        // We own every lock during replay, so try_write always succeeds.
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            events = events.len(),
            rooms = engine.store.room_count(),
            bookings = engine.store.booking_count(),
            "replayed WAL from {}",
            wal_path.display()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::BookingRescheduled {
                booking,
                from_room,
                from_date,
            } if *from_room != booking.room_id => {
                let (Some(from), Some(to)) = (self.store.room(*from_room), self.store.room(booking.room_id))
                else {
                    return;
                };
                if let (Ok(mut f), Ok(mut t)) = (from.try_write(), to.try_write()) {
                    self.store.apply_move(&mut f, &mut t, booking, *from_date);
                }
            }
            other => match event_room_id(other) {
                Some(room_id) => {
                    if let Some(rs) = self.store.room(room_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        self.store.apply_to_room(&mut guard, other);
                    }
                }
                None => self.store.apply_global(other),
            },
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Write event to WAL via the background group-commit writer.
    ///
    /// Only the enqueue is bounded by the lock timeout. Once queued, the
    /// outcome is always awaited so memory never diverges from the log.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        tokio::time::timeout(self.options.lock_timeout, self.wal_tx.send(cmd))
            .await
            .map_err(|_| EngineError::Transient("timed out queueing WAL write".into()))?
            .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transient(e.to_string()))
    }

    /// Shared side of the commit gate. Taken once per write, before any room lock.
    pub(super) async fn begin_write(&self) -> Result<OwnedRwLockReadGuard<()>, EngineError> {
        tokio::time::timeout(self.options.lock_timeout, self.commit_gate.clone().read_owned())
            .await
            .map_err(|_| EngineError::Transient("timed out waiting for compaction".into()))
    }

    pub(super) async fn lock_room(
        &self,
        room_id: RoomId,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .store
            .room(room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = tokio::time::timeout(self.options.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::Transient(format!("timed out locking room {room_id}")))?;
        // The room may have been deleted while we waited.
        if self.store.room(room_id).is_none() {
            return Err(EngineError::not_found("room", room_id));
        }
        Ok(guard)
    }

    pub(super) async fn read_room(
        &self,
        room_id: RoomId,
    ) -> Result<OwnedRwLockReadGuard<RoomState>, EngineError> {
        let rs = self
            .store
            .room(room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        tokio::time::timeout(self.options.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| EngineError::Transient(format!("timed out reading room {room_id}")))
    }

    /// WAL-append then apply to the locked room.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_room(rs, event);
        Ok(())
    }

    /// WAL-append then apply an event with no room scope.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_global(event);
        Ok(())
    }

    /// Locate a booking and write-lock its room. Retries if the booking moves
    /// to another room between lookup and lock.
    pub(super) async fn resolve_booking_write(
        &self,
        id: BookingId,
    ) -> Result<(OwnedRwLockWriteGuard<RoomState>, chrono::NaiveDate), EngineError> {
        for _ in 0..3 {
            let (room_id, date) = self
                .store
                .booking_location(id)
                .ok_or_else(|| EngineError::not_found("booking", id))?;
            let guard = self.lock_room(room_id).await?;
            if self.store.booking_location(id) == Some((room_id, date)) {
                return Ok((guard, date));
            }
        }
        Err(EngineError::Transient(format!("booking {id} moved while locking")))
    }
}
