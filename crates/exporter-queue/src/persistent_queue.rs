// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-recoverable FIFO queue persisted through a storage [`Client`].
//!
//! # Layout
//!
//! Every key is prefixed with the queue name:
//!
//! ```text
//! <name>/ri       read index, u64 little-endian
//! <name>/wi       write index, u64 little-endian
//! <name>/di       in-flight indexes, concatenated u64 little-endian
//! <name>/<index>  encoded request stored in slot <index>
//! ```
//!
//! # Dispatch
//!
//! A single coordinator task hands items to consumers. A consumer registers a
//! one-shot slot through [`Deliveries::recv`]; the coordinator reads the next
//! item only once an unread item and a live slot are both present, so an item
//! is never counted as backlog and as in flight at the same time. An item
//! that reached a slot whose receiver was dropped before taking it goes back
//! to the coordinator and is handed out again ahead of unread items.
//!
//! # Recovery
//!
//! Items left in flight by a previous process are reclaimed when the queue is
//! built and enqueued again at the back of the queue. Their completion removes
//! the persisted record; until then a crash leads to redelivery.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::errors::{CodecError, QueueError};
use crate::request::Request;
use crate::storage::{Client, Operation};
use crate::telemetry::QueueTelemetry;

const READ_INDEX_KEY: &str = "ri";
const WRITE_INDEX_KEY: &str = "wi";
const IN_FLIGHT_KEY: &str = "di";

type Slot<R> = oneshot::Sender<Delivery<R>>;

struct IndexState {
    read_index: u64,
    write_index: u64,
    /// Read but not yet completed, in dispatch order.
    in_flight: Vec<u64>,
}

/// Names of the queues currently open, keyed by storage client instance.
fn open_queues() -> &'static Mutex<HashSet<(usize, String)>> {
    static OPEN_QUEUES: OnceLock<Mutex<HashSet<(usize, String)>>> = OnceLock::new();
    OPEN_QUEUES.get_or_init(Default::default)
}

/// Reserves a queue name on one client until the queue state is dropped,
/// i.e. once the handle, the coordinator and every pending completion are gone.
struct NameClaim {
    client: usize,
    name: String,
}

impl NameClaim {
    fn acquire(client: &Arc<dyn Client>, name: &str) -> Result<Self, QueueError> {
        let client = Arc::as_ptr(client) as *const () as usize;
        let mut open = open_queues()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !open.insert((client, name.to_string())) {
            return Err(QueueError::NameInUse(name.to_string()));
        }
        Ok(Self {
            client,
            name: name.to_string(),
        })
    }
}

impl Drop for NameClaim {
    fn drop(&mut self) {
        let key = (self.client, std::mem::take(&mut self.name));
        open_queues()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }
}

/// Queue state shared by the handle, the coordinator and every completion.
struct Shared {
    // Released before the client it points at.
    _claim: NameClaim,
    name: String,
    capacity: u64,
    client: Arc<dyn Client>,
    telemetry: Arc<dyn QueueTelemetry>,
    state: Mutex<IndexState>,
    size: AtomicU64,
    /// One permit per persisted-but-unread item.
    available: Semaphore,
    stopped: CancellationToken,
}

enum IndexLoad {
    Loaded { read: u64, write: u64 },
    Missing,
    Invalid(String),
}

impl Shared {
    fn key(&self, suffix: &str) -> String {
        format!("{}/{}", self.name, suffix)
    }

    fn item_key(&self, index: u64) -> String {
        format!("{}/{}", self.name, index)
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads the persisted indexes. Missing or unreadable metadata starts an
    /// empty queue.
    fn load_indexes(&self) {
        let mut ops = [
            Operation::get(self.key(READ_INDEX_KEY)),
            Operation::get(self.key(WRITE_INDEX_KEY)),
        ];
        let load = match self.client.batch(&mut ops) {
            Err(err) => IndexLoad::Invalid(err.to_string()),
            Ok(()) => match (ops[0].take_value(), ops[1].take_value()) {
                (None, None) => IndexLoad::Missing,
                (Some(read), Some(write)) => {
                    match (bytes_to_index(&read), bytes_to_index(&write)) {
                        (Ok(read), Ok(write)) if read <= write => IndexLoad::Loaded { read, write },
                        (Ok(read), Ok(write)) => IndexLoad::Invalid(format!(
                            "read index {read} is ahead of write index {write}"
                        )),
                        (Err(err), _) | (_, Err(err)) => IndexLoad::Invalid(err.to_string()),
                    }
                }
                _ => IndexLoad::Invalid("index metadata is incomplete".to_string()),
            },
        };

        let (read, write) = match load {
            IndexLoad::Loaded { read, write } => (read, write),
            IndexLoad::Missing => {
                info!("Initializing new persistent queue {}", self.name);
                (0, 0)
            }
            IndexLoad::Invalid(reason) => {
                error!(
                    "Failed getting read/write index of queue {}, starting with new ones: {reason}",
                    self.name
                );
                (0, 0)
            }
        };

        let mut state = self.lock();
        state.read_index = read;
        state.write_index = write;
        let size = write - read;
        self.size.store(size, Ordering::SeqCst);
        self.telemetry.on_size_change(&self.name, size);
    }

    /// Removes the items a previous run left in flight and returns them,
    /// oldest first, so they can be enqueued again.
    fn reclaim_in_flight<R: Request>(&self) -> Vec<R> {
        let mut state = self.lock();
        let in_flight_key = self.key(IN_FLIGHT_KEY);

        let mut indexes = match self.client.get(&in_flight_key) {
            Ok(Some(bytes)) => match bytes_to_indexes(&bytes) {
                Ok(indexes) => indexes,
                Err(err) => {
                    error!(
                        "Could not decode items left in flight by queue {}: {err}",
                        self.name
                    );
                    return Vec::new();
                }
            },
            Ok(None) => return Vec::new(),
            Err(err) => {
                error!(
                    "Could not fetch items left in flight by queue {}: {err}",
                    self.name
                );
                return Vec::new();
            }
        };
        if indexes.is_empty() {
            return Vec::new();
        }
        indexes.sort_unstable();
        indexes.dedup();
        info!(
            "Fetching {} items left in flight by a previous run of queue {}",
            indexes.len(),
            self.name
        );

        let mut retrieve: Vec<Operation> = indexes
            .iter()
            .map(|index| Operation::get(self.item_key(*index)))
            .collect();
        if let Err(err) = self.client.batch(&mut retrieve) {
            // Kept in the in-flight list so the next start tries again.
            warn!(
                "Failed retrieving items left in flight by queue {}, keeping them for the next start: {err}",
                self.name
            );
            self.telemetry
                .on_outstanding_change(&self.name, indexes.len() as u64);
            state.in_flight = indexes;
            return Vec::new();
        }

        let mut cleanup: Vec<Operation> = indexes
            .iter()
            .map(|index| Operation::delete(self.item_key(*index)))
            .collect();
        cleanup.push(Operation::set(in_flight_key, Vec::new()));
        if let Err(err) = self.client.batch(&mut cleanup) {
            debug!(
                "Failed cleaning items left in flight by queue {}: {err}",
                self.name
            );
        }

        let mut requests = Vec::with_capacity(retrieve.len());
        for op in retrieve.iter_mut() {
            let Some(bytes) = op.take_value() else {
                warn!("Failed retrieving item {}: value not set", op.key);
                continue;
            };
            match R::decode(&bytes) {
                Ok(request) => requests.push(request),
                Err(err) => warn!("Failed decoding item {}: {err}", op.key),
            }
        }
        self.telemetry
            .on_recovered(&self.name, requests.len() as u64);
        requests
    }

    fn put(&self, bytes: Vec<u8>) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.write_index - state.read_index >= self.capacity {
            self.telemetry.on_enqueue_rejected(&self.name);
            return Err(QueueError::CapacityExceeded);
        }

        let index = state.write_index;
        let next = index + 1;
        // The record and the write index commit together or not at all.
        self.client.batch(&mut [
            Operation::set(self.key(WRITE_INDEX_KEY), index_to_bytes(next)),
            Operation::set(self.item_key(index), bytes),
        ])?;

        state.write_index = next;
        let size = next - state.read_index;
        self.size.store(size, Ordering::SeqCst);
        self.telemetry.on_size_change(&self.name, size);
        drop(state);

        self.available.add_permits(1);
        Ok(())
    }

    /// Moves the item at the read index in flight and returns it. Returns
    /// `None` when nothing is unread or the record cannot be fetched.
    fn read_next<R: Request>(&self) -> Option<(u64, R)> {
        let mut state = self.lock();
        if state.read_index == state.write_index {
            return None;
        }

        let index = state.read_index;
        state.read_index += 1;
        state.in_flight.push(index);
        let size = state.write_index - state.read_index;
        self.size.store(size, Ordering::SeqCst);
        self.telemetry.on_size_change(&self.name, size);
        self.telemetry
            .on_outstanding_change(&self.name, state.in_flight.len() as u64);

        let mut ops = [
            Operation::set(self.key(READ_INDEX_KEY), index_to_bytes(state.read_index)),
            Operation::set(self.key(IN_FLIGHT_KEY), indexes_to_bytes(&state.in_flight)),
            Operation::get(self.item_key(index)),
        ];
        let fetched = match self.client.batch(&mut ops) {
            Ok(()) => match ops[2].take_value() {
                Some(bytes) => R::decode(&bytes).map_err(|err| err.to_string()),
                None => Err("value not set".to_string()),
            },
            Err(err) => Err(err.to_string()),
        };

        match fetched {
            Ok(request) => Some((index, request)),
            Err(reason) => {
                debug!(
                    "Failed to dispatch item {index} of queue {}: {reason}",
                    self.name
                );
                self.finish_locked(&mut state, index);
                None
            }
        }
    }

    fn finish(&self, index: u64) {
        let mut state = self.lock();
        self.finish_locked(&mut state, index);
    }

    fn finish_locked(&self, state: &mut IndexState, index: u64) {
        if let Some(position) = state.in_flight.iter().position(|i| *i == index) {
            state.in_flight.remove(position);
        }
        self.telemetry
            .on_outstanding_change(&self.name, state.in_flight.len() as u64);

        let in_flight_key = self.key(IN_FLIGHT_KEY);
        let item_key = self.item_key(index);
        let in_flight = indexes_to_bytes(&state.in_flight);
        let mut ops = [
            Operation::set(in_flight_key.as_str(), in_flight.clone()),
            Operation::delete(item_key.as_str()),
        ];
        let Err(err) = self.client.batch(&mut ops) else {
            return;
        };

        // Deleting the record matters more than an accurate in-flight list:
        // a stale list entry without a record is skipped by recovery.
        warn!(
            "Failed updating in-flight items of queue {}, trying to delete the item first: {err}",
            self.name
        );
        if let Err(err) = self.client.delete(&item_key) {
            error!(
                "Error deleting item {index} from queue {}: {err}",
                self.name
            );
            return;
        }
        if let Err(err) = self.client.set(&in_flight_key, in_flight) {
            error!(
                "Error updating in-flight items of queue {}: {err}",
                self.name
            );
        }
    }
}

/// Completion hook of one dispatched item.
///
/// Consumed by [`Completion::complete`] or [`Completion::release`], so it
/// fires at most once. Dropping it behaves like `release`.
pub struct Completion {
    index: u64,
    shared: Option<Arc<Shared>>,
}

impl Completion {
    /// Marks the item processed: removes it from the in-flight list and
    /// deletes its persisted record.
    pub fn complete(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish(self.index);
        }
    }

    /// Gives up on the item without deleting it. It stays in flight and is
    /// redelivered after the next restart.
    pub fn release(mut self) {
        if let Some(shared) = self.shared.take() {
            debug!(
                "Item {} of queue {} released for the next recovery pass",
                self.index, shared.name
            );
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            debug!(
                "Item {} of queue {} dropped without completion, left for recovery",
                self.index, shared.name
            );
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("index", &self.index)
            .field("pending", &self.shared.is_some())
            .finish()
    }
}

/// A request handed to a consumer together with its completion hook.
#[derive(Debug)]
pub struct Delivery<R> {
    request: R,
    completion: Completion,
}

impl<R> Delivery<R> {
    pub fn request(&self) -> &R {
        &self.request
    }

    /// Slot the item was written to.
    pub fn index(&self) -> u64 {
        self.completion.index
    }

    pub fn into_parts(self) -> (R, Completion) {
        (self.request, self.completion)
    }

    pub fn complete(self) {
        self.completion.complete();
    }

    pub fn release(self) {
        self.completion.release();
    }
}

/// Consumer handle returned by [`PersistentQueue::dequeue`]. Clones share the
/// same queue; each item goes to exactly one of them.
pub struct Deliveries<R> {
    demand: mpsc::Sender<Slot<R>>,
    returns: mpsc::UnboundedSender<Delivery<R>>,
}

impl<R> Clone for Deliveries<R> {
    fn clone(&self) -> Self {
        Self {
            demand: self.demand.clone(),
            returns: self.returns.clone(),
        }
    }
}

impl<R: Request> Deliveries<R> {
    /// Waits for the next item. Returns `None` once the queue is stopped.
    ///
    /// Cancel safe: an item is only read from the queue once a waiting
    /// receiver is present. If this future is dropped after the item reached
    /// its slot, the item goes back to the coordinator for the next receiver.
    pub async fn recv(&self) -> Option<Delivery<R>> {
        let (slot, delivery) = oneshot::channel();
        self.demand.send(slot).await.ok()?;
        let mut pending = PendingDelivery {
            delivery,
            returns: self.returns.clone(),
        };
        (&mut pending.delivery).await.ok()
    }
}

/// Receiving end of a registered slot.
struct PendingDelivery<R> {
    delivery: oneshot::Receiver<Delivery<R>>,
    returns: mpsc::UnboundedSender<Delivery<R>>,
}

impl<R> Drop for PendingDelivery<R> {
    fn drop(&mut self) {
        // After close() the coordinator can no longer fill the slot, so
        // whatever is in it now is the last item it will ever hold.
        self.delivery.close();
        if let Ok(delivery) = self.delivery.try_recv() {
            if let Err(returned) = self.returns.send(delivery) {
                debug!(
                    "Queue stopped, item {} left for recovery",
                    returned.0.index()
                );
            }
        }
    }
}

/// Durable FIFO queue of requests, one per configured queue name.
pub struct PersistentQueue<R> {
    shared: Arc<Shared>,
    demand: mpsc::Sender<Slot<R>>,
    returns: mpsc::UnboundedSender<Delivery<R>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    _request: PhantomData<fn() -> R>,
}

impl<R: Request> PersistentQueue<R> {
    /// Loads the queue state from `client`, reclaims items a previous run left
    /// in flight and starts the dispatch coordinator.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`QueueError::NameInUse`] while another queue with the same name is
    /// open on the same `client`.
    pub fn new(
        config: QueueConfig,
        client: Arc<dyn Client>,
        telemetry: Arc<dyn QueueTelemetry>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| QueueError::Runtime(err.to_string()))?;
        let claim = NameClaim::acquire(&client, &config.name)?;

        let shared = Arc::new(Shared {
            _claim: claim,
            name: config.name,
            capacity: config.capacity,
            client,
            telemetry,
            state: Mutex::new(IndexState {
                read_index: 0,
                write_index: 0,
                in_flight: Vec::new(),
            }),
            size: AtomicU64::new(0),
            available: Semaphore::new(0),
            stopped: CancellationToken::new(),
        });

        shared.load_indexes();
        let backlog = shared.size.load(Ordering::SeqCst);
        let reclaimed = shared.reclaim_in_flight::<R>();

        let (demand, demand_rx) = mpsc::channel(config.num_consumers);
        let (returns, returns_rx) = mpsc::unbounded_channel();
        let dispatcher = runtime.spawn(dispatch::<R>(Arc::clone(&shared), demand_rx, returns_rx));

        let queue = Self {
            shared,
            demand,
            returns,
            dispatcher: Mutex::new(Some(dispatcher)),
            _request: PhantomData,
        };

        let total = reclaimed.len();
        let mut failed = 0;
        for request in reclaimed {
            if let Err(err) = queue.enqueue(request) {
                failed += 1;
                error!(
                    "Failed re-enqueueing item left in flight by queue {}, dropping it: {err}",
                    queue.shared.name
                );
            }
        }
        if total > 0 {
            info!(
                "Moved {} of {total} items left in flight back to queue {}",
                total - failed,
                queue.shared.name
            );
        }

        // Items persisted by a previous run are signalled only now, after the
        // coordinator is running.
        queue.shared.available.add_permits(backlog as usize);
        debug!(
            "Queue {} started with {backlog} items waiting",
            queue.shared.name
        );
        Ok(queue)
    }

    /// Persists `request` at the back of the queue.
    ///
    /// Empty requests are accepted without being stored. Fails with
    /// [`QueueError::CapacityExceeded`] when the queue is full, in which case
    /// nothing is persisted.
    pub fn enqueue(&self, request: R) -> Result<(), QueueError> {
        if request.is_empty() {
            return Ok(());
        }
        if self.shared.stopped.is_cancelled() {
            return Err(QueueError::Stopped);
        }
        let bytes = request.encode()?;
        self.shared.put(bytes)
    }

    /// Returns a consumer handle yielding items in FIFO order.
    pub fn dequeue(&self) -> Deliveries<R> {
        Deliveries {
            demand: self.demand.clone(),
            returns: self.returns.clone(),
        }
    }

    /// Persisted items not yet handed to a consumer.
    pub fn size(&self) -> u64 {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// Items handed to a consumer and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.is_cancelled()
    }

    /// Stops dispatching and waits for the coordinator to exit. Persisted
    /// items, including those in flight, stay in storage for the next start.
    pub async fn stop(&self) {
        self.shared.stopped.cancel();
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(err) = dispatcher.await {
                error!(
                    "Dispatcher of queue {} terminated abnormally: {err}",
                    self.shared.name
                );
            }
            debug!("Queue {} stopped", self.shared.name);
        }
    }
}

impl<R> Drop for PersistentQueue<R> {
    fn drop(&mut self) {
        self.shared.stopped.cancel();
    }
}

async fn dispatch<R: Request>(
    shared: Arc<Shared>,
    mut demand: mpsc::Receiver<Slot<R>>,
    mut returned: mpsc::UnboundedReceiver<Delivery<R>>,
) {
    debug!("Queue {} dispatcher started", shared.name);
    let mut waiting: Option<Slot<R>> = None;

    'dispatch: loop {
        // Items already in flight that a receiver gave back go first.
        let mut pending: Option<Delivery<R>> = tokio::select! {
            biased;
            _ = shared.stopped.cancelled() => break,
            delivery = returned.recv() => match delivery {
                Some(delivery) => Some(delivery),
                None => break,
            },
            permit = shared.available.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    None
                }
                Err(_) => break,
            },
        };

        loop {
            let slot = match waiting.take() {
                Some(slot) if !slot.is_closed() => slot,
                _ => tokio::select! {
                    biased;
                    _ = shared.stopped.cancelled() => break 'dispatch,
                    slot = demand.recv() => match slot {
                        Some(slot) if slot.is_closed() => continue,
                        Some(slot) => slot,
                        None => break 'dispatch,
                    },
                },
            };

            let delivery = match pending.take() {
                Some(delivery) => delivery,
                None => match returned.try_recv() {
                    // Returned while waiting for this slot; the permit taken
                    // for the unread item is given back.
                    Ok(delivery) => {
                        shared.available.add_permits(1);
                        delivery
                    }
                    Err(_) => match shared.read_next::<R>() {
                        Some((index, request)) => Delivery {
                            request,
                            completion: Completion {
                                index,
                                shared: Some(Arc::clone(&shared)),
                            },
                        },
                        None => {
                            waiting = Some(slot);
                            continue 'dispatch;
                        }
                    },
                },
            };

            match slot.send(delivery) {
                Ok(()) => continue 'dispatch,
                // The receiver went away; hand the item to the next one.
                Err(delivery) => pending = Some(delivery),
            }
        }
    }

    debug!("Queue {} dispatcher stopped", shared.name);
}

fn index_to_bytes(index: u64) -> Vec<u8> {
    index.to_le_bytes().to_vec()
}

fn bytes_to_index(bytes: &[u8]) -> Result<u64, CodecError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CodecError(format!("invalid index length {}", bytes.len())))?;
    Ok(u64::from_le_bytes(buf))
}

fn indexes_to_bytes(indexes: &[u64]) -> Vec<u8> {
    indexes.iter().flat_map(|i| i.to_le_bytes()).collect()
}

fn bytes_to_indexes(bytes: &[u8]) -> Result<Vec<u64>, CodecError> {
    if bytes.len() % 8 != 0 {
        return Err(CodecError(format!(
            "invalid index list length {}",
            bytes.len()
        )));
    }
    bytes.chunks_exact(8).map(bytes_to_index).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::tests::Label;
    use crate::storage::InMemoryClient;
    use crate::telemetry::{CountingTelemetry, NoopTelemetry};
    use std::time::Duration;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(50);

    fn config(capacity: u64) -> QueueConfig {
        QueueConfig {
            name: "traces".to_string(),
            capacity,
            num_consumers: 2,
        }
    }

    fn queue(client: &InMemoryClient, capacity: u64) -> PersistentQueue<Label> {
        PersistentQueue::new(
            config(capacity),
            Arc::new(client.clone()),
            Arc::new(NoopTelemetry),
        )
        .expect("queue")
    }

    async fn next(deliveries: &Deliveries<Label>) -> Delivery<Label> {
        timeout(WAIT, deliveries.recv())
            .await
            .expect("timed out waiting for an item")
            .expect("queue closed")
    }

    async fn assert_idle(deliveries: &Deliveries<Label>) {
        assert!(
            timeout(QUIET, deliveries.recv()).await.is_err(),
            "expected no item"
        );
    }

    #[test]
    fn index_encoding_round_trips() {
        assert_eq!(bytes_to_index(&index_to_bytes(42)).unwrap(), 42);
        assert_eq!(
            bytes_to_indexes(&indexes_to_bytes(&[3, 1, 7])).unwrap(),
            vec![3, 1, 7]
        );
        assert!(bytes_to_indexes(&[]).unwrap().is_empty());
        assert!(bytes_to_index(&[1, 2, 3]).is_err());
        assert!(bytes_to_indexes(&[0; 9]).is_err());
    }

    #[tokio::test]
    async fn capacity_bound_then_fifo_dequeue() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 2);

        queue.enqueue(Label::new("r1")).unwrap();
        queue.enqueue(Label::new("r2")).unwrap();
        assert!(matches!(
            queue.enqueue(Label::new("r3")),
            Err(QueueError::CapacityExceeded)
        ));
        assert_eq!(queue.size(), 2);

        let deliveries = queue.dequeue();
        let first = next(&deliveries).await;
        let second = next(&deliveries).await;
        assert_eq!(first.request(), &Label::new("r1"));
        assert_eq!(second.request(), &Label::new("r2"));
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.outstanding(), 2);

        first.complete();
        second.complete();
        assert_eq!(queue.outstanding(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn rejected_enqueue_persists_nothing() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 1);
        queue.enqueue(Label::new("r1")).unwrap();
        let keys_before = client.keys();

        assert!(queue.enqueue(Label::new("r2")).is_err());
        assert_eq!(client.keys(), keys_before);
        assert!(!client.contains_key("traces/1"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn empty_request_is_a_silent_no_op() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 1);
        queue.enqueue(Label::new("")).unwrap();
        assert_eq!(queue.size(), 0);
        assert!(client.is_empty());
        queue.stop().await;
    }

    #[tokio::test]
    async fn dequeued_item_is_redelivered_after_restart_until_completed() {
        let client = InMemoryClient::new();

        let first_run = queue(&client, 10);
        first_run.enqueue(Label::new("r1")).unwrap();
        let abandoned = next(&first_run.dequeue()).await;
        assert_eq!(abandoned.request(), &Label::new("r1"));
        first_run.stop().await;
        drop(abandoned);

        let second_run = queue(&client, 10);
        let deliveries = second_run.dequeue();
        let redelivered = next(&deliveries).await;
        assert_eq!(redelivered.request(), &Label::new("r1"));
        redelivered.complete();
        second_run.stop().await;

        let third_run = queue(&client, 10);
        assert_eq!(third_run.size(), 0);
        assert_idle(&third_run.dequeue()).await;
        third_run.stop().await;
        assert!(!client.contains_key("traces/0"));
    }

    #[tokio::test]
    async fn completion_deletes_the_record() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        queue.enqueue(Label::new("r1")).unwrap();
        assert!(client.contains_key("traces/0"));

        let delivery = next(&queue.dequeue()).await;
        assert_eq!(delivery.index(), 0);
        assert!(client.contains_key("traces/0"));
        delivery.complete();

        assert!(!client.contains_key("traces/0"));
        assert_eq!(client.get("traces/di").unwrap(), Some(Vec::new()));
        queue.stop().await;
    }

    #[tokio::test]
    async fn backlog_from_previous_run_is_drained_in_order() {
        let client = InMemoryClient::new();
        let first_run = queue(&client, 10);
        for label in ["a", "b", "c"] {
            first_run.enqueue(Label::new(label)).unwrap();
        }
        first_run.stop().await;

        let second_run = queue(&client, 10);
        assert_eq!(second_run.size(), 3);
        let deliveries = second_run.dequeue();
        for label in ["a", "b", "c"] {
            let delivery = next(&deliveries).await;
            assert_eq!(delivery.request(), &Label::new(label));
            delivery.complete();
        }
        second_run.stop().await;
    }

    #[tokio::test]
    async fn reclaimed_items_go_to_the_back_of_the_queue() {
        let client = InMemoryClient::new();
        let first_run = queue(&client, 10);
        first_run.enqueue(Label::new("in-flight")).unwrap();
        let in_flight = next(&first_run.dequeue()).await;
        first_run.enqueue(Label::new("waiting")).unwrap();
        first_run.stop().await;
        in_flight.release();

        let second_run = queue(&client, 10);
        let deliveries = second_run.dequeue();
        assert_eq!(next(&deliveries).await.request(), &Label::new("waiting"));
        assert_eq!(next(&deliveries).await.request(), &Label::new("in-flight"));
        second_run.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn reclaimed_items_beyond_capacity_are_dropped() {
        let client = InMemoryClient::new();
        let first_run = queue(&client, 2);
        first_run.enqueue(Label::new("r1")).unwrap();
        let deliveries = first_run.dequeue();
        let in_flight = next(&deliveries).await;
        first_run.enqueue(Label::new("r2")).unwrap();
        first_run.enqueue(Label::new("r3")).unwrap();
        first_run.stop().await;
        drop(in_flight);

        let second_run = queue(&client, 2);
        assert_eq!(second_run.size(), 2);
        assert!(logs_contain("Failed re-enqueueing item left in flight"));
        second_run.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn corrupt_indexes_start_an_empty_queue() {
        let client = InMemoryClient::new();
        client.set("traces/ri", vec![1, 2, 3]).unwrap();
        client.set("traces/wi", index_to_bytes(5)).unwrap();

        let queue = queue(&client, 10);
        assert_eq!(queue.size(), 0);
        assert!(logs_contain("starting with new ones"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn failed_enqueue_write_leaves_queue_unchanged() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        client.fail_next_batches(1);

        assert!(matches!(
            queue.enqueue(Label::new("r1")),
            Err(QueueError::Storage(_))
        ));
        assert_eq!(queue.size(), 0);

        queue.enqueue(Label::new("r2")).unwrap();
        let delivery = next(&queue.dequeue()).await;
        assert_eq!(delivery.request(), &Label::new("r2"));
        assert_eq!(delivery.index(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn unreadable_record_is_skipped() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        queue.enqueue(Label::new("r1")).unwrap();
        queue.enqueue(Label::new("r2")).unwrap();
        client.set("traces/0", vec![0xff]).unwrap();

        let delivery = next(&queue.dequeue()).await;
        assert_eq!(delivery.request(), &Label::new("r2"));
        assert_eq!(queue.outstanding(), 1);
        assert!(!client.contains_key("traces/0"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn abandoned_receiver_does_not_lose_items() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        let deliveries = queue.dequeue();

        assert!(timeout(QUIET, deliveries.recv()).await.is_err());
        assert_eq!(queue.outstanding(), 0);

        queue.enqueue(Label::new("r1")).unwrap();
        let delivery = next(&deliveries).await;
        assert_eq!(delivery.request(), &Label::new("r1"));
        assert_eq!(queue.outstanding(), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn items_are_not_read_without_a_consumer() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        queue.enqueue(Label::new("r1")).unwrap();
        tokio::time::sleep(QUIET).await;
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.outstanding(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_deliveries_and_rejects_enqueue() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        let deliveries = queue.dequeue();
        let waiter = tokio::spawn({
            let deliveries = deliveries.clone();
            async move { deliveries.recv().await.is_none() }
        });

        queue.stop().await;
        queue.stop().await;
        assert!(waiter.await.unwrap());
        assert!(deliveries.recv().await.is_none());
        assert!(matches!(
            queue.enqueue(Label::new("r1")),
            Err(QueueError::Stopped)
        ));
    }

    #[tokio::test]
    async fn queues_sharing_a_client_are_independent() {
        let client = InMemoryClient::new();
        let traces = queue(&client, 10);
        let metrics = PersistentQueue::<Label>::new(
            QueueConfig {
                name: "metrics".to_string(),
                ..config(10)
            },
            Arc::new(client.clone()),
            Arc::new(NoopTelemetry),
        )
        .unwrap();

        traces.enqueue(Label::new("span")).unwrap();
        metrics.enqueue(Label::new("point")).unwrap();
        assert!(client.contains_key("traces/0"));
        assert!(client.contains_key("metrics/0"));

        assert_eq!(next(&metrics.dequeue()).await.request(), &Label::new("point"));
        assert_eq!(traces.size(), 1);
        traces.stop().await;
        metrics.stop().await;
    }

    #[tokio::test]
    async fn telemetry_follows_size_and_outstanding() {
        let client = InMemoryClient::new();
        let telemetry = CountingTelemetry::default();
        let queue = PersistentQueue::<Label>::new(
            config(1),
            Arc::new(client.clone()),
            Arc::new(telemetry.clone()),
        )
        .unwrap();

        queue.enqueue(Label::new("r1")).unwrap();
        assert_eq!(telemetry.snapshot().size, 1);
        assert!(queue.enqueue(Label::new("r2")).is_err());
        assert_eq!(telemetry.snapshot().rejected, 1);

        let delivery = next(&queue.dequeue()).await;
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.size, 0);
        assert_eq!(snapshot.outstanding, 1);

        delivery.complete();
        assert_eq!(telemetry.snapshot().outstanding, 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn item_left_in_a_dropped_receiver_goes_to_the_next_one() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        let deliveries = queue.dequeue();

        let mut abandoned = Box::pin(deliveries.recv());
        assert!(timeout(QUIET, &mut abandoned).await.is_err());
        queue.enqueue(Label::new("r1")).unwrap();
        queue.enqueue(Label::new("r2")).unwrap();
        // The coordinator fills the registered slot in the meantime.
        tokio::time::sleep(QUIET).await;
        assert_eq!(queue.outstanding(), 1);
        drop(abandoned);

        let first = next(&deliveries).await;
        assert_eq!(first.request(), &Label::new("r1"));
        assert_eq!(queue.outstanding(), 1);
        first.complete();
        assert_eq!(queue.outstanding(), 0);
        assert!(!client.contains_key("traces/0"));

        let second = next(&deliveries).await;
        assert_eq!(second.request(), &Label::new("r2"));
        second.complete();
        assert_eq!(queue.size(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn failed_read_skips_the_item_and_serves_the_next() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        queue.enqueue(Label::new("r1")).unwrap();
        queue.enqueue(Label::new("r2")).unwrap();
        client.fail_next_batches(1);

        let deliveries = queue.dequeue();
        let delivery = next(&deliveries).await;
        assert_eq!(delivery.request(), &Label::new("r2"));
        assert_eq!(delivery.index(), 1);
        assert_eq!(queue.outstanding(), 1);
        assert!(!client.contains_key("traces/0"));

        delivery.complete();
        assert_eq!(queue.outstanding(), 0);
        assert_eq!(queue.size(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_completion_batch_still_deletes_the_record() {
        let client = InMemoryClient::new();
        let queue = queue(&client, 10);
        queue.enqueue(Label::new("r1")).unwrap();
        let delivery = next(&queue.dequeue()).await;
        assert_eq!(client.get("traces/di").unwrap(), Some(index_to_bytes(0)));

        client.fail_next_batches(1);
        delivery.complete();

        assert!(logs_contain("trying to delete the item first"));
        assert!(!client.contains_key("traces/0"));
        assert_eq!(client.get("traces/di").unwrap(), Some(Vec::new()));
        assert_eq!(queue.outstanding(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn unretrievable_in_flight_items_are_kept_for_the_next_start() {
        let client = InMemoryClient::new();
        client.set("traces/ri", index_to_bytes(1)).unwrap();
        client.set("traces/wi", index_to_bytes(1)).unwrap();
        client.set("traces/di", index_to_bytes(0)).unwrap();
        client
            .set("traces/0", Label::new("left").encode().unwrap())
            .unwrap();

        // Index load and in-flight list read succeed, fetching the records fails.
        client.fail_batches_after(2, 1);
        let first_run = queue(&client, 10);
        assert!(logs_contain("keeping them for the next start"));
        assert_eq!(first_run.outstanding(), 1);

        // A later read and completion must not drop the kept index.
        first_run.enqueue(Label::new("fresh")).unwrap();
        let fresh = next(&first_run.dequeue()).await;
        assert_eq!(fresh.request(), &Label::new("fresh"));
        fresh.complete();
        assert_eq!(client.get("traces/di").unwrap(), Some(index_to_bytes(0)));
        first_run.stop().await;
        drop(first_run);

        let second_run = queue(&client, 10);
        let reclaimed = next(&second_run.dequeue()).await;
        assert_eq!(reclaimed.request(), &Label::new("left"));
        reclaimed.complete();
        assert!(!client.contains_key("traces/0"));
        second_run.stop().await;
    }

    #[tokio::test]
    async fn name_is_reserved_per_client_while_the_queue_is_open() {
        let client: Arc<dyn Client> = Arc::new(InMemoryClient::new());
        let open = |config: QueueConfig| {
            PersistentQueue::<Label>::new(config, Arc::clone(&client), Arc::new(NoopTelemetry))
        };

        let first = open(config(10)).unwrap();
        assert!(matches!(
            open(config(10)),
            Err(QueueError::NameInUse(ref name)) if name == "traces"
        ));
        let metrics = open(QueueConfig {
            name: "metrics".to_string(),
            ..config(10)
        })
        .unwrap();

        first.stop().await;
        drop(first);
        let reopened = open(config(10)).unwrap();
        reopened.stop().await;
        metrics.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = PersistentQueue::<Label>::new(
            QueueConfig {
                capacity: 0,
                ..config(1)
            },
            Arc::new(InMemoryClient::new()),
            Arc::new(NoopTelemetry),
        );
        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[test]
    fn construction_outside_a_runtime_fails() {
        let result = PersistentQueue::<Label>::new(
            config(1),
            Arc::new(InMemoryClient::new()),
            Arc::new(NoopTelemetry),
        );
        assert!(matches!(result, Err(QueueError::Runtime(_))));
    }
}
