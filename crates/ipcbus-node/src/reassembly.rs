//! The receive-side pipeline: fragment reassembly and context delivery.
//!
//! An [`AccumulatorMap`] owns a consumer thread fed from a bounded queue.
//! Multipart fragments are routed into per-GUID [`Accumulator`]s; plain
//! segments and completed chains are delivered to the [`ResponseContext`]
//! named by their correlation id, creating the context on demand. Contexts
//! created by a delivery (a reply arriving before anyone asked for it) are
//! tracked as orphans and dropped when nobody claims them within the
//! reassembly window. Partial messages are swept on a fixed tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, warn};

use ipcbus_wire::segment::{MsgType, Segment};

use crate::accumulator::Accumulator;
use crate::error::{NodeError, Result};
use crate::message::DeliveryHandler;
use crate::response::{PutOutcome, ResponseContext};
use crate::signal::SignalPool;

/// Hook for the component owning the map, notified from the consumer
/// thread. Held weakly so the owner may also own the map.
pub trait ReassemblyObserver: Send + Sync {
    /// A complete message is about to be delivered. The chain is ordered
    /// and non-empty.
    fn message_complete(&self, chain: &[Segment]);

    /// An incomplete message was discarded, either past its reassembly
    /// window or at shutdown.
    fn accumulator_expired(&self, guid: u64, received: u16, expected: u16);
}

#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Capacity of the queue between the receive thread and the consumer.
    pub queue_capacity: usize,
    /// How long an incomplete message (or an unclaimed reply) may linger.
    pub reassembly_timeout: Duration,
    /// Interval between expiry scans.
    pub sweep_tick: Duration,
    /// How long a delivery may wait on a context's dispatcher queue.
    pub delivery_timeout: Duration,
    /// Signals kept ready for synchronous response contexts.
    pub signal_pool_size: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            queue_capacity: 256,
            reassembly_timeout: Duration::from_secs(5),
            sweep_tick: Duration::from_secs(1),
            delivery_timeout: Duration::from_millis(250),
            signal_pool_size: 8,
        }
    }
}

enum MapEvent {
    Data(Segment),
    Sweep,
    Shutdown,
}

pub struct AccumulatorMap {
    shared: Arc<MapShared>,
    tx: Sender<MapEvent>,
    rx: Receiver<MapEvent>,
    closed: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct MapShared {
    config: MapConfig,
    pool: Arc<SignalPool>,
    contexts: Mutex<HashMap<u32, Arc<ResponseContext>>>,
    /// Contexts created by a delivery, keyed to their parking time. Claimed
    /// by any public lookup; swept with their stored chain otherwise.
    orphaned: Mutex<HashMap<u32, Instant>>,
    observer: Mutex<Option<Weak<dyn ReassemblyObserver>>>,
}

impl AccumulatorMap {
    pub fn new(config: MapConfig, pool: Arc<SignalPool>) -> Self {
        let (tx, rx) = bounded(config.queue_capacity);
        let shared = Arc::new(MapShared {
            config,
            pool,
            contexts: Mutex::new(HashMap::new()),
            orphaned: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            let rx = rx.clone();
            std::thread::spawn(move || consumer_loop(shared, rx))
        };

        AccumulatorMap {
            shared,
            tx,
            rx,
            closed: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn set_observer(&self, observer: Weak<dyn ReassemblyObserver>) {
        *self
            .shared
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Queue one received segment for reassembly, waiting up to `timeout`
    /// for space.
    pub fn submit(&self, seg: Segment, timeout: Duration) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::DispatchClosed);
        }
        match self.tx.send_timeout(MapEvent::Data(seg), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(NodeError::QueueRefused {
                pending: self.tx.len(),
            }),
            Err(SendTimeoutError::Disconnected(_)) => Err(NodeError::DispatchClosed),
        }
    }

    /// Ask the consumer to run an expiry scan ahead of its tick.
    pub fn request_sweep(&self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.tx.try_send(MapEvent::Sweep);
        }
    }

    /// Look up or create the context for `id`, claiming it if a delivery
    /// parked it earlier.
    pub fn context_for(&self, id: u32) -> Arc<ResponseContext> {
        self.shared
            .orphaned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let mut contexts = self
            .shared
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            contexts
                .entry(id)
                .or_insert_with(|| Arc::new(ResponseContext::new(self.shared.pool.acquire()))),
        )
    }

    pub fn get_context(&self, id: u32) -> Option<Arc<ResponseContext>> {
        self.shared
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Drop the context for `id`. The unsolicited context (id 0) is
    /// permanent and cannot be removed.
    pub fn remove_context(&self, id: u32) -> bool {
        if id == 0 {
            return false;
        }
        self.shared
            .orphaned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.shared
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Block up to `timeout` for the reply correlated to `msg_id`.
    ///
    /// The context is discarded afterwards whether or not a reply arrived,
    /// unless a handler holds it asynchronous or `msg_id` is 0.
    pub fn response(&self, msg_id: u32, timeout: Duration) -> Option<Vec<Segment>> {
        let ctx = self.context_for(msg_id);
        let chain = ctx.get(timeout);
        if msg_id != 0 && !ctx.has_dispatcher() {
            self.remove_context(msg_id);
        }
        chain
    }

    /// Register `handler` on context `ctx_id` with a pool of
    /// `worker_count` dispatch threads.
    pub fn register_handler(&self, ctx_id: u32, handler: DeliveryHandler, worker_count: usize) {
        self.context_for(ctx_id).register_handler(handler, worker_count);
    }

    /// Stop the consumer: queued segments are dropped, partial messages
    /// evicted with notification, and the thread joined.
    pub fn shutdown(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else { return };

        let _ = self.tx.send(MapEvent::Shutdown);
        let _ = handle.join();
        self.closed.store(true, Ordering::Release);

        let mut dropped = 0usize;
        while let Ok(event) = self.rx.try_recv() {
            if matches!(event, MapEvent::Data(_)) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued segments at shutdown");
        }
    }
}

impl Drop for AccumulatorMap {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consumer_loop(shared: Arc<MapShared>, rx: Receiver<MapEvent>) {
    let mut accums: HashMap<u64, Accumulator> = HashMap::new();
    let mut last_sweep = Instant::now();
    loop {
        match rx.recv_timeout(shared.config.sweep_tick) {
            Ok(MapEvent::Data(seg)) => shared.ingest(seg, &mut accums),
            Ok(MapEvent::Sweep) => {
                shared.evict(&mut accums, false);
                shared.sweep_orphans();
                last_sweep = Instant::now();
                continue;
            }
            Ok(MapEvent::Shutdown) => {
                shared.evict(&mut accums, true);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        if last_sweep.elapsed() >= shared.config.sweep_tick {
            shared.evict(&mut accums, false);
            shared.sweep_orphans();
            last_sweep = Instant::now();
        }
    }
}

impl MapShared {
    fn observer(&self) -> Option<Arc<dyn ReassemblyObserver>> {
        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn ingest(&self, seg: Segment, accums: &mut HashMap<u64, Accumulator>) {
        if !seg.is_multipart() {
            self.deliver(vec![seg]);
            return;
        }

        let guid = seg.guid();
        let accum = accums.entry(guid).or_insert_with(|| {
            debug!(guid, "opening accumulator");
            Accumulator::new(self.config.reassembly_timeout)
        });
        accum.submit(seg);
        if accum.is_complete() {
            if let Some(accum) = accums.remove(&guid) {
                debug!(guid, fragments = accum.received(), "message reassembled");
                self.deliver(accum.take_chain());
            }
        }
    }

    /// Hand a complete chain to its context. Control messages belong to
    /// the observer and reach a context only when correlated.
    fn deliver(&self, chain: Vec<Segment>) {
        let Some(head) = chain.first() else { return };
        let context_id = head.context();
        let control = head.msg_type() == MsgType::Control;

        if let Some(observer) = self.observer() {
            observer.message_complete(&chain);
        }
        if control && context_id == 0 {
            return;
        }

        let ctx = self.delivery_context(context_id);
        match ctx.put(chain, self.config.delivery_timeout) {
            Ok(PutOutcome::Stored) if context_id != 0 => {
                // A waiting requester holds its own reference; an orphan
                // stays parked for a late claim.
                let parked = {
                    let mut orphaned = self
                        .orphaned
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    match orphaned.get_mut(&context_id) {
                        Some(stamp) => {
                            *stamp = Instant::now();
                            true
                        }
                        None => false,
                    }
                };
                if !parked {
                    self.contexts
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&context_id);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(context = context_id, error = %err, "dropping message refused by context");
            }
        }
    }

    fn delivery_context(&self, id: u32) -> Arc<ResponseContext> {
        let (ctx, created) = {
            let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
            match contexts.get(&id) {
                Some(ctx) => (Arc::clone(ctx), false),
                None => {
                    let ctx = Arc::new(ResponseContext::new(self.pool.acquire()));
                    contexts.insert(id, Arc::clone(&ctx));
                    (ctx, true)
                }
            }
        };
        if created && id != 0 {
            debug!(context = id, "parking message for absent requester");
            self.orphaned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, Instant::now());
        }
        ctx
    }

    fn evict(&self, accums: &mut HashMap<u64, Accumulator>, all: bool) {
        let now = Instant::now();
        let observer = self.observer();
        accums.retain(|guid, accum| {
            if !all && !accum.is_expired(now) {
                return true;
            }
            warn!(
                guid,
                received = accum.received(),
                expected = accum.expected(),
                "discarding incomplete message"
            );
            if let Some(observer) = &observer {
                observer.accumulator_expired(*guid, accum.received(), accum.expected());
            }
            false
        });
    }

    fn sweep_orphans(&self) {
        let now = Instant::now();
        let expired: Vec<u32> = {
            let mut orphaned = self.orphaned.lock().unwrap_or_else(PoisonError::into_inner);
            let expired = orphaned
                .iter()
                .filter(|(_, parked)| now.duration_since(**parked) >= self.config.reassembly_timeout)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in &expired {
                orphaned.remove(id);
            }
            expired
        };
        if expired.is_empty() {
            return;
        }
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        for id in expired {
            if contexts.remove(&id).is_some() {
                debug!(context = id, "dropping unclaimed response");
            }
        }
    }
}
