//! Per-correlation mailbox connecting reassembled messages to waiters.
//!
//! A [`ResponseContext`] starts synchronous: a delivered chain is stored in
//! a one-deep slot and a signal wakes whoever blocks in [`get`]. Registering
//! a handler turns the context asynchronous for the rest of its life:
//! deliveries are decoded and forwarded straight to a lazily created
//! [`Dispatcher`] and nothing is ever stored.
//!
//! [`get`]: ResponseContext::get

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use ipcbus_wire::segment::Segment;

use crate::dispatch::{Dispatcher, DispatcherConfig};
use crate::error::{NodeError, Result};
use crate::message::{Delivery, DeliveryHandler};
use crate::signal::PooledSignal;

/// How a delivery was disposed of by [`ResponseContext::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored in the slot for a synchronous getter.
    Stored,
    /// Handed to the dispatcher; never stored.
    Forwarded,
}

pub struct ResponseContext {
    slot: Mutex<Option<Vec<Segment>>>,
    signal: PooledSignal,
    dispatcher: Mutex<Option<Arc<Dispatcher<Delivery>>>>,
}

impl ResponseContext {
    pub fn new(signal: PooledSignal) -> Self {
        ResponseContext {
            slot: Mutex::new(None),
            signal,
            dispatcher: Mutex::new(None),
        }
    }

    /// Deliver a reassembled chain to this context.
    ///
    /// With a dispatcher present the chain is decoded and forwarded,
    /// waiting up to `timeout` for queue space. Otherwise it replaces
    /// whatever undelivered chain the slot still holds and signals the
    /// waiter.
    pub fn put(&self, chain: Vec<Segment>, timeout: Duration) -> Result<PutOutcome> {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(dispatcher) = dispatcher {
            let delivery = Delivery::from_chain(&chain).ok_or(NodeError::EmptyMessage)?;
            dispatcher.submit(delivery, timeout)?;
            return Ok(PutOutcome::Forwarded);
        }

        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.replace(chain).is_some() {
            debug!("replacing undelivered response");
        }
        self.signal.notify();
        Ok(PutOutcome::Stored)
    }

    /// Block up to `timeout` for a stored chain.
    pub fn get(&self, timeout: Duration) -> Option<Vec<Segment>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(chain) = self.try_take() {
                return Some(chain);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.signal.wait(deadline - now);
        }
    }

    /// Take the stored chain without waiting.
    pub fn try_take(&self) -> Option<Vec<Segment>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Switch the context to asynchronous delivery, creating the dispatcher
    /// on first registration and resizing its pool afterwards.
    pub fn register_handler(&self, handler: DeliveryHandler, worker_count: usize) {
        let mut dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match dispatcher.as_ref() {
            Some(existing) => {
                existing.set_worker_count(worker_count);
                existing.add_handler(handler);
            }
            None => {
                let created = Dispatcher::with_hooks(
                    DispatcherConfig {
                        worker_count,
                        ..DispatcherConfig::default()
                    },
                    None,
                    Some(Arc::new(|delivery: &Delivery| {
                        trace!(
                            msg_id = delivery.msg_id(),
                            context = delivery.context(),
                            "delivery dispatched"
                        );
                    })),
                );
                created.add_handler(handler);
                *dispatcher = Some(Arc::new(created));
            }
        }
    }

    /// Remove a handler registered earlier. The context stays asynchronous
    /// even when the stack empties.
    pub fn remove_handler(&self, handler: &DeliveryHandler) -> bool {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|dispatcher| dispatcher.remove_handler(handler))
    }

    pub fn has_dispatcher(&self) -> bool {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
