//! Central relay moving segments between in-process queue endpoints.
//!
//! A [`Router`] owns a [`QueueHub`]: one bus queue it reads itself and one
//! inbound queue per registered node. Registration allocates the next free
//! address and derives the node's queue name from it deterministically.
//! The router thread pulls raw frames off the bus and forwards them to the
//! destination queue, expanding the broadcast address to every registered
//! queue. Forwarding failures are logged, never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use ipcbus_transport::{Conduit, DirectTransport, QueueConduit, QueueHub, Transport, TransportError};
use ipcbus_wire::segment::{Segment, ADDR_BROADCAST, HEADER_SIZE, MAX_SEGMENT_SIZE};

use crate::error::{NodeError, Result};
use crate::resolver::ResolveFn;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Name of the shared bus queue; per-node queues derive from it.
    pub bus_name: String,
    /// First address handed out; earlier values stay reserved.
    pub first_addr: u32,
    pub max_nodes: usize,
    pub queue_capacity: usize,
    /// Bus receive window, which doubles as the exit-check interval.
    pub tick: Duration,
    pub send_timeout: Duration,
    pub validate_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            bus_name: "bus".to_string(),
            first_addr: 1000,
            max_nodes: 1024,
            queue_capacity: 64,
            tick: Duration::from_millis(100),
            send_timeout: Duration::from_millis(250),
            validate_timeout: Duration::from_secs(1),
        }
    }
}

struct RouterTables {
    names: HashMap<String, u32>,
    queues: HashMap<u32, QueueConduit>,
    next_addr: u32,
}

struct RouterInner {
    config: RouterConfig,
    hub: Arc<QueueHub>,
    bus: QueueConduit,
    tables: Mutex<RouterTables>,
    exit: AtomicBool,
}

pub struct Router {
    inner: Arc<RouterInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Result<Self> {
        let hub = QueueHub::new();
        hub.create(&config.bus_name, config.queue_capacity)?;
        let bus = hub.open(&config.bus_name)?;

        let inner = Arc::new(RouterInner {
            tables: Mutex::new(RouterTables {
                names: HashMap::new(),
                queues: HashMap::new(),
                next_addr: config.first_addr,
            }),
            config,
            hub,
            bus,
            exit: AtomicBool::new(false),
        });

        let thread = {
            let inner = Arc::clone(&inner);
            std::thread::spawn(move || router_loop(inner))
        };

        info!(bus = %inner.config.bus_name, "router up");
        Ok(Router {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register a node name, allocate its address, and create its inbound
    /// queue. The queue is probe-validated before the node is recorded.
    pub fn node_create(&self, name: &str) -> Result<u32> {
        let mut tables = self.inner.lock_tables();
        if tables.names.contains_key(name) {
            return Err(NodeError::NameTaken {
                name: name.to_string(),
            });
        }
        if tables.names.len() >= self.inner.config.max_nodes
            || tables.next_addr == ADDR_BROADCAST
        {
            return Err(NodeError::AddressesExhausted);
        }

        let addr = tables.next_addr;
        tables.next_addr += 1;

        let queue_name = self.inner.queue_name_for(addr);
        self.inner
            .hub
            .create(&queue_name, self.inner.config.queue_capacity)?;
        let queue = match self.open_validated(&queue_name, addr) {
            Ok(queue) => queue,
            Err(err) => {
                self.inner.hub.remove(&queue_name);
                return Err(err);
            }
        };

        tables.names.insert(name.to_string(), addr);
        tables.queues.insert(addr, queue);
        info!(node = name, addr, queue = %queue_name, "node registered");
        Ok(addr)
    }

    fn open_validated(&self, queue_name: &str, addr: u32) -> Result<QueueConduit> {
        let queue = self.inner.hub.open(queue_name)?;
        DirectTransport::over(Arc::new(queue.clone()))
            .validate(addr, self.inner.config.validate_timeout)?;
        Ok(queue)
    }

    /// Register `name` and hand back its address plus a transport wired
    /// for it: sends go to the bus, receives come from the node's queue.
    pub fn attach(&self, name: &str) -> Result<(u32, DirectTransport)> {
        let addr = self.node_create(name)?;
        let send = Arc::new(self.inner.hub.open(&self.inner.config.bus_name)?);
        let recv = Arc::new(self.inner.hub.open(&self.inner.queue_name_for(addr))?);
        Ok((addr, DirectTransport::new(send, recv)))
    }

    /// Drop a node's registration and its queue. Frames already queued for
    /// it are lost; later traffic for the address is discarded.
    pub fn node_delete(&self, addr: u32) -> bool {
        let queue = {
            let mut tables = self.inner.lock_tables();
            let Some(queue) = tables.queues.remove(&addr) else {
                return false;
            };
            tables.names.retain(|_, known| *known != addr);
            queue
        };
        self.inner.hub.remove(queue.name());
        info!(addr, "node deleted");
        true
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.inner.lookup(name)
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock_tables().names.len()
    }

    /// A resolver callback backed by this router's name table, for wiring
    /// into a node's resolver.
    pub fn resolve_callback(&self) -> ResolveFn {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |name: &str| inner.lookup(name))
    }

    /// Stop the router thread and join it. Registered queues die with the
    /// hub once all conduits are gone.
    pub fn shutdown(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else { return };

        self.inner.exit.store(true, Ordering::Release);
        self.inner.bus.cancel();
        let _ = handle.join();
        info!(bus = %self.inner.config.bus_name, "router down");
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RouterInner {
    fn lock_tables(&self) -> MutexGuard<'_, RouterTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_name_for(&self, addr: u32) -> String {
        format!("{}.{:08x}", self.config.bus_name, addr)
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        self.lock_tables().names.get(name).copied()
    }

    /// Forward one raw frame to its destination queue, or to every queue
    /// for the broadcast address.
    fn forward(&self, frame: &[u8]) {
        let Some(dst) = Segment::peek_dst(frame) else {
            debug!(len = frame.len(), "discarding unaddressable frame");
            return;
        };

        if dst == ADDR_BROADCAST {
            let queues: Vec<QueueConduit> =
                self.lock_tables().queues.values().cloned().collect();
            for queue in queues {
                if let Err(err) = queue.send(frame, self.config.send_timeout) {
                    warn!(queue = queue.name(), error = %err, "broadcast forward failed");
                }
            }
            return;
        }

        let queue = self.lock_tables().queues.get(&dst).cloned();
        match queue {
            Some(queue) => {
                if let Err(err) = queue.send(frame, self.config.send_timeout) {
                    warn!(dst, error = %err, "forward failed");
                }
            }
            None => debug!(dst, "dropping frame for unknown destination"),
        }
    }
}

fn router_loop(inner: Arc<RouterInner>) {
    debug!(bus = %inner.config.bus_name, "router thread up");
    let mut buf = [0u8; MAX_SEGMENT_SIZE];
    loop {
        if inner.exit.load(Ordering::Acquire) {
            break;
        }
        match inner.bus.recv(&mut buf, inner.config.tick) {
            Ok(len) if len < HEADER_SIZE => {
                debug!(len, "discarding runt frame");
            }
            Ok(len) => inner.forward(&buf[..len]),
            Err(TransportError::Timeout) => {}
            Err(TransportError::Closed) => break,
            Err(err) => warn!(error = %err, "bus receive failed"),
        }
    }
    debug!(bus = %inner.config.bus_name, "router thread down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn quick_router() -> Router {
        Router::new(RouterConfig {
            tick: Duration::from_millis(10),
            ..RouterConfig::default()
        })
        .expect("router")
    }

    fn segment_for(src: u32, dst: u32, tag: u8) -> Segment {
        let mut seg = Segment::new();
        seg.set_src(src);
        seg.set_dst(dst);
        seg.set_msg_id(50 + tag as u32);
        seg.set_payload(Bytes::copy_from_slice(&[tag]));
        seg
    }

    #[test]
    fn addresses_are_sequential_from_first() {
        let router = quick_router();
        assert_eq!(router.node_create("x").expect("x"), 1000);
        assert_eq!(router.node_create("y").expect("y"), 1001);
        assert_eq!(router.lookup("x"), Some(1000));
        assert_eq!(router.lookup("y"), Some(1001));
        assert_eq!(router.lookup("z"), None);
        assert_eq!(router.node_count(), 2);
    }

    #[test]
    fn duplicate_name_is_refused() {
        let router = quick_router();
        router.node_create("x").expect("first");
        assert!(matches!(
            router.node_create("x"),
            Err(NodeError::NameTaken { .. })
        ));
    }

    #[test]
    fn address_space_can_exhaust() {
        let router = Router::new(RouterConfig {
            max_nodes: 2,
            tick: Duration::from_millis(10),
            ..RouterConfig::default()
        })
        .expect("router");
        router.node_create("x").expect("x");
        router.node_create("y").expect("y");
        assert!(matches!(
            router.node_create("z"),
            Err(NodeError::AddressesExhausted)
        ));
    }

    #[test]
    fn relays_point_to_point() {
        let router = quick_router();
        let (_ax, tx) = router.attach("x").expect("attach x");
        let (ay, ty) = router.attach("y").expect("attach y");

        tx.send(segment_for(1000, ay, 1), Duration::from_millis(250))
            .expect("send");

        let seg = recv_one(&ty);
        assert_eq!(seg.payload().as_ref(), &[1]);
        assert_eq!(seg.dst(), ay);
    }

    #[test]
    fn attach_transport_validates_through_relay() {
        let router = quick_router();
        let (addr, transport) = router.attach("probe").expect("attach");
        transport
            .validate(addr, Duration::from_secs(1))
            .expect("relay loopback");
    }

    #[test]
    fn broadcast_reaches_every_node() {
        let router = quick_router();
        let (ax, tx) = router.attach("x").expect("attach x");
        let (_ay, ty) = router.attach("y").expect("attach y");

        tx.send(
            segment_for(ax, ADDR_BROADCAST, 2),
            Duration::from_millis(250),
        )
        .expect("send");

        assert_eq!(recv_one(&ty).payload().as_ref(), &[2]);
        // The sender's own queue is part of the broadcast set.
        assert_eq!(recv_one(&tx).payload().as_ref(), &[2]);
    }

    #[test]
    fn deleting_a_node_mid_flight_keeps_routing() {
        let router = quick_router();
        let (ax, tx) = router.attach("x").expect("attach x");
        let (ay, ty) = router.attach("y").expect("attach y");

        assert!(router.node_delete(ay));
        assert!(!router.node_delete(ay));
        assert_eq!(router.lookup("y"), None);

        tx.send(
            segment_for(ax, ADDR_BROADCAST, 3),
            Duration::from_millis(250),
        )
        .expect("send");

        assert_eq!(recv_one(&tx).payload().as_ref(), &[3]);
        assert!(
            ty.recv(Duration::from_millis(100)).expect("empty").is_none(),
            "deleted node still receives"
        );

        // The freed name registers again under a fresh address.
        assert_eq!(router.node_create("y").expect("recreate"), ay + 1);
    }

    #[test]
    fn unknown_destination_is_dropped() {
        let router = quick_router();
        let (ax, tx) = router.attach("x").expect("attach x");

        tx.send(segment_for(ax, 9999, 4), Duration::from_millis(250))
            .expect("send");
        // Router keeps running; traffic to a live node still flows.
        tx.send(segment_for(ax, ax, 5), Duration::from_millis(250))
            .expect("send");
        assert_eq!(recv_one(&tx).payload().as_ref(), &[5]);
    }

    #[test]
    fn runt_bus_frames_are_ignored() {
        let router = quick_router();
        let (ax, tx) = router.attach("x").expect("attach x");

        let bus = router.inner.hub.open(&router.inner.config.bus_name).expect("bus");
        bus.send(b"xyz", Duration::from_millis(100)).expect("runt");

        tx.send(segment_for(ax, ax, 6), Duration::from_millis(250))
            .expect("send");
        assert_eq!(recv_one(&tx).payload().as_ref(), &[6]);
    }

    #[test]
    fn resolve_callback_serves_registered_names() {
        let router = quick_router();
        let addr = router.node_create("service").expect("create");
        let resolve = router.resolve_callback();
        assert_eq!(resolve("service"), Some(addr));
        assert_eq!(resolve("ghost"), None);
    }

    fn recv_one(transport: &DirectTransport) -> Segment {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if let Some(seg) = transport.recv(Duration::from_millis(50)).expect("recv") {
                return seg;
            }
        }
        panic!("no segment arrived");
    }
}
