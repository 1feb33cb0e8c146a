//! The protocol endpoint tying the pipeline together.
//!
//! A [`Node`] owns a transport, a transmit queue, a reassembly map, and a
//! resolver, plus two dedicated threads: the transmit thread drains the
//! queue onto the transport, the receive thread feeds inbound segments to
//! the reassembly map. Starting a node validates its transport with a
//! loopback probe first; stopping suspends both threads in place; shutdown
//! releases every blocked consumer, joins the threads, and closes the map.
//!
//! Inbound control messages are interpreted here: shutdown requests,
//! watchdog pings, address-cache flushes, and the start-sync barrier.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use ipcbus_transport::{Transport, TransportError};
use ipcbus_wire::chain::fragment_payload;
use ipcbus_wire::control::{
    control_name, CTL_FLUSH_CACHE, CTL_NOP, CTL_SHUTDOWN, CTL_START_SYNC, CTL_WATCHDOG,
};
use ipcbus_wire::segment::{MsgType, Priority, Segment, ADDR_NONE};

use crate::error::{NodeError, Result};
use crate::message::{Delivery, DeliveryHandler};
use crate::reassembly::{AccumulatorMap, MapConfig, ReassemblyObserver};
use crate::resolver::{ResolveFn, Resolver};
use crate::signal::{Signal, SignalPool};
use crate::transmit::{TransmitQueue, TxPull, DEFAULT_PENDING_LIMIT};

/// Application callback invoked on a watchdog control message.
pub type WatchdogFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    name: String,
    addr: u32,
    transmit_capacity: usize,
    reassembly: MapConfig,
    /// Pacing for the receive and transmit loops: receive window, suspended
    /// idle sleep, and exit-check interval.
    tick: Duration,
    validate_timeout: Duration,
    send_timeout: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, addr: u32) -> Self {
        NodeConfig {
            name: name.into(),
            addr,
            transmit_capacity: DEFAULT_PENDING_LIMIT,
            reassembly: MapConfig::default(),
            tick: Duration::from_millis(100),
            validate_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_transmit_capacity(mut self, capacity: usize) -> Self {
        self.transmit_capacity = capacity;
        self
    }

    pub fn with_reassembly(mut self, reassembly: MapConfig) -> Self {
        self.reassembly = reassembly;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_validate_timeout(mut self, timeout: Duration) -> Self {
        self.validate_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Validated,
    Running,
    Suspended,
    Stopped,
}

impl NodeState {
    pub fn name(self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Validated => "validated",
            NodeState::Running => "running",
            NodeState::Suspended => "suspended",
            NodeState::Stopped => "stopped",
        }
    }
}

/// Per-send tuning: priority on the wire and the correlation id carried in
/// the segment's context field.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub priority: Priority,
    pub context: u32,
}

/// Point-in-time traffic counters for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub segments_sent: u64,
    pub segments_received: u64,
    pub messages_completed: u64,
    pub messages_expired: u64,
}

#[derive(Default)]
struct StatCounters {
    segments_sent: AtomicU64,
    segments_received: AtomicU64,
    messages_completed: AtomicU64,
    messages_expired: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> NodeStats {
        NodeStats {
            segments_sent: self.segments_sent.load(Ordering::Relaxed),
            segments_received: self.segments_received.load(Ordering::Relaxed),
            messages_completed: self.messages_completed.load(Ordering::Relaxed),
            messages_expired: self.messages_expired.load(Ordering::Relaxed),
        }
    }
}

pub struct Node {
    control: Arc<NodeControl>,
    receive: Mutex<Option<JoinHandle<()>>>,
    transmit: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the node handle and its worker threads.
struct NodeControl {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    txq: TransmitQueue,
    map: AccumulatorMap,
    resolver: Resolver,
    state: Mutex<NodeState>,
    exit: AtomicBool,
    running: AtomicBool,
    watchdog: Mutex<Option<WatchdogFn>>,
    start_sync: Signal,
    stats: StatCounters,
}

impl Node {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        let pool = SignalPool::new(config.reassembly.signal_pool_size);
        let map = AccumulatorMap::new(config.reassembly.clone(), pool);
        let txq = TransmitQueue::new(config.transmit_capacity);
        let resolver = Resolver::new();
        resolver.seed(&config.name, config.addr);

        let control = Arc::new(NodeControl {
            config,
            transport,
            txq,
            map,
            resolver,
            state: Mutex::new(NodeState::Created),
            exit: AtomicBool::new(false),
            running: AtomicBool::new(false),
            watchdog: Mutex::new(None),
            start_sync: Signal::new(),
            stats: StatCounters::default(),
        });
        let observer = Arc::downgrade(&control);
        control.map.set_observer(observer);

        Node {
            control,
            receive: Mutex::new(None),
            transmit: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.control.config.name()
    }

    pub fn addr(&self) -> u32 {
        self.control.config.addr()
    }

    pub fn state(&self) -> NodeState {
        *self
            .control
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> NodeStats {
        self.control.stats.snapshot()
    }

    /// Whether a shutdown control message or local shutdown has asked this
    /// node to exit.
    pub fn exit_requested(&self) -> bool {
        self.control.exit.load(Ordering::Acquire)
    }

    /// Validate the transport and bring the worker threads up, or resume a
    /// suspended node.
    pub fn start(&self) -> Result<()> {
        let mut state = self
            .control
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            NodeState::Created => {
                self.control
                    .transport
                    .validate(self.control.config.addr, self.control.config.validate_timeout)?;
                *state = NodeState::Validated;

                let receive = {
                    let control = Arc::clone(&self.control);
                    std::thread::spawn(move || receive_loop(control))
                };
                let transmit = {
                    let control = Arc::clone(&self.control);
                    std::thread::spawn(move || transmit_loop(control))
                };
                *self.receive.lock().unwrap_or_else(PoisonError::into_inner) = Some(receive);
                *self
                    .transmit
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(transmit);

                self.control.running.store(true, Ordering::Release);
                *state = NodeState::Running;
                info!(
                    node = %self.control.config.name,
                    addr = self.control.config.addr,
                    transport = self.control.transport.kind(),
                    "node started"
                );
                Ok(())
            }
            NodeState::Suspended => {
                self.control.running.store(true, Ordering::Release);
                *state = NodeState::Running;
                debug!(node = %self.control.config.name, "node resumed");
                Ok(())
            }
            current => Err(NodeError::InvalidState {
                operation: "start",
                state: current.name(),
            }),
        }
    }

    /// Suspend both worker threads in place. Sends still queue; nothing
    /// moves until [`start`](Self::start) is called again.
    pub fn stop(&self) -> Result<()> {
        let mut state = self
            .control
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            NodeState::Running => {
                self.control.running.store(false, Ordering::Release);
                *state = NodeState::Suspended;
                debug!(node = %self.control.config.name, "node suspended");
                Ok(())
            }
            current => Err(NodeError::InvalidState {
                operation: "stop",
                state: current.name(),
            }),
        }
    }

    /// Tear the node down: request exit, release both blocked threads,
    /// join them, and close the reassembly map. Safe to call repeatedly.
    pub fn shutdown(&self) {
        {
            let mut state = self
                .control
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state == NodeState::Stopped {
                return;
            }
            *state = NodeState::Stopped;
        }

        self.control.exit.store(true, Ordering::Release);
        self.control.running.store(false, Ordering::Release);
        self.control.txq.release_consumer();
        self.control.transport.cancel();

        if let Some(handle) = self
            .receive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        if let Some(handle) = self
            .transmit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        self.control.map.shutdown();
        info!(node = %self.control.config.name, "node shut down");
    }

    /// Send a raw byte payload, fragmenting as needed. Returns the
    /// assigned message id.
    pub fn send_bytes(&self, dst: u32, payload: &[u8], options: SendOptions) -> Result<u32> {
        let chain = self.control.chain_for(dst, MsgType::Raw, payload, options)?;
        self.control.txq.transmit(chain, options.priority)
    }

    /// Serialize `value` as JSON and send it as an encoded-value message.
    pub fn send_value<T: Serialize>(
        &self,
        dst: u32,
        value: &T,
        options: SendOptions,
    ) -> Result<u32> {
        let payload = serde_json::to_vec(value)?;
        let chain = self
            .control
            .chain_for(dst, MsgType::Value, &payload, options)?;
        self.control.txq.transmit(chain, options.priority)
    }

    /// Send a control message. Control traffic rides at high priority.
    pub fn send_control(&self, dst: u32, code: u8, context: u32) -> Result<u32> {
        if dst == ADDR_NONE {
            return Err(NodeError::InvalidDestination {
                target: dst.to_string(),
            });
        }
        self.control.ensure_sendable()?;

        let mut seg = Segment::control(dst, code);
        seg.set_src(self.control.config.addr);
        seg.set_context(context);
        let priority = seg.priority();
        self.control.txq.transmit(vec![seg], priority)
    }

    /// Enqueue a caller-built segment as a single-segment message. The
    /// source address is stamped; everything else is the caller's.
    pub fn send_segment(&self, mut seg: Segment) -> Result<u32> {
        if seg.dst() == ADDR_NONE {
            return Err(NodeError::InvalidDestination {
                target: seg.dst().to_string(),
            });
        }
        self.control.ensure_sendable()?;

        seg.set_src(self.control.config.addr);
        let priority = seg.priority();
        self.control.txq.transmit(vec![seg], priority)
    }

    /// Block up to `timeout` for the reply correlated to `msg_id`.
    pub fn get_response(&self, msg_id: u32, timeout: Duration) -> Result<Delivery> {
        let chain = self
            .control
            .map
            .response(msg_id, timeout)
            .ok_or(NodeError::ResponseTimeout { msg_id, timeout })?;
        Delivery::from_chain(&chain).ok_or(NodeError::EmptyMessage)
    }

    /// Send `payload` to `dst` and wait for the correlated reply.
    pub fn request(&self, dst: u32, payload: &[u8], timeout: Duration) -> Result<Delivery> {
        let msg_id = self.send_bytes(dst, payload, SendOptions::default())?;
        self.get_response(msg_id, timeout)
    }

    /// Answer `delivery` with a raw payload, correlating the reply to the
    /// original message id.
    pub fn respond(&self, delivery: &Delivery, payload: &[u8]) -> Result<u32> {
        let options = SendOptions {
            priority: delivery.priority(),
            context: delivery.msg_id(),
        };
        self.send_bytes(delivery.src(), payload, options)
    }

    /// Register a delivery handler on a correlation context. Context 0
    /// receives all unsolicited traffic.
    pub fn register_handler(&self, context: u32, handler: DeliveryHandler, worker_count: usize) {
        self.control.map.register_handler(context, handler, worker_count);
    }

    /// Resolve a peer name through the seeded cache or the resolver
    /// callback.
    pub fn resolve(&self, name: &str) -> Result<u32> {
        self.control
            .resolver
            .lookup(name)
            .ok_or_else(|| NodeError::InvalidDestination {
                target: name.to_string(),
            })
    }

    pub fn set_resolve_callback(&self, callback: ResolveFn) {
        self.control.resolver.set_callback(callback);
    }

    /// Install the callback invoked on a watchdog control message.
    pub fn set_watchdog(&self, callback: WatchdogFn) {
        *self
            .control
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Block until a start-sync control message releases the barrier.
    pub fn wait_start_sync(&self, timeout: Duration) -> bool {
        self.control.start_sync.wait(timeout)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl NodeControl {
    fn ensure_sendable(&self) -> Result<()> {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state == NodeState::Stopped {
            return Err(NodeError::InvalidState {
                operation: "send",
                state: state.name(),
            });
        }
        Ok(())
    }

    fn chain_for(
        &self,
        dst: u32,
        msg_type: MsgType,
        payload: &[u8],
        options: SendOptions,
    ) -> Result<Vec<Segment>> {
        if dst == ADDR_NONE {
            return Err(NodeError::InvalidDestination {
                target: dst.to_string(),
            });
        }
        self.ensure_sendable()?;

        let mut template = Segment::new();
        template.set_src(self.config.addr);
        template.set_dst(dst);
        template.set_context(options.context);
        template.set_msg_type(msg_type);
        Ok(fragment_payload(&template, payload)?)
    }

    fn handle_control(&self, seg: &Segment) {
        match seg.ctl_code() {
            CTL_NOP => {}
            CTL_SHUTDOWN => {
                info!(
                    node = %self.config.name,
                    src = seg.src(),
                    "shutdown requested by peer"
                );
                self.exit.store(true, Ordering::Release);
            }
            CTL_WATCHDOG => {
                let watchdog = self
                    .watchdog
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match watchdog {
                    Some(callback) => callback(),
                    None => debug!(node = %self.config.name, "watchdog ping with no callback"),
                }
            }
            CTL_FLUSH_CACHE => {
                debug!(node = %self.config.name, "flushing address cache");
                self.resolver.clear();
                self.resolver.seed(&self.config.name, self.config.addr);
            }
            CTL_START_SYNC => self.start_sync.notify(),
            code => {
                debug!(
                    node = %self.config.name,
                    code = control_name(code),
                    "ignoring reserved control code"
                );
            }
        }
    }
}

impl ReassemblyObserver for NodeControl {
    fn message_complete(&self, chain: &[Segment]) {
        if let Some(head) = chain.first() {
            if head.msg_type() == MsgType::Control {
                self.handle_control(head);
            }
        }
        // Counted after control handling so the counter implies the
        // message's side effects are visible.
        self.stats.messages_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn accumulator_expired(&self, _guid: u64, _received: u16, _expected: u16) {
        self.stats.messages_expired.fetch_add(1, Ordering::Relaxed);
    }
}

fn receive_loop(control: Arc<NodeControl>) {
    debug!(node = %control.config.name, "receive thread up");
    loop {
        if control.exit.load(Ordering::Acquire) {
            break;
        }
        if !control.running.load(Ordering::Acquire) {
            std::thread::sleep(control.config.tick);
            continue;
        }
        match control.transport.recv(control.config.tick) {
            Ok(Some(seg)) => {
                control.stats.segments_received.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = control.map.submit(seg, control.config.send_timeout) {
                    warn!(
                        node = %control.config.name,
                        error = %err,
                        "reassembly queue refused segment"
                    );
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => {
                info!(node = %control.config.name, "receive channel closed");
                break;
            }
            Err(err) => {
                warn!(node = %control.config.name, error = %err, "receive failed");
                std::thread::sleep(control.config.tick);
            }
        }
    }
    debug!(node = %control.config.name, "receive thread down");
}

fn transmit_loop(control: Arc<NodeControl>) {
    debug!(node = %control.config.name, "transmit thread up");
    loop {
        if control.exit.load(Ordering::Acquire) {
            break;
        }
        if !control.running.load(Ordering::Acquire) {
            std::thread::sleep(control.config.tick);
            continue;
        }
        match control.txq.next_segment(control.config.tick) {
            Some(TxPull::Segment(seg)) => {
                let msg_id = seg.msg_id();
                match control.transport.send(seg, control.config.send_timeout) {
                    Ok(()) => {
                        control.stats.segments_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(
                            node = %control.config.name,
                            msg_id,
                            error = %err,
                            "send failed; segment dropped"
                        );
                    }
                }
            }
            Some(TxPull::Released) => {}
            None => {}
        }
    }
    debug!(node = %control.config.name, "transmit thread down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    use ipcbus_transport::{DirectTransport, QueueHub};
    use ipcbus_wire::control::CTL_RESET;
    use ipcbus_wire::segment::PAYLOAD_CAPACITY;

    fn quick_reassembly() -> MapConfig {
        MapConfig {
            sweep_tick: Duration::from_millis(20),
            ..MapConfig::default()
        }
    }

    fn quick_config(name: &str, addr: u32) -> NodeConfig {
        NodeConfig::new(name, addr)
            .with_tick(Duration::from_millis(10))
            .with_reassembly(quick_reassembly())
    }

    /// One node whose transport loops back to itself through a hub queue.
    fn loopback_node(name: &str, addr: u32) -> Node {
        let hub = QueueHub::new();
        hub.create("loop", 64).expect("create queue");
        let dev = Arc::new(hub.open("loop").expect("open queue"));
        let transport = DirectTransport::over(dev);
        Node::new(quick_config(name, addr), Arc::new(transport))
    }

    /// Two nodes cross-wired through hub queues; each routes its own
    /// address back to its inbox so the startup probe loops back.
    fn linked_pair() -> (Node, Node) {
        let hub = QueueHub::new();
        hub.create("inbox-a", 64).expect("create a");
        hub.create("inbox-b", 64).expect("create b");

        let ta = DirectTransport::new(
            Arc::new(hub.open("inbox-b").expect("open b")),
            Arc::new(hub.open("inbox-a").expect("open a")),
        );
        ta.set_direct_route(1, Arc::new(hub.open("inbox-a").expect("open a")));
        let tb = DirectTransport::new(
            Arc::new(hub.open("inbox-a").expect("open a")),
            Arc::new(hub.open("inbox-b").expect("open b")),
        );
        tb.set_direct_route(2, Arc::new(hub.open("inbox-b").expect("open b")));

        let a = Node::new(quick_config("alpha", 1), Arc::new(ta));
        let b = Node::new(quick_config("beta", 2), Arc::new(tb));
        (a, b)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn lifecycle_follows_state_machine() {
        let node = loopback_node("life", 9);
        assert_eq!(node.state(), NodeState::Created);

        node.start().expect("start");
        assert_eq!(node.state(), NodeState::Running);
        assert!(matches!(
            node.start(),
            Err(NodeError::InvalidState { operation: "start", .. })
        ));

        node.stop().expect("stop");
        assert_eq!(node.state(), NodeState::Suspended);
        node.start().expect("resume");
        assert_eq!(node.state(), NodeState::Running);

        node.shutdown();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(matches!(
            node.send_bytes(9, b"late", SendOptions::default()),
            Err(NodeError::InvalidState { operation: "send", .. })
        ));
        node.shutdown();
    }

    #[test]
    fn loopback_delivery_reaches_handler() {
        let node = loopback_node("echo", 7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            node.register_handler(
                0,
                Arc::new(move |delivery: &Delivery| {
                    seen.lock()
                        .unwrap()
                        .push((delivery.src(), delivery.payload().to_vec()));
                }),
                1,
            );
        }

        node.start().expect("start");
        let id = node
            .send_bytes(7, b"ping", SendOptions::default())
            .expect("send");
        assert!(id >= 1);

        assert!(wait_until(Duration::from_secs(2), || {
            !seen.lock().unwrap().is_empty()
        }));
        let (src, payload) = seen.lock().unwrap()[0].clone();
        assert_eq!(src, 7);
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn request_is_answered_across_nodes() {
        let (a, b) = linked_pair();
        a.start().expect("start a");
        b.start().expect("start b");

        // The handler hands deliveries to a responder thread so the reply
        // is sent outside the dispatch worker.
        let b = Arc::new(b);
        let (tx, rx) = crossbeam_channel::unbounded::<Delivery>();
        b.register_handler(
            0,
            Arc::new(move |delivery: &Delivery| {
                let _ = tx.send(delivery.clone());
            }),
            1,
        );
        let responder = {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                let delivery = rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("inbound request");
                let mut reply = delivery.payload().to_vec();
                reply.reverse();
                b.respond(&delivery, &reply).expect("respond");
            })
        };

        let delivery = a
            .request(2, b"abcdef", Duration::from_secs(5))
            .expect("request");
        assert_eq!(delivery.payload().as_ref(), b"fedcba");
        assert_eq!(delivery.src(), 2);
        responder.join().expect("responder join");
    }

    #[test]
    fn multipart_payload_travels_whole() {
        let (a, b) = linked_pair();
        a.start().expect("start a");
        b.start().expect("start b");

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            b.register_handler(
                0,
                Arc::new(move |delivery: &Delivery| {
                    seen.lock().unwrap().push(delivery.payload().to_vec());
                }),
                1,
            );
        }

        let payload: Vec<u8> = (0..PAYLOAD_CAPACITY * 2 + 500).map(|i| (i % 247) as u8).collect();
        a.send_bytes(2, &payload, SendOptions::default())
            .expect("send");

        assert!(wait_until(Duration::from_secs(2), || {
            !seen.lock().unwrap().is_empty()
        }));
        assert_eq!(seen.lock().unwrap()[0], payload);
    }

    #[test]
    fn typed_value_roundtrips_as_json() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Ping {
            seq: u32,
            label: String,
        }

        let node = loopback_node("typed", 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            node.register_handler(
                0,
                Arc::new(move |delivery: &Delivery| {
                    if delivery.msg_type() == MsgType::Value {
                        if let Ok(ping) = delivery.value::<Ping>() {
                            seen.lock().unwrap().push(ping);
                        }
                    }
                }),
                1,
            );
        }

        node.start().expect("start");
        node.send_value(
            4,
            &Ping {
                seq: 3,
                label: "hello".into(),
            },
            SendOptions::default(),
        )
        .expect("send");

        assert!(wait_until(Duration::from_secs(2), || {
            !seen.lock().unwrap().is_empty()
        }));
        assert_eq!(
            seen.lock().unwrap()[0],
            Ping {
                seq: 3,
                label: "hello".into()
            }
        );
    }

    #[test]
    fn shutdown_control_requests_exit() {
        let node = loopback_node("ctl", 5);
        node.start().expect("start");
        assert!(!node.exit_requested());

        node.send_control(5, CTL_SHUTDOWN, 0).expect("send");
        assert!(wait_until(Duration::from_secs(2), || node.exit_requested()));
    }

    #[test]
    fn watchdog_control_invokes_callback() {
        let node = loopback_node("dog", 6);
        let pings = Arc::new(AtomicUsize::new(0));
        {
            let pings = Arc::clone(&pings);
            node.set_watchdog(Arc::new(move || {
                pings.fetch_add(1, Ordering::SeqCst);
            }));
        }

        node.start().expect("start");
        node.send_control(6, CTL_WATCHDOG, 0).expect("send");
        assert!(wait_until(Duration::from_secs(2), || {
            pings.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn start_sync_control_releases_barrier() {
        let node = loopback_node("sync", 8);
        node.start().expect("start");

        node.send_control(8, CTL_START_SYNC, 0).expect("send");
        assert!(node.wait_start_sync(Duration::from_secs(2)));
    }

    #[test]
    fn reserved_control_is_ignored() {
        let node = loopback_node("resv", 11);
        node.start().expect("start");

        node.send_control(11, CTL_RESET, 0).expect("send");
        assert!(wait_until(Duration::from_secs(2), || {
            node.stats().messages_completed == 1
        }));
        assert!(!node.exit_requested());
    }

    #[test]
    fn flush_cache_control_reseeds_own_name() {
        let node = loopback_node("cache", 12);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            node.set_resolve_callback(Arc::new(move |name| {
                calls.fetch_add(1, Ordering::SeqCst);
                (name == "peer").then_some(77)
            }));
        }

        node.start().expect("start");
        assert_eq!(node.resolve("peer").expect("resolve"), 77);
        assert_eq!(node.resolve("peer").expect("cached"), 77);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        node.send_control(12, CTL_FLUSH_CACHE, 0).expect("send");
        assert!(wait_until(Duration::from_secs(2), || {
            node.stats().messages_completed >= 1
        }));

        assert_eq!(node.resolve("cache").expect("own name"), 12);
        assert_eq!(node.resolve("peer").expect("re-resolved"), 77);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "flush emptied the cache");
    }

    #[test]
    fn invalid_destination_is_refused() {
        let node = loopback_node("strict", 3);
        assert!(matches!(
            node.send_bytes(ADDR_NONE, b"x", SendOptions::default()),
            Err(NodeError::InvalidDestination { .. })
        ));
        assert!(matches!(
            node.send_control(ADDR_NONE, CTL_NOP, 0),
            Err(NodeError::InvalidDestination { .. })
        ));
        assert!(matches!(
            node.resolve("nobody"),
            Err(NodeError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn get_response_times_out_without_reply() {
        let node = loopback_node("alone", 13);
        node.start().expect("start");
        match node.get_response(999, Duration::from_millis(50)) {
            Err(NodeError::ResponseTimeout { msg_id, .. }) => assert_eq!(msg_id, 999),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn suspended_node_queues_until_resumed() {
        let node = loopback_node("pause", 14);
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            node.register_handler(
                0,
                Arc::new(move |_: &Delivery| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
                1,
            );
        }

        node.start().expect("start");
        node.stop().expect("stop");
        // Let both threads observe the suspension before queueing traffic.
        thread::sleep(Duration::from_millis(40));
        node.send_bytes(14, b"held", SendOptions::default())
            .expect("send while suspended");

        thread::sleep(Duration::from_millis(60));
        assert_eq!(seen.load(Ordering::SeqCst), 0, "suspended node moved traffic");

        node.start().expect("resume");
        assert!(wait_until(Duration::from_secs(2), || {
            seen.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn stats_count_loopback_traffic() {
        let node = loopback_node("count", 15);
        node.start().expect("start");
        node.send_bytes(15, b"one", SendOptions::default()).expect("send");

        assert!(wait_until(Duration::from_secs(2), || {
            node.stats().messages_completed == 1
        }));
        let stats = node.stats();
        assert_eq!(stats.segments_sent, 1);
        assert_eq!(stats.segments_received, 1);
        assert_eq!(stats.messages_expired, 0);
    }
}
