//! The server connection handler.
//!
//! This module owns everything between the listening socket and the command
//! queue: the accept loop, the per-connection read task, the per-client
//! send queue with its write task, the proxy-to-client-slot mapping table,
//! and the broadcaster that fans validation result changes out to the
//! subscribed routers.
//!
//! The mapping table is the sole authority for which socket a notification
//! goes to. Slots are single bytes; slot 0 is never assigned. A crashed
//! connection keeps its slot reserved for the keep window so the router
//! finds its subscriptions again on reconnect; a clean goodbye frees the
//! slot immediately unless it was statically configured.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};
use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use crate::command::{Command, CommandHandler};
use crate::config::Config;
use crate::error::ExitError;
use crate::metrics::ServerMetrics;
use crate::pdu::{
    ErrorCode, Header, Pdu, HEADER_LEN, NO_REQUEST_TOKEN, TYPE_HELLO,
};
use crate::queue::WorkQueue;
use crate::updates::{ResultChange, UpdateCache, UpdateListener};


/// The first client slot handed out.
pub const MIN_CLIENT_SLOT: u8 = 1;

/// The last client slot handed out.
pub const MAX_CLIENT_SLOT: u8 = 254;


//------------ PduSink -------------------------------------------------------

/// Somewhere outbound PDUs can be handed to.
///
/// The server binds a sink to the connection’s send queue; tests bind a
/// collector.
pub trait PduSink: Send + Sync {
    /// Hands a frame to the sink. Returns whether it was accepted.
    fn send_pdu(&self, frame: Bytes) -> bool;
}

/// One frame on its way to a client socket.
struct WriteJob {
    frame: Bytes,

    /// Present when the sender waits for the write to finish.
    done: Option<std_mpsc::SyncSender<bool>>,
}

/// A sink feeding the connection’s send queue.
struct SocketSink {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl PduSink for SocketSink {
    fn send_pdu(&self, frame: Bytes) -> bool {
        self.tx.send(WriteJob { frame, done: None }).is_ok()
    }
}

/// A sink that waits for every frame to reach the socket.
///
/// Used when the send queue is disabled: the sending context blocks until
/// the write task has flushed the frame, so a slow client applies
/// backpressure to whoever produces output for it, and the sender learns
/// whether the write actually succeeded.
struct DirectSink {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl PduSink for DirectSink {
    fn send_pdu(&self, frame: Bytes) -> bool {
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);
        if self.tx.send(WriteJob {
            frame, done: Some(done_tx)
        }).is_err() {
            return false
        }
        done_rx.recv().unwrap_or(false)
    }
}


//------------ ClientHandle --------------------------------------------------

/// The shared state of one proxy connection.
///
/// The read task, the command handler threads, and the broadcaster all
/// hold the handle; everything on it is atomic or behind the sink.
pub struct ClientHandle {
    peer: String,
    slot: AtomicU8,
    proxy_id: AtomicU32,
    initialized: AtomicBool,
    closed: AtomicBool,
    closer: Notify,
    sink: Arc<dyn PduSink>,
}

impl ClientHandle {
    pub fn new(peer: String, sink: Arc<dyn PduSink>) -> Self {
        ClientHandle {
            peer,
            slot: AtomicU8::new(0),
            proxy_id: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closer: Notify::new(),
            sink,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn slot(&self) -> u8 {
        self.slot.load(Ordering::Acquire)
    }

    pub fn set_slot(&self, slot: u8) {
        self.slot.store(slot, Ordering::Release)
    }

    pub fn proxy_id(&self) -> u32 {
        self.proxy_id.load(Ordering::Acquire)
    }

    pub fn set_proxy_id(&self, proxy_id: u32) {
        self.proxy_id.store(proxy_id, Ordering::Release)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release)
    }

    /// Returns the sink outbound PDUs for this client go to.
    pub fn sink(&self) -> Arc<dyn PduSink> {
        self.sink.clone()
    }

    /// Sends a PDU to the client.
    pub fn send(&self, pdu: &Pdu) -> bool {
        self.sink.send_pdu(pdu.encode())
    }

    /// Asks the connection to shut down.
    ///
    /// Callable from the synchronous command handler threads; the read
    /// task observes the request on its next wakeup.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closer.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.closer.notified();
            if self.is_closed() {
                return
            }
            notified.await;
        }
    }
}


//------------ ProxyMap ------------------------------------------------------

/// Why a registration was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapError {
    /// The proxy id is bound to an active connection.
    Duplicate,

    /// All slots are taken.
    Exhausted,
}

/// The proxy-to-client-slot mapping table.
pub struct ProxyMap {
    slots: Mutex<Vec<Slot>>,
    default_keep_window: Duration,
}

#[derive(Default)]
struct Slot {
    proxy_id: u32,
    predefined: bool,
    active: bool,
    crashed_at: Option<Instant>,
    free_at: Option<Instant>,
    update_count: u32,
    sink: Option<Arc<dyn PduSink>>,
}

impl ProxyMap {
    pub fn new(default_keep_window: Duration) -> Self {
        let mut slots = Vec::with_capacity(256);
        slots.resize_with(256, Slot::default);
        ProxyMap {
            slots: Mutex::new(slots),
            default_keep_window,
        }
    }

    /// Installs the static slot bindings from the configuration.
    ///
    /// `mapping[slot]` is the proxy id bound to `slot`; zero entries and
    /// slot 0 are skipped.
    pub fn configure(&self, mapping: &[u32]) {
        let mut slots = self.slots.lock().expect("poisoned lock");
        for (slot, proxy_id) in mapping.iter().enumerate().skip(1) {
            if slot > usize::from(MAX_CLIENT_SLOT) || *proxy_id == 0 {
                continue
            }
            slots[slot].proxy_id = *proxy_id;
            slots[slot].predefined = true;
        }
    }

    /// Binds a connection to a slot during the handshake.
    ///
    /// A nonzero proxy id rebinds its existing inactive slot if there is
    /// one; proxy id zero gets a fresh slot and has the slot number
    /// assigned as its proxy id. Returns the slot and the effective
    /// proxy id.
    pub fn register(
        &self, proxy_id: u32, sink: Arc<dyn PduSink>
    ) -> Result<(u8, u32), MapError> {
        let mut slots = self.slots.lock().expect("poisoned lock");
        Self::release_expired(&mut slots, Instant::now());

        if proxy_id != 0 {
            let known = slots.iter().position(|slot| {
                slot.proxy_id == proxy_id
            });
            if let Some(found) = known {
                if slots[found].active {
                    return Err(MapError::Duplicate)
                }
                Self::bind(&mut slots[found], proxy_id, sink);
                return Ok((found as u8, proxy_id))
            }
        }

        let free = slots.iter().enumerate()
            .skip(usize::from(MIN_CLIENT_SLOT))
            .take(usize::from(MAX_CLIENT_SLOT))
            .find(|(_, slot)| slot.proxy_id == 0 && !slot.active)
            .map(|(idx, _)| idx);
        let idx = free.ok_or(MapError::Exhausted)?;
        let effective = if proxy_id == 0 { idx as u32 } else { proxy_id };
        Self::bind(&mut slots[idx], effective, sink);
        Ok((idx as u8, effective))
    }

    fn bind(slot: &mut Slot, proxy_id: u32, sink: Arc<dyn PduSink>) {
        slot.proxy_id = proxy_id;
        slot.active = true;
        slot.crashed_at = None;
        slot.free_at = None;
        slot.sink = Some(sink);
        slot.update_count = 0;
    }

    /// Deactivates a slot after its connection went away.
    ///
    /// A crash keeps the binding for the keep window; a clean goodbye
    /// releases it right away unless the slot is statically configured.
    pub fn deactivate(
        &self, slot_id: u8, crashed: bool, keep_window: Duration
    ) {
        if slot_id == 0 {
            return
        }
        let keep = keep_window.max(self.default_keep_window);
        let mut slots = self.slots.lock().expect("poisoned lock");
        let slot = &mut slots[usize::from(slot_id)];
        slot.active = false;
        slot.sink = None;
        if crashed {
            slot.crashed_at = Some(Instant::now());
            slot.free_at = Some(Instant::now() + keep);
        }
        else {
            slot.crashed_at = None;
            slot.free_at = None;
            if !slot.predefined {
                slot.proxy_id = 0;
            }
        }
    }

    fn release_expired(slots: &mut [Slot], now: Instant) {
        for slot in slots.iter_mut() {
            if slot.active || slot.predefined {
                continue
            }
            if let Some(free_at) = slot.free_at {
                if free_at <= now {
                    slot.proxy_id = 0;
                    slot.crashed_at = None;
                    slot.free_at = None;
                }
            }
        }
    }

    /// Returns the sink of a slot if its connection is up.
    pub fn active_sink(&self, slot_id: u8) -> Option<Arc<dyn PduSink>> {
        let slots = self.slots.lock().expect("poisoned lock");
        let slot = slots.get(usize::from(slot_id))?;
        if slot.active {
            slot.sink.clone()
        }
        else {
            None
        }
    }

    pub fn is_active(&self, slot_id: u8) -> bool {
        self.slots.lock().expect("poisoned lock")
            .get(usize::from(slot_id))
            .map(|slot| slot.active)
            .unwrap_or(false)
    }

    pub fn inc_update_count(&self, slot_id: u8) {
        let mut slots = self.slots.lock().expect("poisoned lock");
        if let Some(slot) = slots.get_mut(usize::from(slot_id)) {
            slot.update_count += 1;
        }
    }

    pub fn dec_update_count(&self, slot_id: u8) {
        let mut slots = self.slots.lock().expect("poisoned lock");
        if let Some(slot) = slots.get_mut(usize::from(slot_id)) {
            slot.update_count = slot.update_count.saturating_sub(1);
        }
    }

    pub fn update_count(&self, slot_id: u8) -> u32 {
        self.slots.lock().expect("poisoned lock")
            .get(usize::from(slot_id))
            .map(|slot| slot.update_count)
            .unwrap_or(0)
    }
}


//------------ Broadcaster ---------------------------------------------------

/// Fans update result changes out to the subscribed clients.
pub struct Broadcaster {
    map: Arc<ProxyMap>,
    metrics: Arc<ServerMetrics>,
}

impl Broadcaster {
    pub fn new(map: Arc<ProxyMap>, metrics: Arc<ServerMetrics>) -> Self {
        Broadcaster { map, metrics }
    }
}

impl UpdateListener for Broadcaster {
    fn update_result_changed(&self, change: &ResultChange) {
        if change.clients.is_empty() {
            return
        }
        let frame = Pdu::VerifyNotification {
            result_type: change.changed.axes(),
            roa: change.result.roa,
            bgpsec: change.result.bgpsec,
            aspa: change.result.aspa,
            request_token: NO_REQUEST_TOKEN,
            update_id: change.update_id,
        }.encode();
        for slot in &change.clients {
            // Inactive mappings are skipped; the router resynchronizes
            // from the cached state when it reconnects.
            if let Some(sink) = self.map.active_sink(*slot) {
                if sink.send_pdu(frame.clone()) {
                    self.metrics.inc_notifications_sent();
                }
            }
        }
    }
}


//------------ Server --------------------------------------------------------

/// The pieces the connection handler works with.
pub struct Server {
    pub config: Arc<Config>,
    pub cmd_queue: Arc<WorkQueue<Command>>,
    pub proxy_map: Arc<ProxyMap>,
    pub update_cache: Arc<UpdateCache>,
    pub metrics: Arc<ServerMetrics>,

    /// Process PDUs on the read task instead of through the queue.
    ///
    /// Set when the receive queue is disabled in the configuration.
    pub direct_handler: Option<Arc<CommandHandler>>,
}

impl Server {
    /// Runs the accept loop until shutdown is signalled.
    pub async fn run(
        self: Arc<Self>, mut shutdown: watch::Receiver<bool>
    ) -> Result<(), ExitError> {
        let addr = SocketAddr::new(
            self.config.server_addr, self.config.server_port
        );
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            error!("Failed to bind to {}: {}", addr, err);
            ExitError::Runtime
        })?;
        info!("Listening for proxy connections on {}", addr);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = listener.accept() => {
                    match res {
                        Ok((stream, peer)) => {
                            let this = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                this.client_task(
                                    stream, peer, shutdown
                                ).await
                            });
                        }
                        Err(err) => {
                            warn!("Accepting a connection failed: {}", err);
                        }
                    }
                }
            }
        }
        info!("Listener shut down.");
        Ok(())
    }

    /// Serves a single proxy connection.
    async fn client_task(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("Connection from {}", peer);
        self.metrics.inc_connections();
        let (mut read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn PduSink> = if self.config.mode_no_sendqueue {
            Arc::new(DirectSink { tx })
        }
        else {
            Arc::new(SocketSink { tx })
        };
        let client = Arc::new(ClientHandle::new(peer.to_string(), sink));
        tokio::spawn(send_queue_task(write, rx));

        let mut first = true;
        let clean = loop {
            let frame = tokio::select! {
                _ = client.wait_closed() => break true,
                _ = shutdown.changed() => break true,
                res = read_frame(
                    &mut read,
                    first.then(|| self.config.handshake_timeout),
                ) => {
                    match res {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break client.is_closed(),
                        Err(FrameError::Timeout) => {
                            // Handshake timeout closes without goodbye.
                            warn!(
                                "{}: handshake timed out", client.peer()
                            );
                            break true
                        }
                        Err(FrameError::Malformed) => {
                            client.send(&Pdu::Error {
                                code: ErrorCode::InvalidPacket
                            });
                            self.metrics.inc_errors_sent();
                            break client.is_closed()
                        }
                        Err(FrameError::Io) => break client.is_closed(),
                    }
                }
            };
            self.metrics.inc_pdus_received();
            if first && frame[0] != TYPE_HELLO {
                // The first PDU must be a hello.
                warn!(
                    "{}: first PDU is type {}, not hello",
                    client.peer(), frame[0]
                );
                client.send(&Pdu::Error {
                    code: ErrorCode::InvalidPacket
                });
                self.metrics.inc_errors_sent();
                break false
            }
            first = false;
            if let Some(handler) = self.direct_handler.as_ref() {
                handler.handle_frame(&client, &frame);
            }
            else if !self.cmd_queue.push(Command::Pdu {
                client: client.clone(), frame
            }) {
                break true
            }
        };

        self.metrics.dec_current_connections();
        if !clean {
            // The peer went away without a goodbye; keep its
            // subscriptions for the keep window.
            let slot = client.slot();
            if slot != 0 {
                debug!(
                    "{}: connection lost, parking client {:#04x}",
                    client.peer(), slot
                );
                self.proxy_map.deactivate(
                    slot, true, self.config.default_keep_window
                );
                self.update_cache.unregister_client(
                    slot, self.config.default_keep_window
                );
            }
        }
        debug!("{}: connection closed", client.peer());
    }
}


//------------ Frame reading -------------------------------------------------

enum FrameError {
    Timeout,
    Malformed,
    Io,
}

/// Reads one length-framed PDU off the socket.
///
/// Returns `None` on a clean end of stream before the first header byte.
async fn read_frame(
    read: &mut (impl AsyncReadExt + Unpin),
    first_timeout: Option<Duration>,
) -> Result<Option<Bytes>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let res = match first_timeout {
        Some(limit) => {
            match timeout(limit, read.read_exact(&mut header)).await {
                Ok(res) => res,
                Err(_) => return Err(FrameError::Timeout),
            }
        }
        None => read.read_exact(&mut header).await,
    };
    if let Err(err) = res {
        return if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        }
        else {
            Err(FrameError::Io)
        }
    }
    let parsed = Header::parse(&header)
        .map_err(|_| FrameError::Malformed)?;
    let mut frame = vec![0u8; parsed.length as usize];
    frame[..HEADER_LEN].copy_from_slice(&header);
    if parsed.length as usize > HEADER_LEN {
        read.read_exact(&mut frame[HEADER_LEN..]).await
            .map_err(|_| FrameError::Io)?;
    }
    Ok(Some(frame.into()))
}

/// Drains a client’s send queue into its socket.
///
/// Jobs carrying a completion channel are acknowledged once their frame
/// has been written; with the send queue disabled every job does.
async fn send_queue_task(
    mut write: impl AsyncWriteExt + Unpin,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
) {
    while let Some(job) = rx.recv().await {
        let ok = match write.write_all(&job.frame).await {
            Ok(()) => true,
            Err(err) => {
                debug!("write failed: {}", err);
                false
            }
        };
        if let Some(done) = job.done {
            let _ = done.send(ok);
        }
        if !ok {
            break
        }
    }
    let _ = write.shutdown().await;
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{
        RouteResult, UpdateId, ValidationState, VerifyFlags,
    };

    /// A sink collecting frames for inspection.
    #[derive(Default)]
    pub struct SinkCollector {
        frames: Mutex<Vec<Bytes>>,
    }

    impl SinkCollector {
        pub fn take(&self) -> Vec<Bytes> {
            std::mem::take(
                &mut *self.frames.lock().expect("poisoned lock")
            )
        }
    }

    impl PduSink for SinkCollector {
        fn send_pdu(&self, frame: Bytes) -> bool {
            self.frames.lock().expect("poisoned lock").push(frame);
            true
        }
    }

    fn sink() -> Arc<SinkCollector> {
        Arc::new(SinkCollector::default())
    }

    #[test]
    fn slot_allocation_starts_at_one() {
        let map = ProxyMap::new(Duration::from_secs(900));
        let (slot, proxy_id) = map.register(0, sink()).expect("slot");
        assert_eq!(slot, 1);
        assert_eq!(proxy_id, 1);
        let (slot, proxy_id) = map.register(42, sink()).expect("slot");
        assert_eq!(slot, 2);
        assert_eq!(proxy_id, 42);
    }

    #[test]
    fn duplicate_active_proxy_is_refused() {
        let map = ProxyMap::new(Duration::from_secs(900));
        map.register(42, sink()).expect("slot");
        assert_eq!(map.register(42, sink()), Err(MapError::Duplicate));
    }

    #[test]
    fn crashed_slot_rebinds_to_same_proxy() {
        let map = ProxyMap::new(Duration::from_secs(900));
        let (slot, _) = map.register(42, sink()).expect("slot");
        map.deactivate(slot, true, Duration::from_secs(900));
        assert!(!map.is_active(slot));
        assert!(map.active_sink(slot).is_none());

        // Reconnect with the same proxy id gets the same slot back.
        let (again, _) = map.register(42, sink()).expect("slot");
        assert_eq!(again, slot);
        assert!(map.is_active(slot));
    }

    #[test]
    fn goodbye_frees_the_slot() {
        let map = ProxyMap::new(Duration::from_secs(900));
        let (slot, _) = map.register(42, sink()).expect("slot");
        map.deactivate(slot, false, Duration::from_secs(0));
        // The slot can now serve a different proxy.
        let (again, proxy_id) = map.register(77, sink()).expect("slot");
        assert_eq!(again, slot);
        assert_eq!(proxy_id, 77);
    }

    #[test]
    fn predefined_mapping_keeps_its_slot() {
        let map = ProxyMap::new(Duration::from_secs(900));
        let mut mapping = vec![0u32; 256];
        mapping[5] = 1042;
        map.configure(&mapping);
        let (slot, proxy_id) = map.register(1042, sink()).expect("slot");
        assert_eq!(slot, 5);
        assert_eq!(proxy_id, 1042);
        map.deactivate(slot, false, Duration::from_secs(0));
        // Still bound after a clean goodbye.
        let (slot, _) = map.register(1042, sink()).expect("slot");
        assert_eq!(slot, 5);
    }

    #[test]
    fn update_count_bookkeeping() {
        let map = ProxyMap::new(Duration::from_secs(900));
        let (slot, _) = map.register(42, sink()).expect("slot");
        map.inc_update_count(slot);
        map.inc_update_count(slot);
        map.dec_update_count(slot);
        assert_eq!(map.update_count(slot), 1);
        map.dec_update_count(slot);
        map.dec_update_count(slot);
        assert_eq!(map.update_count(slot), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn direct_sink_waits_for_the_write() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(send_queue_task(near, rx));

        let sink = DirectSink { tx };
        let ok = tokio::task::spawn_blocking(move || {
            sink.send_pdu(Pdu::SyncRequest.encode())
        }).await.expect("sender finished");
        assert!(ok);

        let mut frame = [0u8; 8];
        far.read_exact(&mut frame).await.expect("frame arrived");
        assert_eq!(frame[0], crate::pdu::TYPE_SYNC_REQUEST);
    }

    #[test]
    fn broadcaster_skips_inactive_slots() {
        let map = Arc::new(ProxyMap::new(Duration::from_secs(900)));
        let metrics = Arc::new(ServerMetrics::new());
        let broadcaster = Broadcaster::new(map.clone(), metrics.clone());

        let active = sink();
        let parked = sink();
        let (active_slot, _)
            = map.register(1, active.clone()).expect("slot");
        let (parked_slot, _)
            = map.register(2, parked.clone()).expect("slot");
        map.deactivate(parked_slot, true, Duration::from_secs(900));

        broadcaster.update_result_changed(&ResultChange {
            update_id: UpdateId(7),
            result: RouteResult {
                roa: ValidationState::Valid,
                bgpsec: ValidationState::Undefined,
                aspa: ValidationState::Undefined,
            },
            changed: VerifyFlags::from_wire(VerifyFlags::ROA),
            clients: vec![active_slot, parked_slot],
        });

        let frames = active.take();
        assert_eq!(frames.len(), 1);
        let pdu = Pdu::decode(&frames[0]).expect("decodes");
        match pdu {
            Pdu::VerifyNotification {
                roa, request_token, update_id, ..
            } => {
                assert_eq!(roa, ValidationState::Valid);
                assert_eq!(request_token, NO_REQUEST_TOKEN);
                assert_eq!(update_id, UpdateId(7));
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert!(parked.take().is_empty());
        assert_eq!(metrics.notifications_sent(), 1);
    }
}
