//! The command handler.
//!
//! Everything a proxy asks for funnels through here: the connection tasks
//! enqueue raw frames, a pool of worker threads decodes them and runs the
//! per-PDU handlers. The handlers own all protocol semantics: the
//! handshake, update verification across the three validation axes,
//! signing, deletes, and teardown. Validation results flow back to the
//! routers through the update cache’s change listener, never directly from
//! here, so every observable result transition takes the same path.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use bytes::Bytes;
use log::{debug, info, warn};
use crate::aspa::{validate_aspa, AspaStore};
use crate::aspath::AsPathCache;
use crate::bgpsec::{CryptoProvider, SignError};
use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::payload::{
    AsPathKind, DefaultResult, ResultUpdate, RouteResult, UpdateId,
    ValidationState, VerifyFlags,
};
use crate::pdu::{
    ErrorCode, Pdu, VerifyRequest, NO_REQUEST_TOKEN, PROTOCOL_VERSION,
};
use crate::prefixes::PrefixCache;
use crate::queue::{PopOutcome, WorkQueue};
use crate::server::{ClientHandle, MapError, ProxyMap};
use crate::updates::{SignatureRecord, StoreOutcome, UpdateCache};


//------------ Command -------------------------------------------------------

/// An item on the command queue.
pub enum Command {
    /// A frame received from a proxy.
    Pdu {
        client: Arc<ClientHandle>,
        frame: Bytes,
    },

    /// Stop the worker that picks this up.
    Shutdown,
}


//------------ CommandHandler ------------------------------------------------

/// The command handler and its collaborators.
pub struct CommandHandler {
    config: Arc<Config>,
    queue: Arc<WorkQueue<Command>>,
    proxy_map: Arc<ProxyMap>,
    update_cache: Arc<UpdateCache>,
    prefix_cache: Arc<PrefixCache>,
    aspath_cache: Arc<AsPathCache>,
    aspa_store: Arc<AspaStore>,
    crypto: Arc<dyn CryptoProvider>,
    metrics: Arc<ServerMetrics>,
}

impl CommandHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        queue: Arc<WorkQueue<Command>>,
        proxy_map: Arc<ProxyMap>,
        update_cache: Arc<UpdateCache>,
        prefix_cache: Arc<PrefixCache>,
        aspath_cache: Arc<AsPathCache>,
        aspa_store: Arc<AspaStore>,
        crypto: Arc<dyn CryptoProvider>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        CommandHandler {
            config, queue, proxy_map, update_cache, prefix_cache,
            aspath_cache, aspa_store, crypto, metrics,
        }
    }

    /// Spawns the worker pool draining the command queue.
    pub fn spawn_pool(
        self: &Arc<Self>, threads: usize
    ) -> Vec<JoinHandle<()>> {
        let threads = threads.max(1);
        (0..threads).map(|idx| {
            let handler = self.clone();
            thread::Builder::new()
                .name(format!("command-{}", idx))
                .spawn(move || handler.work())
                .expect("failed to spawn a command handler thread")
        }).collect()
    }

    /// Stops the pool: queues one shutdown per worker and closes.
    pub fn stop_pool(&self, workers: Vec<JoinHandle<()>>) {
        for _ in &workers {
            self.queue.push(Command::Shutdown);
        }
        self.queue.close();
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn work(self: Arc<Self>) {
        debug!("command handler thread started");
        loop {
            match self.queue.pop(Duration::from_millis(100)) {
                PopOutcome::Item(Command::Pdu { client, frame }) => {
                    self.handle_frame(&client, &frame);
                }
                PopOutcome::Item(Command::Shutdown)
                | PopOutcome::Closed => break,
                PopOutcome::TimedOut => {}
            }
        }
        debug!("command handler thread stopped");
    }

    /// Decodes and dispatches one frame from a client.
    pub fn handle_frame(&self, client: &Arc<ClientHandle>, frame: &[u8]) {
        let pdu = match Pdu::decode(frame) {
            Ok(pdu) => pdu,
            Err(err) => {
                warn!(
                    "{}: dropping malformed PDU: {}", client.peer(), err
                );
                self.refuse(client, ErrorCode::InvalidPacket);
                return
            }
        };
        match pdu {
            Pdu::Hello { version, proxy_id, asn, peers } => {
                self.process_hello(client, version, proxy_id, asn, &peers)
            }
            Pdu::VerifyRequest(request) => {
                self.process_verify(client, &request)
            }
            Pdu::SignRequest {
                algorithm, block_type, update_id, prepend_counter, peer_as
            } => {
                self.process_sign(
                    client, algorithm, block_type, update_id,
                    prepend_counter, peer_as,
                )
            }
            Pdu::DeleteUpdate { keep_window, update_id } => {
                self.process_delete(client, keep_window, update_id)
            }
            Pdu::Goodbye { keep_window } => {
                self.process_goodbye(client, keep_window)
            }
            Pdu::PeerChange { change_type, peer_as } => {
                // Accepted without effect for now.
                debug!(
                    "{}: peer change type {} for AS{} noted",
                    client.peer(), change_type, peer_as
                );
            }
            Pdu::SyncRequest => {
                debug!("{}: sync request noted", client.peer());
            }
            Pdu::HelloResponse { .. }
            | Pdu::VerifyNotification { .. }
            | Pdu::SignatureNotification { .. }
            | Pdu::Error { .. } => {
                warn!(
                    "{}: received a server-to-proxy PDU type {}",
                    client.peer(), pdu.type_code()
                );
                self.refuse(client, ErrorCode::InvalidPacket);
            }
        }
    }

    //--- Handshake.

    fn process_hello(
        &self,
        client: &Arc<ClientHandle>,
        version: u16,
        proxy_id: u32,
        asn: u32,
        peers: &[u32],
    ) {
        if version != PROTOCOL_VERSION {
            warn!(
                "{}: hello with protocol version {}, expected {}",
                client.peer(), version, PROTOCOL_VERSION
            );
            self.refuse(client, ErrorCode::WrongVersion);
            return
        }
        if client.is_initialized() {
            warn!("{}: repeated hello", client.peer());
            self.refuse(client, ErrorCode::InvalidPacket);
            return
        }
        match self.proxy_map.register(proxy_id, client.sink()) {
            Ok((slot, effective)) => {
                client.set_slot(slot);
                client.set_proxy_id(effective);
                client.send(&Pdu::HelloResponse {
                    version: PROTOCOL_VERSION,
                    proxy_id: effective,
                });
                client.set_initialized();
                info!(
                    "{}: proxy [{:#010x}] (AS{}, {} peers) registered as \
                     client {:#04x}",
                    client.peer(), effective, asn, peers.len(), slot
                );
                if self.config.sync_after_conn_established {
                    client.send(&Pdu::SyncRequest);
                }
            }
            Err(MapError::Duplicate) => {
                info!(
                    "{}: proxy id [{:#010x}] already in use",
                    client.peer(), proxy_id
                );
                self.refuse(client, ErrorCode::DuplicateProxyId);
            }
            Err(MapError::Exhausted) => {
                warn!(
                    "{}: out of client slots, refusing proxy [{:#010x}]",
                    client.peer(), proxy_id
                );
                self.refuse(client, ErrorCode::InternalError);
            }
        }
    }

    //--- Update verification.

    fn process_verify(
        &self, client: &Arc<ClientHandle>, request: &VerifyRequest
    ) {
        self.metrics.inc_verify_requests();
        if !client.is_initialized() {
            warn!(
                "{}: verify request before handshake", client.peer()
            );
            self.refuse(client, ErrorCode::InternalError);
            return
        }
        let slot = client.slot();
        let do_roa = request.flags.has(VerifyFlags::ROA);
        let do_bgpsec = request.flags.has(VerifyFlags::BGPSEC);
        let do_aspa = request.flags.has(VerifyFlags::ASPA);
        let receipt = request.flags.has(VerifyFlags::RECEIPT);
        if !do_roa && !do_bgpsec && !do_aspa && !receipt {
            warn!(
                "{}: verify request without any axis or receipt",
                client.peer()
            );
            return
        }

        // Resolve the fingerprint against colliding entries.
        let fingerprint = UpdateId::fingerprint(
            request.origin, request.prefix, &request.bgpsec
        );
        let mut update_id = fingerprint;
        while self.update_cache.collision_check(
            update_id, request.prefix, request.origin, &request.bgpsec
        ) {
            update_id = update_id.next();
        }
        if update_id != fingerprint {
            info!(
                "update id collision: {} resolved to {}",
                fingerprint, update_id
            );
        }

        let was_subscribed = self.update_cache
            .clients_of(update_id).contains(&slot);
        let default = DefaultResult {
            result: RouteResult {
                roa: request.roa_default,
                bgpsec: request.bgpsec_default,
                aspa: request.aspa_default,
            },
            roa_source: request.roa_source,
            bgpsec_source: request.bgpsec_source,
        };
        let outcome = self.update_cache.store(
            update_id, request.prefix, request.origin,
            request.bgpsec.clone(), default, slot,
        );
        if !was_subscribed {
            self.proxy_map.inc_update_count(slot);
        }
        let info = match self.update_cache.lookup(update_id) {
            Some(info) => info,
            None => {
                // Reaped between store and lookup; the proxy will retry.
                warn!("update {} vanished during verify", update_id);
                return
            }
        };

        // Answer with what is known right away if the proxy asked for a
        // receipt or already holds a result that differs from what it
        // believes. Later changes arrive via the broadcaster.
        let known = RouteResult {
            roa: pick_known(info.current.roa, request.roa_default),
            bgpsec: pick_known(
                info.current.bgpsec, request.bgpsec_default
            ),
            aspa: pick_known(info.current.aspa, request.aspa_default),
        };
        let mut mismatch = VerifyFlags::empty();
        if do_roa && known.roa != request.roa_default {
            mismatch = mismatch.with(VerifyFlags::ROA);
        }
        if do_bgpsec && known.bgpsec != request.bgpsec_default {
            mismatch = mismatch.with(VerifyFlags::BGPSEC);
        }
        if do_aspa && known.aspa != request.aspa_default {
            mismatch = mismatch.with(VerifyFlags::ASPA);
        }
        if receipt || !mismatch.is_empty() {
            let mut result_type = request.flags.axes();
            if receipt {
                result_type = result_type.with(VerifyFlags::RECEIPT);
            }
            client.send(&Pdu::VerifyNotification {
                result_type,
                roa: known.roa,
                bgpsec: known.bgpsec,
                aspa: known.aspa,
                request_token: if receipt { request.request_token }
                               else { NO_REQUEST_TOKEN },
                update_id,
            });
        }

        if let StoreOutcome::AlreadyPresent(_) = outcome {
            debug!(
                "update {} already known, defaults ignored", update_id
            );
        }

        // Kick off whatever has not been validated yet.
        if do_roa && info.current.roa == ValidationState::Undefined {
            self.prefix_cache.request_update_validation(
                update_id, request.prefix, request.origin
            );
        }
        if do_bgpsec && info.current.bgpsec == ValidationState::Undefined {
            let verdict = self.crypto.verify_signature(&info);
            self.update_cache.modify_result(
                update_id, ResultUpdate::bgpsec(verdict)
            );
        }
        if do_aspa
            && info.current.aspa == ValidationState::Undefined
            && request.aspa_default != ValidationState::Invalid
        {
            self.validate_aspa_axis(update_id, request);
        }
    }

    /// Runs the ASPA axis of a verify request.
    fn validate_aspa_axis(
        &self, update_id: UpdateId, request: &VerifyRequest
    ) {
        // A path that is only an AS_SET cannot be walked at all.
        if request.kind == AsPathKind::Set
            || request.bgpsec.as_path.is_empty()
        {
            self.update_cache.modify_result(
                update_id,
                ResultUpdate::aspa(ValidationState::Unverifiable),
            );
            return
        }
        let path_id = self.aspath_cache.intern(
            &request.bgpsec.as_path, request.kind, request.direction,
            request.bgpsec.afi, update_id,
        );
        self.update_cache.set_path_id(update_id, path_id);
        let cached = self.aspath_cache.info(path_id)
            .map(|info| info.aspa_result)
            .unwrap_or(ValidationState::Undefined);
        let result = if cached != ValidationState::Undefined {
            cached
        }
        else {
            let result = validate_aspa(
                &request.bgpsec.as_path, request.kind, request.direction,
                request.bgpsec.afi, &self.aspa_store,
            );
            self.aspath_cache.set_result(path_id, result);
            result
        };
        self.update_cache.modify_result(
            update_id, ResultUpdate::aspa(result)
        );
    }

    //--- Signing.

    fn process_sign(
        &self,
        client: &Arc<ClientHandle>,
        algorithm: u16,
        _block_type: u8,
        update_id: UpdateId,
        prepend_counter: u32,
        peer_as: u32,
    ) {
        self.metrics.inc_sign_requests();
        if !client.is_initialized() {
            self.refuse(client, ErrorCode::InternalError);
            return
        }
        let info = match self.update_cache.lookup(update_id) {
            Some(info) => info,
            None => {
                client.send(&Pdu::Error {
                    code: ErrorCode::UpdateNotFound
                });
                self.metrics.inc_errors_sent();
                client.send(&Pdu::SyncRequest);
                return
            }
        };
        if let Some(signature) = self.update_cache.signature_of(
            update_id, peer_as, prepend_counter, algorithm
        ) {
            client.send(&Pdu::SignatureNotification {
                update_id, signature
            });
            return
        }
        match self.crypto.sign(
            &info, peer_as, prepend_counter, algorithm
        ) {
            Ok(signature) => {
                self.update_cache.store_signature(
                    update_id,
                    SignatureRecord {
                        peer_as,
                        prepend_counter,
                        algorithm,
                        signature: signature.clone(),
                    },
                );
                client.send(&Pdu::SignatureNotification {
                    update_id, signature
                });
            }
            Err(SignError::UnsupportedAlgorithm) => {
                client.send(&Pdu::Error {
                    code: ErrorCode::AlgoNotSupported
                });
                self.metrics.inc_errors_sent();
            }
            Err(SignError::KeyNotFound) | Err(SignError::Failed) => {
                client.send(&Pdu::Error {
                    code: ErrorCode::InternalError
                });
                self.metrics.inc_errors_sent();
            }
        }
    }

    //--- Deletes and teardown.

    fn process_delete(
        &self,
        client: &Arc<ClientHandle>,
        keep_window: u16,
        update_id: UpdateId,
    ) {
        if !client.is_initialized() {
            self.refuse(client, ErrorCode::InternalError);
            return
        }
        let slot = client.slot();
        let keep = self.effective_keep_window(keep_window);
        if self.update_cache.unsubscribe(update_id, slot, keep) {
            self.proxy_map.dec_update_count(slot);
            debug!(
                "client {:#04x} dropped update {}", slot, update_id
            );
        }
        else {
            info!(
                "client {:#04x} deleted unknown update {}",
                slot, update_id
            );
            client.send(&Pdu::Error { code: ErrorCode::UpdateNotFound });
            self.metrics.inc_errors_sent();
            client.send(&Pdu::SyncRequest);
        }
    }

    fn process_goodbye(&self, client: &Arc<ClientHandle>, keep_window: u16) {
        let slot = client.slot();
        let keep = self.effective_keep_window(keep_window);
        info!(
            "{}: goodbye from client {:#04x}", client.peer(), slot
        );
        if slot != 0 {
            self.proxy_map.deactivate(slot, false, keep);
            self.update_cache.unregister_client(slot, keep);
        }
        client.close();
    }

    /// Refuses the client: error, goodbye, teardown.
    fn refuse(&self, client: &Arc<ClientHandle>, code: ErrorCode) {
        client.send(&Pdu::Error { code });
        self.metrics.inc_errors_sent();
        client.send(&Pdu::Goodbye {
            keep_window: self.config.default_keep_window.as_secs() as u16,
        });
        let slot = client.slot();
        if slot != 0 {
            self.proxy_map.deactivate(
                slot, false, self.config.default_keep_window
            );
            self.update_cache.unregister_client(
                slot, self.config.default_keep_window
            );
        }
        client.close();
    }

    fn effective_keep_window(&self, requested: u16) -> Duration {
        self.config.default_keep_window
            .max(Duration::from_secs(u64::from(requested)))
    }
}

/// Prefers a computed result over the caller’s default.
fn pick_known(
    current: ValidationState, default: ValidationState
) -> ValidationState {
    if current == ValidationState::Undefined {
        default
    }
    else {
        current
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::bgpsec::{NullCrypto, TestSigner, ALGO_BGPSEC_P256};
    use crate::payload::{AddressPrefix, BgpsecData, PathDirection};
    use crate::payload::ResultSource;
    use crate::server::{Broadcaster, PduSink};

    /// A sink collecting every frame sent to one client.
    #[derive(Default)]
    struct SinkCollector {
        frames: Mutex<Vec<Bytes>>,
    }

    impl SinkCollector {
        fn take(&self) -> Vec<Pdu> {
            std::mem::take(
                &mut *self.frames.lock().expect("poisoned lock")
            ).iter().map(|frame| {
                Pdu::decode(frame).expect("well-formed PDU")
            }).collect()
        }

        fn take_raw(&self) -> Vec<Bytes> {
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

    struct Rig {
        handler: CommandHandler,
        sink: Arc<SinkCollector>,
        client: Arc<ClientHandle>,
    }

    fn rig_with(crypto: Arc<dyn CryptoProvider>) -> Rig {
        let config = Arc::new(Config::default());
        let metrics = Arc::new(ServerMetrics::new());
        let proxy_map = Arc::new(
            ProxyMap::new(config.default_keep_window)
        );
        let broadcaster = Arc::new(
            Broadcaster::new(proxy_map.clone(), metrics.clone())
        );
        let update_cache = Arc::new(UpdateCache::new(broadcaster));
        let handler = CommandHandler::new(
            config,
            Arc::new(WorkQueue::new()),
            proxy_map,
            update_cache.clone(),
            Arc::new(PrefixCache::new(update_cache)),
            Arc::new(AsPathCache::new()),
            Arc::new(AspaStore::new()),
            crypto,
            metrics,
        );
        let sink = Arc::new(SinkCollector::default());
        let client = Arc::new(ClientHandle::new(
            "test-proxy".into(), sink.clone()
        ));
        let rig = Rig { handler, sink, client };
        rig.feed(&Pdu::Hello {
            version: PROTOCOL_VERSION,
            proxy_id: 0,
            asn: 64999,
            peers: vec![65001],
        });
        let answer = rig.sink.take();
        assert!(matches!(
            answer[0], Pdu::HelloResponse { proxy_id: 1, .. }
        ));
        rig
    }

    fn rig() -> Rig {
        rig_with(Arc::new(NullCrypto))
    }

    impl Rig {
        fn feed(&self, pdu: &Pdu) {
            self.handler.handle_frame(&self.client, &pdu.encode());
        }

        fn verify_request(
            &self, flags: u8, origin: u32, prefix: &str
        ) -> VerifyRequest {
            VerifyRequest {
                flags: VerifyFlags::from_wire(flags),
                roa_source: ResultSource::Router,
                bgpsec_source: ResultSource::Router,
                roa_default: ValidationState::NotFound,
                bgpsec_default: ValidationState::Undefined,
                aspa_default: ValidationState::Undefined,
                request_token: NO_REQUEST_TOKEN,
                prefix: prefix.parse::<AddressPrefix>().unwrap(),
                origin,
                kind: AsPathKind::Sequence,
                direction: PathDirection::UnknownStream,
                bgpsec: BgpsecData::default(),
            }
        }
    }

    #[test]
    fn origin_valid_end_to_end() {
        let rig = rig();
        rig.handler.prefix_cache.add_roa(
            65000, "10.0.0.0/16".parse().unwrap(), 24, 1, 1
        );
        let request = rig.verify_request(
            VerifyFlags::ROA, 65000, "10.0.1.0/24"
        );
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));

        let frames = rig.sink.take_raw();
        assert_eq!(frames.len(), 1);
        let expected = Pdu::VerifyNotification {
            result_type: VerifyFlags::from_wire(VerifyFlags::ROA),
            roa: ValidationState::Valid,
            bgpsec: ValidationState::Undefined,
            aspa: ValidationState::Undefined,
            request_token: NO_REQUEST_TOKEN,
            update_id,
        }.encode();
        assert_eq!(frames[0], expected);
    }

    #[test]
    fn origin_invalid_end_to_end() {
        let rig = rig();
        rig.handler.prefix_cache.add_roa(
            65000, "10.0.0.0/16".parse().unwrap(), 24, 1, 1
        );
        let request = rig.verify_request(
            VerifyFlags::ROA, 65001, "10.0.1.0/24"
        );
        let update_id = UpdateId::fingerprint(
            65001, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));

        let pdus = rig.sink.take();
        // The broadcast carries the invalid verdict; the direct answer is
        // suppressed because nothing differed from the defaults yet.
        assert!(pdus.iter().any(|pdu| matches!(
            pdu,
            Pdu::VerifyNotification {
                roa: ValidationState::Invalid,
                update_id: id,
                ..
            } if *id == update_id
        )));
    }

    #[test]
    fn receipt_is_answered_before_validation() {
        let rig = rig();
        let mut request = rig.verify_request(
            VerifyFlags::ROA | VerifyFlags::RECEIPT, 65000, "10.0.1.0/24"
        );
        request.request_token = 99;
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));

        let pdus = rig.sink.take();
        // First the receipt with the default result and the token, then
        // the broadcast for the transition to not-found.
        match &pdus[0] {
            Pdu::VerifyNotification {
                result_type, roa, request_token, update_id: id, ..
            } => {
                assert!(result_type.has(VerifyFlags::RECEIPT));
                assert_eq!(*roa, ValidationState::NotFound);
                assert_eq!(*request_token, 99);
                assert_eq!(*id, update_id);
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert!(pdus.len() >= 2);
    }

    #[test]
    fn collision_resolves_to_next_id() {
        let rig = rig();
        let request = rig.verify_request(
            VerifyFlags::ROA, 65000, "10.0.1.0/24"
        );
        let fingerprint = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        // Occupy the fingerprint with a different payload.
        rig.handler.update_cache.store(
            fingerprint, "192.0.2.0/24".parse().unwrap(), 64999,
            BgpsecData::default(), DefaultResult::default(), 1,
        );

        rig.feed(&Pdu::VerifyRequest(Box::new(request)));
        let pdus = rig.sink.take();
        assert!(pdus.iter().any(|pdu| matches!(
            pdu,
            Pdu::VerifyNotification { update_id, .. }
                if *update_id == fingerprint.next()
        )));
        // Both updates exist independently.
        assert!(rig.handler.update_cache.lookup(fingerprint).is_some());
        assert!(
            rig.handler.update_cache.lookup(fingerprint.next()).is_some()
        );
    }

    #[test]
    fn bgpsec_axis_without_keys_is_invalid() {
        let rig = rig();
        let mut request = rig.verify_request(
            VerifyFlags::BGPSEC, 65000, "10.0.1.0/24"
        );
        request.bgpsec.as_path = vec![65001, 65000];
        request.bgpsec.path_attr = vec![1, 2, 3];
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));
        let pdus = rig.sink.take();
        assert!(pdus.iter().any(|pdu| matches!(
            pdu,
            Pdu::VerifyNotification {
                bgpsec: ValidationState::Invalid,
                update_id: id,
                ..
            } if *id == update_id
        )));
    }

    #[test]
    fn aspa_axis_validates_and_caches() {
        let rig = rig();
        rig.handler.aspa_store.add(65000, vec![65001], 1);
        let mut request = rig.verify_request(
            VerifyFlags::ASPA, 65000, "10.0.1.0/24"
        );
        request.direction = PathDirection::UpStream;
        request.bgpsec.afi = 1;
        request.bgpsec.as_path = vec![65001, 65000];
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request.clone())));
        let pdus = rig.sink.take();
        assert!(pdus.iter().any(|pdu| matches!(
            pdu,
            Pdu::VerifyNotification {
                aspa: ValidationState::Valid,
                update_id: id,
                ..
            } if *id == update_id
        )));

        // The path entry carries the cached result now.
        let path_id = crate::payload::path_fingerprint(
            &request.bgpsec.as_path, request.kind
        );
        assert_eq!(
            rig.handler.aspath_cache.info(path_id).unwrap().aspa_result,
            ValidationState::Valid
        );
    }

    #[test]
    fn as_set_only_path_is_unverifiable() {
        let rig = rig();
        let mut request = rig.verify_request(
            VerifyFlags::ASPA, 65000, "10.0.1.0/24"
        );
        request.kind = AsPathKind::Set;
        request.bgpsec.as_path = vec![65001, 65000];
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));
        let pdus = rig.sink.take();
        assert!(pdus.iter().any(|pdu| matches!(
            pdu,
            Pdu::VerifyNotification {
                aspa: ValidationState::Unverifiable,
                update_id: id,
                ..
            } if *id == update_id
        )));
        // The validator was never consulted, so nothing was interned.
        assert!(rig.handler.aspath_cache.is_empty());
    }

    #[test]
    fn wrong_version_hello_is_refused() {
        let config = Arc::new(Config::default());
        let metrics = Arc::new(ServerMetrics::new());
        let proxy_map = Arc::new(
            ProxyMap::new(config.default_keep_window)
        );
        let broadcaster = Arc::new(
            Broadcaster::new(proxy_map.clone(), metrics.clone())
        );
        let update_cache = Arc::new(UpdateCache::new(broadcaster));
        let handler = CommandHandler::new(
            config,
            Arc::new(WorkQueue::new()),
            proxy_map,
            update_cache.clone(),
            Arc::new(PrefixCache::new(update_cache)),
            Arc::new(AsPathCache::new()),
            Arc::new(AspaStore::new()),
            Arc::new(NullCrypto),
            metrics,
        );
        let sink = Arc::new(SinkCollector::default());
        let client = Arc::new(ClientHandle::new(
            "test-proxy".into(), sink.clone()
        ));
        handler.handle_frame(&client, &Pdu::Hello {
            version: 1, proxy_id: 0, asn: 0, peers: Vec::new(),
        }.encode());

        let pdus = sink.take();
        assert!(matches!(
            pdus[0], Pdu::Error { code: ErrorCode::WrongVersion }
        ));
        assert!(matches!(pdus[1], Pdu::Goodbye { .. }));
        assert!(client.is_closed());
    }

    #[test]
    fn duplicate_proxy_id_is_refused() {
        let rig = rig();
        let sink = Arc::new(SinkCollector::default());
        let second = Arc::new(ClientHandle::new(
            "second-proxy".into(), sink.clone()
        ));
        // The first client registered with proxy id 1 (assigned).
        rig.handler.handle_frame(&second, &Pdu::Hello {
            version: PROTOCOL_VERSION,
            proxy_id: 1,
            asn: 0,
            peers: Vec::new(),
        }.encode());
        let pdus = sink.take();
        assert!(matches!(
            pdus[0], Pdu::Error { code: ErrorCode::DuplicateProxyId }
        ));
        assert!(matches!(pdus[1], Pdu::Goodbye { .. }));
    }

    #[test]
    fn delete_unknown_update_asks_for_sync() {
        let rig = rig();
        rig.feed(&Pdu::DeleteUpdate {
            keep_window: 0, update_id: UpdateId(0x42),
        });
        let pdus = rig.sink.take();
        assert!(matches!(
            pdus[0], Pdu::Error { code: ErrorCode::UpdateNotFound }
        ));
        assert!(matches!(pdus[1], Pdu::SyncRequest));
    }

    #[test]
    fn delete_detaches_the_client() {
        let rig = rig();
        let request = rig.verify_request(
            VerifyFlags::ROA, 65000, "10.0.1.0/24"
        );
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));
        rig.sink.take();
        assert_eq!(rig.handler.proxy_map.update_count(1), 1);

        rig.feed(&Pdu::DeleteUpdate { keep_window: 0, update_id });
        assert!(rig.sink.take().is_empty());
        assert_eq!(rig.handler.proxy_map.update_count(1), 0);
        assert!(
            rig.handler.update_cache.clients_of(update_id).is_empty()
        );
    }

    #[test]
    fn sign_request_round_trip() {
        let rig = rig_with(Arc::new(TestSigner::new(
            ValidationState::Valid, vec![0xde, 0xad, 0xbe, 0xef]
        )));
        let request = rig.verify_request(
            VerifyFlags::ROA, 65000, "10.0.1.0/24"
        );
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));
        rig.sink.take();

        rig.feed(&Pdu::SignRequest {
            algorithm: ALGO_BGPSEC_P256,
            block_type: 0,
            update_id,
            prepend_counter: 1,
            peer_as: 65001,
        });
        let pdus = rig.sink.take();
        assert!(matches!(
            &pdus[0],
            Pdu::SignatureNotification { update_id: id, signature }
                if *id == update_id
                    && signature == &[0xde, 0xad, 0xbe, 0xef]
        ));

        // The second request is served from the signature cache.
        rig.feed(&Pdu::SignRequest {
            algorithm: ALGO_BGPSEC_P256,
            block_type: 0,
            update_id,
            prepend_counter: 1,
            peer_as: 65001,
        });
        assert_eq!(rig.sink.take().len(), 1);
    }

    #[test]
    fn sign_request_errors() {
        let rig = rig();
        // Unknown update: not-found plus a sync request.
        rig.feed(&Pdu::SignRequest {
            algorithm: ALGO_BGPSEC_P256,
            block_type: 0,
            update_id: UpdateId(0x42),
            prepend_counter: 0,
            peer_as: 65001,
        });
        let pdus = rig.sink.take();
        assert!(matches!(
            pdus[0], Pdu::Error { code: ErrorCode::UpdateNotFound }
        ));
        assert!(matches!(pdus[1], Pdu::SyncRequest));

        // Known update, but the null provider has no key.
        let request = rig.verify_request(
            VerifyFlags::ROA, 65000, "10.0.1.0/24"
        );
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));
        rig.sink.take();
        rig.feed(&Pdu::SignRequest {
            algorithm: ALGO_BGPSEC_P256,
            block_type: 0,
            update_id,
            prepend_counter: 0,
            peer_as: 65001,
        });
        let pdus = rig.sink.take();
        assert!(matches!(
            pdus[0], Pdu::Error { code: ErrorCode::InternalError }
        ));
    }

    #[test]
    fn goodbye_parks_the_client() {
        let rig = rig();
        let request = rig.verify_request(
            VerifyFlags::ROA, 65000, "10.0.1.0/24"
        );
        let update_id = UpdateId::fingerprint(
            65000, request.prefix, &request.bgpsec
        );
        rig.feed(&Pdu::VerifyRequest(Box::new(request)));
        rig.sink.take();

        rig.feed(&Pdu::Goodbye { keep_window: 10 });
        assert!(rig.client.is_closed());
        assert!(!rig.handler.proxy_map.is_active(1));
        // The update survives as a zombie within the keep window.
        assert!(rig.handler.update_cache.lookup(update_id).is_some());
        assert_eq!(rig.handler.update_cache.purge_expired(), 0);
    }

    #[test]
    fn malformed_frame_is_refused() {
        let rig = rig();
        rig.handler.handle_frame(
            &rig.client, &[99, 0, 0, 0, 0, 0, 0, 8]
        );
        let pdus = rig.sink.take();
        assert!(matches!(
            pdus[0], Pdu::Error { code: ErrorCode::InvalidPacket }
        ));
        assert!(matches!(pdus[1], Pdu::Goodbye { .. }));
        assert!(rig.client.is_closed());
    }
}
