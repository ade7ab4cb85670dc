use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use picolink_core::{
    Error, LinkAddr, LinkMsg, MsgKind, NodeType, Peer, PubData, Result, RetainedPeer, SubCb,
    SubData, SubReq, WildcardTrie, RETAINED_ADDR_CAPACITY, RSSI_UNKNOWN,
};

use crate::config::ClientConfig;
use crate::link::{LinkLayer, RecvCb};
use crate::node::Node;
use crate::time::steady_now_ms;
use crate::timer::Timer;

/// Serialized size of [`ClientRetainedState`].
pub const RETAINED_STATE_LEN: usize = RETAINED_ADDR_CAPACITY + 7;

/// Client retained data.
///
/// Used on IoT devices to retain the gateway binding during deep sleep and
/// restore it after wake-up, skipping the full discovery scan. Free of
/// heap allocation so it fits RTC-like storage; see [`RetainedPeer`] for
/// the address capacity limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRetainedState {
    pub gw: RetainedPeer,
    pub msgs_fail_cnt: u16,
    pub time_sync_no_resp_cnt: u16,
}

impl ClientRetainedState {
    /// Serializes into the fixed binary layout
    /// (`addr[32] ++ addr_len ++ channel ++ msgs_fail_cnt ++
    /// time_sync_no_resp_cnt`, integers little-endian).
    pub fn to_bytes(&self) -> [u8; RETAINED_STATE_LEN] {
        let mut buf = [0u8; RETAINED_STATE_LEN];
        buf[..self.gw.addr.len()].copy_from_slice(&self.gw.addr);
        buf[32] = self.gw.addr.len() as u8;
        buf[33..35].copy_from_slice(&self.gw.channel.to_le_bytes());
        buf[35..37].copy_from_slice(&self.msgs_fail_cnt.to_le_bytes());
        buf[37..39].copy_from_slice(&self.time_sync_no_resp_cnt.to_le_bytes());
        buf
    }

    /// Parses the fixed binary layout produced by [`to_bytes`].
    ///
    /// # Errors
    ///
    /// `InvalidSize` on a wrong input length, `InvalidArg` on an address
    /// length beyond capacity.
    ///
    /// [`to_bytes`]: ClientRetainedState::to_bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RETAINED_STATE_LEN {
            return Err(Error::InvalidSize);
        }
        let addr_len = usize::from(bytes[32]);
        if addr_len > RETAINED_ADDR_CAPACITY {
            return Err(Error::InvalidArg);
        }

        let mut addr = heapless::Vec::new();
        let _ = addr.extend_from_slice(&bytes[..addr_len]);

        Ok(ClientRetainedState {
            gw: RetainedPeer {
                addr,
                channel: u16::from_le_bytes([bytes[33], bytes[34]]),
            },
            msgs_fail_cnt: u16::from_le_bytes([bytes[35], bytes[36]]),
            time_sync_no_resp_cnt: u16::from_le_bytes([bytes[37], bytes[38]]),
        })
    }
}

/// Sent message pending for its response(s).
struct PendingRequest {
    /// Request kind, for validating the response type pairing.
    kind: MsgKind,

    /// Request destination, for validating the response sender.
    addr: LinkAddr,

    broadcast: bool,

    responses: Vec<LinkMsg>,

    /// One-shot completion for unicast requests, consumed by the first
    /// matching response. Broadcast senders wake on their own timer
    /// instead.
    completion: Option<oneshot::Sender<()>>,
}

/// State behind the client lock.
struct State {
    /// The gateway slot. An empty peer means "no gateway".
    gw: Peer,

    sub_db: WildcardTrie<SubCb>,

    /// Recently failed or unresponded unicasts, for rediscovery.
    msgs_fail_cnt: u16,

    /// Recently failed time sync attempts.
    time_sync_no_resp_cnt: u16,

    /// Skip timestamp validation of responses.
    ///
    /// Enabled temporarily during gateway discovery and initial time
    /// synchronization, where the gateway clock is not known yet.
    ignore_invalid_ts: bool,
}

struct ClientInner<L: LinkLayer> {
    conf: ClientConfig,
    link: L,
    node: Node,
    state: Mutex<State>,

    /// Messages pending for responses, keyed by message ID.
    pending: DashMap<u16, PendingRequest>,

    /// Serializes gateway discovery and time sync (prevents channel
    /// switching races). Acquired before the state lock, never after.
    dscv_sync: tokio::sync::Mutex<()>,

    gw_watchdog: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,

    _sub_db_timer: Timer,
    time_sync_timer: Option<Timer>,
}

impl<L: LinkLayer> Drop for ClientInner<L> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.gw_watchdog.notify_one();
        if let Some(task) = self.watchdog_task.lock().unwrap().take() {
            task.abort();
        }
        self.link.set_recv_cb(None);
    }
}

/// Thresholds 0 and 1 are equivalent: no loss is permitted.
fn counter_trips(count: u16, threshold: u16) -> bool {
    count >= threshold.max(1)
}

/// Client node.
///
/// Locates a gateway through the probe/response discovery handshake,
/// keeps loose time synchronization with it, maintains the local
/// subscription database and carries publications, subscriptions and
/// unsubscriptions to the gateway in coalesced bulk messages. Received
/// subscription data is demultiplexed by topic (with wildcards) and
/// dispatched to the registered callbacks.
///
/// All public methods are safe to call from multiple tasks.
pub struct Client<L: LinkLayer> {
    inner: Arc<ClientInner<L>>,
}

impl<L: LinkLayer> Client<L> {
    /// Constructs a new client node and binds it to a gateway.
    ///
    /// When `retained` carries a non-empty gateway address, the retained
    /// channel is restored and only a time synchronization with that
    /// gateway is attempted; full discovery runs if that fails. Without
    /// retained data, discovery runs with up to
    /// `gw_dscv.initial_dscv_fail_thres` attempts.
    ///
    /// # Errors
    ///
    /// `InvalidArg` on an invalid configuration,
    /// `TooManyFailedAttempts` when the initial discovery exhausts its
    /// attempts.
    pub async fn new(
        conf: ClientConfig,
        link: L,
        retained: Option<ClientRetainedState>,
    ) -> Result<Self> {
        if conf.sub_db.sub_lifetime.is_zero() {
            return Err(Error::InvalidArg);
        }

        let node = Node::new(conf.node.clone())?;
        let tokens = &conf.node.topic_tokens;
        let sub_db = WildcardTrie::new(
            &tokens.level_separator,
            &tokens.single_level_wildcard,
            &tokens.multi_level_wildcard,
        )?;

        let (shutdown, _) = watch::channel(false);
        let sub_lifetime = conf.sub_db.sub_lifetime;
        let reprobe_interval = conf.time_sync.reprobe_gateway_interval;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner<L>>| {
            let renew_weak = weak.clone();
            let sync_weak = weak.clone();

            ClientInner {
                conf,
                link,
                node,
                state: Mutex::new(State {
                    gw: Peer::default(),
                    sub_db,
                    msgs_fail_cnt: 0,
                    time_sync_no_resp_cnt: 0,
                    ignore_invalid_ts: false,
                }),
                pending: DashMap::new(),
                dscv_sync: tokio::sync::Mutex::new(()),
                gw_watchdog: Arc::new(Notify::new()),
                shutdown,
                watchdog_task: Mutex::new(None),
                _sub_db_timer: Timer::new(sub_lifetime, move || {
                    let weak = renew_weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.sub_db_tick().await;
                        }
                    }
                }),
                time_sync_timer: (!reprobe_interval.is_zero()).then(|| {
                    Timer::new(reprobe_interval, move || {
                        let weak = sync_weak.clone();
                        async move {
                            if let Some(inner) = weak.upgrade() {
                                let _ = inner.sync_time().await;
                            }
                        }
                    })
                }),
            }
        });

        // Receive hook: hand inbound messages over to the dispatcher task
        let (recv_tx, mut recv_rx) = mpsc::unbounded_channel::<LinkMsg>();
        let recv_cb: RecvCb = Arc::new(move |msg| {
            let _ = recv_tx.send(msg);
        });
        inner.link.set_recv_cb(Some(recv_cb));

        let dispatch_weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(msg) = recv_rx.recv().await {
                let Some(inner) = dispatch_weak.upgrade() else {
                    break;
                };
                if let Err(err) = inner.recv_link(msg).await {
                    trace!("Inbound message dropped: {err}");
                }
            }
        });

        inner.state.lock().unwrap().ignore_invalid_ts = true;

        let mut initialized = false;
        if let Some(retained) = retained {
            if !retained.gw.addr.is_empty() {
                {
                    let mut state = inner.state.lock().unwrap();
                    state.gw = retained.gw.unretain();
                    state.msgs_fail_cnt = retained.msgs_fail_cnt;
                    state.time_sync_no_resp_cnt = retained.time_sync_no_resp_cnt;
                }
                debug!("Using retained data");

                let mut channel_ok = true;
                if retained.gw.channel > 0 {
                    debug!("Setting link channel to {}", retained.gw.channel);
                    if inner.link.set_channel(retained.gw.channel).await.is_err() {
                        warn!("Failed to set channel");
                        channel_ok = false;
                    }
                }

                if channel_ok && inner.sync_time().await.is_ok() {
                    info!(
                        "Time sync successful, GW: {}",
                        inner.state.lock().unwrap().gw
                    );
                    initialized = true;
                } else {
                    warn!("Time sync failed, doing gateway discovery");
                }
            }
        }

        if !initialized {
            let max_attempts = usize::from(inner.conf.gw_dscv.initial_dscv_fail_thres);
            inner.discover_gateway(max_attempts).await?;
            info!(
                "Gateway discovery successful, new GW: {}",
                inner.state.lock().unwrap().gw
            );
        }

        inner.state.lock().unwrap().ignore_invalid_ts = false;

        // Spawn the gateway watchdog
        let watchdog_weak = Arc::downgrade(&inner);
        let watchdog_notify = inner.gw_watchdog.clone();
        let mut watchdog_shutdown = inner.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watchdog_notify.notified() => {}
                    _ = watchdog_shutdown.changed() => {
                        debug!("Gateway watchdog cancelled by shutdown");
                        return;
                    }
                }
                if *watchdog_shutdown.borrow() {
                    debug!("Gateway watchdog cancelled by shutdown");
                    return;
                }
                let Some(inner) = watchdog_weak.upgrade() else {
                    return;
                };
                if !inner.rediscovery_due() {
                    continue;
                }
                let _ = inner.discover_gateway(0).await;
            }
        });
        *inner.watchdog_task.lock().unwrap() = Some(task);

        info!("Initialized (picolink {})", env!("CARGO_PKG_VERSION"));
        Ok(Client { inner })
    }

    /// Shuts the client down.
    ///
    /// Signals all background tasks, joins the watchdog, clears the
    /// transport receive hook and wakes every in-flight send (those
    /// observe `Timeout`). Dropping the client without calling this still
    /// stops all tasks, just without waiting for them.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let _ = inner.shutdown.send(true);
        inner.gw_watchdog.notify_one();

        debug!("Waiting for gateway watchdog task...");
        let task = inner.watchdog_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        inner.link.set_recv_cb(None);
        inner.pending.clear();

        // Wait for in-flight discovery/sync and state access
        let _dscv_sync = inner.dscv_sync.lock().await;
        drop(inner.state.lock().unwrap());

        info!("Deinitialized");
    }

    /// Publishes `payload` to `topic`.
    pub async fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_bulk(vec![PubData::new(topic, payload)]).await
    }

    /// Publishes data in bulk.
    pub async fn publish_bulk(&self, pubs: Vec<PubData>) -> Result<()> {
        self.inner
            .pub_sub_unsub_bulk(pubs, Vec::new(), Vec::new())
            .await
    }

    /// Subscribes to `topic` (which may contain wildcards); matching
    /// deliveries invoke `cb`.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        cb: impl Fn(&SubData) + Send + Sync + 'static,
    ) -> Result<()> {
        self.subscribe_bulk(vec![SubReq::new(topic, cb)]).await
    }

    /// Subscribes to topics in bulk.
    pub async fn subscribe_bulk(&self, subs: Vec<SubReq>) -> Result<()> {
        self.inner
            .pub_sub_unsub_bulk(Vec::new(), subs, Vec::new())
            .await
    }

    /// Unsubscribes from `topic`.
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<()> {
        self.unsubscribe_bulk(vec![topic.into()]).await
    }

    /// Unsubscribes from topics in bulk.
    pub async fn unsubscribe_bulk(&self, unsubs: Vec<String>) -> Result<()> {
        self.inner
            .pub_sub_unsub_bulk(Vec::new(), Vec::new(), unsubs)
            .await
    }

    /// Publishes data, subscribes to and unsubscribes from topics in one
    /// coalesced request.
    ///
    /// The local subscription database is only modified after the gateway
    /// acknowledged the request.
    ///
    /// # Errors
    ///
    /// `InvalidSize` when the supplied data is too big for the transport,
    /// `NoGateway` without a bound gateway, `Timeout` without a response,
    /// `MsgProcessingFailed` when the gateway rejected the request.
    pub async fn pub_sub_unsub_bulk(
        &self,
        pubs: Vec<PubData>,
        subs: Vec<SubReq>,
        unsubs: Vec<String>,
    ) -> Result<()> {
        self.inner.pub_sub_unsub_bulk(pubs, subs, unsubs).await
    }

    /// Unsubscribes from all topics and clears the subscription database.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.inner.unsubscribe_all().await
    }

    /// Resubscribes to all topics. The database is left unchanged.
    pub async fn resubscribe_all(&self) -> Result<()> {
        self.inner.resubscribe_all().await
    }

    /// Tries to discover a gateway and binds to the best one found.
    ///
    /// Selection is based on the preference value assigned by the link
    /// layer protocol. `max_attempts` of 0 means try indefinitely.
    ///
    /// # Errors
    ///
    /// `TooManyFailedAttempts` when no gateway was found within
    /// `max_attempts`.
    pub async fn discover_gateway(&self, max_attempts: usize) -> Result<()> {
        self.inner.discover_gateway(max_attempts).await
    }

    /// Synchronizes time with the current gateway.
    ///
    /// Also reschedules the background time sync to now +
    /// `time_sync.reprobe_gateway_interval`, postponing the upcoming
    /// execution when called out of schedule.
    ///
    /// # Errors
    ///
    /// `NoGateway` without a bound gateway, `Timeout` without a probe
    /// response, `MsgProcessingFailed` on a gateway-side failure.
    pub async fn sync_time(&self) -> Result<()> {
        self.inner.sync_time().await
    }

    /// Dumps the current gateway binding in a form suitable for RTC-like
    /// retention; pass it to [`Client::new`] after a deep-sleep cycle to
    /// skip the discovery scan.
    pub fn retain(&self) -> ClientRetainedState {
        let state = self.inner.state.lock().unwrap();
        ClientRetainedState {
            gw: state.gw.retain(),
            msgs_fail_cnt: state.msgs_fail_cnt,
            time_sync_no_resp_cnt: state.time_sync_no_resp_cnt,
        }
    }

    /// Currently bound gateway, if any.
    pub fn gateway(&self) -> Option<Peer> {
        let state = self.inner.state.lock().unwrap();
        (!state.gw.is_empty()).then(|| state.gw.clone())
    }

    /// Feeds one inbound message through the receive dispatcher.
    ///
    /// Transports normally deliver through the hook installed with
    /// [`LinkLayer::set_recv_cb`]; this entry point exists for transports
    /// that want the per-message outcome, and for tests.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for an invalid message or node type, `NotFound` when
    /// no corresponding request exists, `MsgDupId`/`MsgInvalidTs`/
    /// `MsgUnknownSender` when replay protection rejected the message.
    pub async fn recv_link(&self, msg: LinkMsg) -> Result<()> {
        self.inner.recv_link(msg).await
    }
}

impl<L: LinkLayer> ClientInner<L> {
    async fn pub_sub_unsub_bulk(
        &self,
        pubs: Vec<PubData>,
        subs: Vec<SubReq>,
        unsubs: Vec<String>,
    ) -> Result<()> {
        if pubs.is_empty() && subs.is_empty() && unsubs.is_empty() {
            return Ok(());
        }

        let mut msg = LinkMsg {
            kind: MsgKind::PubSubUnsub,
            pubs,
            subs: subs.iter().map(|sub| sub.topic.clone()).collect(),
            unsubs: unsubs.clone(),
            ..LinkMsg::default()
        };

        let resp = self.send_link(&mut msg).await?;
        if resp.kind != MsgKind::Ok {
            warn!("Received non-OK response");
            return Err(Error::MsgProcessingFailed);
        }

        // The gateway committed the request; apply the local mutations
        let mut state = self.state.lock().unwrap();
        for topic in &unsubs {
            if !state.sub_db.remove(topic) {
                debug!("Can't unsubscribe from not-subscribed topic '{topic}'");
            }
        }
        for sub in subs {
            state.sub_db.insert(&sub.topic, sub.cb);
        }

        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        let mut msg = LinkMsg {
            kind: MsgKind::PubSubUnsub,
            ..LinkMsg::default()
        };
        {
            let state = self.state.lock().unwrap();
            state
                .sub_db
                .for_each(|topic, _| msg.unsubs.push(topic.to_string()));
        }

        if msg.unsubs.is_empty() {
            return Ok(());
        }

        let resp = self.send_link(&mut msg).await?;
        if resp.kind != MsgKind::Ok {
            warn!("Received non-OK response");
            return Err(Error::MsgProcessingFailed);
        }

        self.state.lock().unwrap().sub_db.clear();
        Ok(())
    }

    async fn resubscribe_all(&self) -> Result<()> {
        let mut msg = LinkMsg {
            kind: MsgKind::PubSubUnsub,
            ..LinkMsg::default()
        };
        {
            let state = self.state.lock().unwrap();
            state
                .sub_db
                .for_each(|topic, _| msg.subs.push(topic.to_string()));
        }

        if msg.subs.is_empty() {
            return Ok(());
        }

        let resp = self.send_link(&mut msg).await?;
        if resp.kind != MsgKind::Ok {
            warn!("Received non-OK response");
            return Err(Error::MsgProcessingFailed);
        }

        Ok(())
    }

    async fn discover_gateway(&self, max_attempts: usize) -> Result<()> {
        let mut attempts = 0usize;
        let mut delay = self.conf.gw_dscv.dscv_min_delay;
        let mut shutdown = self.shutdown.subscribe();

        debug!("Discovery started, max attempts {max_attempts}");

        while max_attempts == 0 || attempts < max_attempts {
            debug!("Attempt {} started", attempts + 1);

            let mut best_gw = Peer::default();
            let mut rssi_reports: HashMap<LinkAddr, i16> = HashMap::new();

            {
                let _dscv_sync = self.dscv_sync.lock().await;

                self.state.lock().unwrap().ignore_invalid_ts = true;

                let channels = self.link.channels();
                if channels.is_empty() {
                    // No channels on the link layer, don't switch any
                    debug!("Probing default channel");
                    self.probe_channel(0, &mut best_gw, &mut rssi_reports).await;
                } else {
                    for channel in channels.iter().copied() {
                        if self.link.set_channel(channel).await.is_err() {
                            warn!("Can't set channel {channel}, skipping it");
                            continue;
                        }
                        debug!("Probing channel {channel}");
                        self.probe_channel(channel, &mut best_gw, &mut rssi_reports)
                            .await;
                    }
                }

                self.state.lock().unwrap().ignore_invalid_ts = false;

                if !best_gw.is_empty() {
                    if !channels.is_empty() {
                        let _ = self.link.set_channel(best_gw.channel).await;
                    }
                    {
                        let mut state = self.state.lock().unwrap();
                        state.gw = best_gw;
                        state.msgs_fail_cnt = 0;
                        state.time_sync_no_resp_cnt = 0;
                        info!("Using new gateway: {}", state.gw);
                    }
                    debug!("Attempt {} successful", attempts + 1);

                    if self.conf.reporting.rssi_on_gw_dscv {
                        self.report_discovery_rssi(&rssi_reports).await;
                    }
                    return Ok(());
                }

                self.state.lock().unwrap().gw = Peer::default();
            }

            debug!("Attempt {} failed", attempts + 1);

            if *shutdown.borrow() {
                debug!("Cancelled by shutdown");
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    debug!("Cancelled by shutdown");
                    return Ok(());
                }
            }

            delay = (delay * 2).min(self.conf.gw_dscv.dscv_max_delay);
            attempts += 1;
        }

        warn!("Gateway discovery failed after {attempts} attempts");
        Err(Error::TooManyFailedAttempts)
    }

    /// Probes for gateways on a single channel and folds the responses
    /// into the running best-preference selection.
    async fn probe_channel(
        &self,
        channel: u16,
        best_gw: &mut Peer,
        rssi_reports: &mut HashMap<LinkAddr, i16>,
    ) {
        let mut msg = LinkMsg {
            kind: MsgKind::ProbeReq,
            ..LinkMsg::default()
        };

        let responses = match self.send_link_unchecked_broadcast(&mut msg).await {
            Ok(responses) => responses,
            Err(err) => {
                warn!("Probe on channel {channel} failed: {err}");
                return;
            }
        };

        for resp in responses {
            if resp.kind != MsgKind::ProbeRes {
                continue;
            }

            if resp.rssi != RSSI_UNKNOWN {
                rssi_reports.insert(resp.addr.clone(), resp.rssi);
            }

            // Strict comparison: the first response wins ties
            if resp.pref > best_gw.pref {
                best_gw.addr = resp.addr;
                best_gw.channel = channel;
                best_gw.pref = resp.pref;
                best_gw.rssi = resp.rssi;
                best_gw.ts_diff_ms = resp.ts_diff_ms;
            }
        }
    }

    /// Best-effort RSSI report towards all gateways that answered the
    /// discovery probes. Uses the unchecked send so a failure can't touch
    /// the failure counters of the just-established binding.
    async fn report_discovery_rssi(&self, rssi_reports: &HashMap<LinkAddr, i16>) {
        if rssi_reports.is_empty() {
            return;
        }

        let mut msg = LinkMsg {
            kind: MsgKind::PubSubUnsub,
            ..LinkMsg::default()
        };
        for (addr, rssi) in rssi_reports {
            let peer = Peer {
                addr: addr.clone(),
                ..Peer::default()
            };
            msg.pubs.push(PubData::new(
                self.node.build_report_rssi_topic(&peer),
                rssi.to_string(),
            ));
        }

        if let Err(err) = self.send_link_unchecked(&mut msg).await {
            warn!("RSSI report failed: {err}");
        }
    }

    async fn sync_time(&self) -> Result<()> {
        let _dscv_sync = self.dscv_sync.lock().await;

        debug!("Time sync started");

        if let Some(timer) = &self.time_sync_timer {
            timer.set_next_exec(Instant::now() + self.conf.time_sync.reprobe_gateway_interval);
        }

        let mut msg = LinkMsg {
            kind: MsgKind::ProbeReq,
            ..LinkMsg::default()
        };

        let resp = match self.send_link(&mut msg).await {
            Ok(resp) if resp.kind == MsgKind::ProbeRes => resp,
            Ok(_) => {
                warn!("Received invalid response");
                self.time_sync_failed();
                return Err(Error::MsgProcessingFailed);
            }
            Err(err) => {
                warn!("Send failed");
                self.time_sync_failed();
                return Err(err);
            }
        };

        if let Some(hook) = &self.conf.time_sync.system_time_hook {
            let now_ms = steady_now_ms() + resp.ts_diff_ms;
            match hook(StdDuration::from_millis(now_ms.max(0) as u64)) {
                Ok(()) => info!("Set current timestamp: {now_ms} ms"),
                Err(err) => error!("Set system time failed: {err}"),
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.gw.ts_diff_ms = resp.ts_diff_ms;
            state.time_sync_no_resp_cnt = 0;
            debug!("Time sync successful (ts_diff={} ms)", state.gw.ts_diff_ms);
        }

        Ok(())
    }

    fn time_sync_failed(&self) {
        let trigger = {
            let mut state = self.state.lock().unwrap();
            state.time_sync_no_resp_cnt = state.time_sync_no_resp_cnt.saturating_add(1);
            counter_trips(
                state.time_sync_no_resp_cnt,
                self.conf.gw_dscv.trig_time_sync_no_resp_cnt,
            )
        };

        if trigger {
            warn!("Too many failed time syncs, triggering background gateway discovery");
            self.gw_watchdog.notify_one();
        }
    }

    fn rediscovery_due(&self) -> bool {
        let state = self.state.lock().unwrap();
        counter_trips(state.msgs_fail_cnt, self.conf.gw_dscv.trig_msgs_fail_cnt)
            || counter_trips(
                state.time_sync_no_resp_cnt,
                self.conf.gw_dscv.trig_time_sync_no_resp_cnt,
            )
    }

    /// Sends a unicast message and waits for the response, with FAIL
    /// handling and failure accounting on top of the unchecked send.
    async fn send_link(&self, msg: &mut LinkMsg) -> Result<LinkMsg> {
        let outcome = match self.send_link_unchecked(msg).await {
            Ok(resp) if resp.kind == MsgKind::Fail => {
                warn!(
                    "Message delivery failed with code {}",
                    resp.fail_reason
                );
                Err(Error::MsgProcessingFailed)
            }
            other => other,
        };

        match &outcome {
            Ok(_) => {
                self.state.lock().unwrap().msgs_fail_cnt = 0;
            }
            Err(_) => {
                let trigger = {
                    let mut state = self.state.lock().unwrap();
                    state.msgs_fail_cnt = state.msgs_fail_cnt.saturating_add(1);
                    counter_trips(state.msgs_fail_cnt, self.conf.gw_dscv.trig_msgs_fail_cnt)
                };
                if trigger {
                    warn!("Too many failed messages, triggering background gateway discovery");
                    self.gw_watchdog.notify_one();
                }
            }
        }

        outcome
    }

    /// Fills the common transmission fields: destination, fresh message
    /// ID, timestamp in gateway time, node type.
    fn prepare_msg(&self, msg: &mut LinkMsg, broadcast: bool) {
        let state = self.state.lock().unwrap();
        msg.addr = if broadcast {
            LinkAddr::default()
        } else {
            state.gw.addr.clone()
        };
        msg.id = self.node.next_msg_id();
        msg.ts = self.node.msg_timestamp(state.gw.ts_diff_ms);
        msg.node_type = NodeType::Client;
    }

    /// Unicast send without FAIL handling or failure accounting: prepare,
    /// transmit, wait for the single response.
    async fn send_link_unchecked(&self, msg: &mut LinkMsg) -> Result<LinkMsg> {
        self.prepare_msg(msg, false);
        if msg.addr.is_empty() {
            return Err(Error::NoGateway);
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        self.pending.insert(
            msg.id,
            PendingRequest {
                kind: msg.kind,
                addr: msg.addr.clone(),
                broadcast: false,
                responses: Vec::new(),
                completion: Some(completion_tx),
            },
        );

        debug!("Message (id={}): {msg}", msg.id);

        if let Err(err) = self.link.send(msg).await {
            self.pending.remove(&msg.id);
            return Err(err);
        }

        let resp_timeout = self.conf.node.local_delivery.resp_timeout;
        match tokio::time::timeout(resp_timeout, completion_rx).await {
            Ok(Ok(())) => {
                let entry = self.pending.remove(&msg.id);
                let resp = entry
                    .and_then(|(_, pending)| pending.responses.into_iter().next())
                    .ok_or(Error::Timeout)?;
                debug!("Response (id={}): {resp}", msg.id);
                Ok(resp)
            }
            _ => {
                self.pending.remove(&msg.id);
                warn!("Response timeout (id={}) for: {msg}", msg.id);
                Err(Error::Timeout)
            }
        }
    }

    /// Unicast send that expects no response; nothing is inserted into the
    /// pending table.
    async fn send_link_no_resp(&self, msg: &mut LinkMsg) -> Result<()> {
        self.prepare_msg(msg, false);
        if msg.addr.is_empty() {
            return Err(Error::NoGateway);
        }

        debug!("Message (id={}, no response): {msg}", msg.id);
        self.link.send(msg).await
    }

    /// Broadcast send collecting all responses that arrive within the
    /// response timeout.
    async fn send_link_unchecked_broadcast(&self, msg: &mut LinkMsg) -> Result<Vec<LinkMsg>> {
        self.prepare_msg(msg, true);
        self.pending.insert(
            msg.id,
            PendingRequest {
                kind: msg.kind,
                addr: msg.addr.clone(),
                broadcast: true,
                responses: Vec::new(),
                completion: None,
            },
        );

        debug!("Broadcast message (id={}): {msg}", msg.id);

        if let Err(err) = self.link.send(msg).await {
            self.pending.remove(&msg.id);
            return Err(err);
        }

        tokio::time::sleep(self.conf.node.local_delivery.resp_timeout).await;

        let responses = self
            .pending
            .remove(&msg.id)
            .map(|(_, pending)| pending.responses)
            .unwrap_or_default();
        for resp in &responses {
            debug!("Response (id={}): {resp}", msg.id);
        }
        Ok(responses)
    }

    async fn recv_link(&self, msg: LinkMsg) -> Result<()> {
        if msg.node_type != NodeType::Gateway && msg.node_type != NodeType::Relay {
            debug!("Received message from invalid node type: {msg}");
            return Err(Error::InvalidArg);
        }

        match msg.kind {
            MsgKind::Ok | MsgKind::Fail | MsgKind::ProbeRes => self.recv_link_resp(msg),
            MsgKind::SubData => self.recv_link_sub_data(msg).await,
            _ => {
                warn!("Received unknown message: {msg}");
                Err(Error::InvalidArg)
            }
        }
    }

    /// Response path: `OK`, `FAIL`, `PROBE_RES`.
    fn recv_link_resp(&self, msg: LinkMsg) -> Result<()> {
        let state = self.state.lock().unwrap();

        if !self.node.validate_msg_id(&msg.addr, msg.id) {
            debug!("Discarding response with duplicate ID: {msg}");
            return Err(Error::MsgDupId);
        }

        if !state.ignore_invalid_ts && !self.node.validate_msg_timestamp(msg.ts, state.gw.ts_diff_ms)
        {
            debug!("Discarding response with invalid timestamp: {msg}");
            return Err(Error::MsgInvalidTs);
        }

        let Some(mut pending) = self.pending.get_mut(&msg.req_id) else {
            debug!("Discarding response for non-existing request: {msg}");
            return Err(Error::NotFound);
        };

        if !pending.broadcast && pending.addr != msg.addr {
            debug!("Discarding response from different address: {msg}");
            return Err(Error::MsgUnknownSender);
        }

        let pair_valid = matches!(
            (pending.kind, msg.kind),
            (MsgKind::PubSubUnsub, MsgKind::Ok)
                | (MsgKind::PubSubUnsub, MsgKind::Fail)
                | (MsgKind::ProbeReq, MsgKind::ProbeRes)
                | (MsgKind::ProbeReq, MsgKind::Fail)
        );
        if !pair_valid {
            debug!(
                "Response of type {} is invalid for request of type {}",
                msg.kind, pending.kind
            );
            return Err(Error::InvalidArg);
        }

        if pending.broadcast {
            pending.responses.push(msg);
        } else {
            // The completion fires exactly once; a further matching
            // response finds it consumed
            let Some(completion) = pending.completion.take() else {
                return Err(Error::NotFound);
            };
            pending.responses.push(msg);
            let _ = completion.send(());
        }

        Ok(())
    }

    /// Delivery path: `SUB_DATA`.
    async fn recv_link_sub_data(&self, msg: LinkMsg) -> Result<()> {
        debug!("Received subscriptions data: {msg}");

        let (id_valid, ts_valid, sender_valid) = {
            let state = self.state.lock().unwrap();
            (
                self.node.validate_msg_id(&msg.addr, msg.id),
                self.node.validate_msg_timestamp(msg.ts, state.gw.ts_diff_ms),
                msg.addr == state.gw.addr,
            )
        };

        if !id_valid || !ts_valid {
            debug!("Message is invalid, discarding: {msg}");
            return Err(if !id_valid {
                Error::MsgDupId
            } else {
                Error::MsgInvalidTs
            });
        }

        if !sender_valid {
            debug!("Discarding data from unknown sender: {msg}");
            return Err(Error::MsgUnknownSender);
        }

        // Best-effort delivery ack
        let mut ack = LinkMsg {
            kind: MsgKind::Ok,
            req_id: msg.id,
            ..LinkMsg::default()
        };
        if let Err(err) = self.send_link_no_resp(&mut ack).await {
            debug!("Delivery ack failed: {err}");
        }

        for data in &msg.subs_data {
            let matches = {
                let state = self.state.lock().unwrap();
                state.sub_db.find(&data.topic)
            };

            // User callbacks run outside every lock; a panicking callback
            // must not poison the dispatcher
            for (topic, cb) in matches {
                debug!("Calling user callback for topic '{topic}'");
                if catch_unwind(AssertUnwindSafe(|| cb(data))).is_err() {
                    error!("User callback for topic '{topic}' panicked");
                }
            }
        }

        Ok(())
    }

    /// Subscription renewal tick: resend every active subscription so the
    /// gateway-side lease doesn't lapse. Failures are left to the next
    /// tick.
    async fn sub_db_tick(&self) {
        debug!("Renewal running");

        let mut msg = LinkMsg {
            kind: MsgKind::PubSubUnsub,
            ..LinkMsg::default()
        };
        {
            let state = self.state.lock().unwrap();
            state
                .sub_db
                .for_each(|topic, _| msg.subs.push(topic.to_string()));
        }

        if msg.subs.is_empty() {
            debug!("Nothing to renew");
            return;
        }

        match self.send_link(&mut msg).await {
            Ok(resp) if resp.kind != MsgKind::Ok => warn!("Received non-OK response"),
            Ok(_) => {}
            Err(err) => warn!("Error while sending the message: {err}"),
        }

        debug!("Renewal done");
    }
}
