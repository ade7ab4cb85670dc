//! Client end-to-end tests against a scripted link layer.
//!
//! All tests run on the paused tokio clock, so response timeouts and
//! discovery backoff delays elapse instantly and deterministically.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{self, Instant};

use picolink_tokio::time::steady_now_ms;
use picolink_tokio::{
    Client, ClientConfig, ClientReporting, ClientRetainedState, Error, GatewayDiscovery, LinkAddr,
    LinkLayer, LinkMsg, LocalDelivery, MsgIdCacheConfig, MsgKind, NodeConfig, NodeType, RecvCb,
    Result, SubData, SubDbConfig, TimeSyncConfig,
};

const TIME_UNIT: Duration = Duration::from_millis(10);
const RESP_TIMEOUT: Duration = Duration::from_millis(20);

const GW1_ADDR: [u8; 1] = [0x01];
const GW2_ADDR: [u8; 4] = [0x02, 0x01, 0x02, 0x03];
const GW3_ADDR: [u8; 5] = [0x03, 0x0b, 0x16, 0x21, 0x2c];

fn test_config() -> ClientConfig {
    ClientConfig {
        node: NodeConfig {
            local_delivery: LocalDelivery {
                resp_timeout: RESP_TIMEOUT,
            },
            msg_id_cache: MsgIdCacheConfig {
                time_unit: TIME_UNIT,
                max_age: 2,
            },
            ..NodeConfig::default()
        },
        gw_dscv: GatewayDiscovery {
            dscv_min_delay: Duration::from_millis(5),
            dscv_max_delay: Duration::from_secs(1),
            initial_dscv_fail_thres: 3,
            trig_msgs_fail_cnt: 5,
            trig_time_sync_no_resp_cnt: 2,
        },
        reporting: ClientReporting {
            rssi_on_gw_dscv: false,
        },
        sub_db: SubDbConfig {
            sub_lifetime: Duration::from_secs(60),
        },
        time_sync: TimeSyncConfig {
            reprobe_gateway_interval: Duration::from_secs(600),
            system_time_hook: None,
        },
    }
}

fn probe_res(addr: impl Into<LinkAddr>, pref: i16, ts_diff_ms: i64) -> LinkMsg {
    LinkMsg {
        kind: MsgKind::ProbeRes,
        addr: addr.into(),
        node_type: NodeType::Gateway,
        pref,
        ts_diff_ms,
        ..LinkMsg::default()
    }
}

fn ok_resp(addr: impl Into<LinkAddr>) -> LinkMsg {
    LinkMsg {
        kind: MsgKind::Ok,
        addr: addr.into(),
        node_type: NodeType::Gateway,
        ..LinkMsg::default()
    }
}

fn fail_resp(addr: impl Into<LinkAddr>) -> LinkMsg {
    LinkMsg {
        kind: MsgKind::Fail,
        addr: addr.into(),
        node_type: NodeType::Gateway,
        fail_reason: picolink_tokio::FailReason::ProcessingFailed,
        ..LinkMsg::default()
    }
}

/// Valid message timestamp for a peer with the given time difference.
fn msg_ts(ts_diff_ms: i64) -> u16 {
    ((steady_now_ms() + ts_diff_ms) / TIME_UNIT.as_millis() as i64) as u16
}

#[derive(Default)]
struct MockShared {
    recv_cb: Option<RecvCb>,
    sent: Vec<LinkMsg>,
    channels: Vec<u16>,
    channel_log: Vec<u16>,
    /// One batch of responses is consumed (prepared and delivered back)
    /// per outbound send.
    responses: VecDeque<Vec<LinkMsg>>,
    resp_ts_diff_ms: i64,
    next_resp_id: u16,
    set_channel_error: Option<Error>,
}

/// Scriptable in-memory link layer.
#[derive(Clone)]
struct MockLink {
    shared: Arc<Mutex<MockShared>>,
}

impl MockLink {
    fn new() -> Self {
        let shared = MockShared {
            next_resp_id: 0x4000,
            ..MockShared::default()
        };
        MockLink {
            shared: Arc::new(Mutex::new(shared)),
        }
    }

    fn with_channels(channels: Vec<u16>) -> Self {
        let link = MockLink::new();
        link.shared.lock().unwrap().channels = channels;
        link
    }

    /// Queues a single response for the next outbound send.
    fn push_response(&self, msg: LinkMsg) {
        self.push_responses(vec![msg]);
    }

    /// Queues a batch of responses for the next outbound send.
    fn push_responses(&self, batch: Vec<LinkMsg>) {
        self.shared.lock().unwrap().responses.push_back(batch);
    }

    fn set_resp_ts_diff(&self, ts_diff_ms: i64) {
        self.shared.lock().unwrap().resp_ts_diff_ms = ts_diff_ms;
    }

    fn set_channel_error(&self, error: Option<Error>) {
        self.shared.lock().unwrap().set_channel_error = error;
    }

    fn sent(&self) -> Vec<LinkMsg> {
        self.shared.lock().unwrap().sent.clone()
    }

    fn clear_sent(&self) {
        self.shared.lock().unwrap().sent.clear();
    }

    fn channel_log(&self) -> Vec<u16> {
        self.shared.lock().unwrap().channel_log.clone()
    }

    fn has_recv_cb(&self) -> bool {
        self.shared.lock().unwrap().recv_cb.is_some()
    }
}

impl LinkLayer for MockLink {
    async fn send(&self, msg: &LinkMsg) -> Result<()> {
        let (recv_cb, batch) = {
            let mut shared = self.shared.lock().unwrap();
            shared.sent.push(msg.clone());

            let batch = shared.responses.pop_front().unwrap_or_default();
            let ts_diff_ms = shared.resp_ts_diff_ms;
            let prepared: Vec<LinkMsg> = batch
                .into_iter()
                .map(|mut resp| {
                    resp.req_id = msg.id;
                    resp.id = shared.next_resp_id;
                    shared.next_resp_id += 1;
                    resp.ts = msg_ts(ts_diff_ms);
                    resp
                })
                .collect();
            (shared.recv_cb.clone(), prepared)
        };

        if let Some(recv_cb) = recv_cb {
            for resp in batch {
                recv_cb(resp);
            }
        }
        Ok(())
    }

    fn channels(&self) -> Vec<u16> {
        self.shared.lock().unwrap().channels.clone()
    }

    async fn set_channel(&self, channel: u16) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.channel_log.push(channel);
        match shared.set_channel_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn set_recv_cb(&self, cb: Option<RecvCb>) {
        self.shared.lock().unwrap().recv_cb = cb;
    }
}

/// Escapes the shared steady-clock epoch and gives every test a clean,
/// strictly positive time base.
async fn warm_clock() {
    time::advance(Duration::from_secs(3600)).await;
}

/// Lets background tasks woken by a clock advance run to completion.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Constructs a client bound to GW2 over a channel-less link.
async fn connect(link: &MockLink) -> Client<MockLink> {
    link.push_response(probe_res(GW2_ADDR, 200, 0));
    Client::new(test_config(), link.clone(), None)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_initial_discovery_success() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    let sent = link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MsgKind::ProbeReq);
    assert!(sent[0].addr.is_empty());
    assert_eq!(sent[0].node_type, NodeType::Client);

    assert!(link.channel_log().is_empty());

    let gw = client.gateway().unwrap();
    assert_eq!(gw.addr, LinkAddr::from(GW2_ADDR));
    assert_eq!(gw.pref, 200);
}

#[tokio::test(start_paused = true)]
async fn test_initial_discovery_failure() {
    warm_clock().await;
    let link = MockLink::new();

    let result = Client::new(test_config(), link.clone(), None).await;
    assert_eq!(result.err(), Some(Error::TooManyFailedAttempts));

    // One broadcast probe per attempt, hook cleared again on teardown
    assert_eq!(link.sent().len(), 3);
    assert!(!link.has_recv_cb());
}

#[tokio::test(start_paused = true)]
async fn test_discovery_backoff_is_exponential() {
    warm_clock().await;
    let link = MockLink::new();

    let mut conf = test_config();
    conf.gw_dscv.initial_dscv_fail_thres = 4;
    conf.gw_dscv.dscv_max_delay = Duration::from_millis(20);

    let start = Instant::now();
    let result = Client::new(conf, link.clone(), None).await;
    assert_eq!(result.err(), Some(Error::TooManyFailedAttempts));

    // 4 probes of 20 ms each, inter-attempt delays 5 + 10 + 20 + 20 (capped)
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(135) && elapsed < Duration::from_millis(160),
        "unexpected elapsed time {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_retained_sync_fast_path() {
    warm_clock().await;
    let link = MockLink::new();
    link.push_response(probe_res(GW1_ADDR, 100, 100));

    let retained = ClientRetainedState {
        gw: picolink_tokio::Peer {
            addr: LinkAddr::from(GW1_ADDR),
            channel: 1,
            ..picolink_tokio::Peer::default()
        }
        .retain(),
        ..ClientRetainedState::default()
    };

    let client = Client::new(test_config(), link.clone(), Some(retained))
        .await
        .unwrap();

    // Channel restored, one unicast probe, no broadcast discovery
    assert_eq!(link.channel_log(), vec![1]);
    let sent = link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MsgKind::ProbeReq);
    assert_eq!(sent[0].addr, LinkAddr::from(GW1_ADDR));

    let gw = client.gateway().unwrap();
    assert_eq!(gw.addr, LinkAddr::from(GW1_ADDR));
    assert_eq!(gw.ts_diff_ms, 100);
}

#[tokio::test(start_paused = true)]
async fn test_retained_sync_failure_falls_back_to_discovery() {
    warm_clock().await;
    let link = MockLink::new();
    // The sync probe gets an answer from the wrong peer (rejected), the
    // discovery broadcast then finds GW2
    link.push_response(probe_res(GW2_ADDR, 200, 0));
    link.push_response(probe_res(GW2_ADDR, 200, 0));

    let retained = ClientRetainedState {
        gw: picolink_tokio::Peer {
            addr: LinkAddr::from(GW1_ADDR),
            channel: 1,
            ..picolink_tokio::Peer::default()
        }
        .retain(),
        ..ClientRetainedState::default()
    };

    let client = Client::new(test_config(), link.clone(), Some(retained))
        .await
        .unwrap();

    let sent = link.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].addr, LinkAddr::from(GW1_ADDR));
    assert!(sent[1].addr.is_empty());

    assert_eq!(client.gateway().unwrap().addr, LinkAddr::from(GW2_ADDR));
}

#[tokio::test(start_paused = true)]
async fn test_multi_channel_scan_picks_best_pref() {
    warm_clock().await;
    let link = MockLink::with_channels(vec![74, 39, 88]);
    link.push_response(probe_res(GW1_ADDR, 100, 0));
    link.push_response(probe_res(GW3_ADDR, 300, 0));
    link.push_response(probe_res(GW2_ADDR, 200, 0));

    let client = Client::new(test_config(), link.clone(), None)
        .await
        .unwrap();

    // All channels visited, then the winner's channel applied
    assert_eq!(link.channel_log(), vec![74, 39, 88, 39]);

    let gw = client.gateway().unwrap();
    assert_eq!(gw.addr, LinkAddr::from(GW3_ADDR));
    assert_eq!(gw.channel, 39);
    assert_eq!(gw.pref, 300);
}

#[tokio::test(start_paused = true)]
async fn test_unsettable_channel_is_skipped() {
    warm_clock().await;
    let link = MockLink::with_channels(vec![74, 39]);
    link.set_channel_error(Some(Error::InvalidArg));

    let mut conf = test_config();
    conf.gw_dscv.initial_dscv_fail_thres = 1;

    let result = Client::new(conf, link.clone(), None).await;
    assert_eq!(result.err(), Some(Error::TooManyFailedAttempts));

    // Both channels attempted, no probe ever sent
    assert_eq!(link.channel_log(), vec![74, 39]);
    assert!(link.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_first_seen_response_wins_pref_ties() {
    warm_clock().await;
    let link = MockLink::new();
    link.push_responses(vec![
        probe_res(GW3_ADDR, 300, 0),
        probe_res(GW2_ADDR, 300, 0),
        probe_res(GW1_ADDR, 100, 0),
    ]);

    let client = Client::new(test_config(), link.clone(), None)
        .await
        .unwrap();

    assert_eq!(client.gateway().unwrap().addr, LinkAddr::from(GW3_ADDR));
}

#[tokio::test(start_paused = true)]
async fn test_publish_and_counter_reset() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;
    link.clear_sent();

    link.push_response(ok_resp(GW2_ADDR));
    client.publish("abc", "payload1").await.unwrap();

    let sent = link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MsgKind::PubSubUnsub);
    assert_eq!(sent[0].addr, LinkAddr::from(GW2_ADDR));
    assert_eq!(sent[0].pubs.len(), 1);
    assert_eq!(sent[0].pubs[0].topic, "abc");
    assert_eq!(sent[0].pubs[0].payload, Bytes::from("payload1"));

    assert_eq!(client.retain().msgs_fail_cnt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_publish_timeout_and_fail_response() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    // No response at all
    assert_eq!(client.publish("abc", "p").await.err(), Some(Error::Timeout));
    assert_eq!(client.retain().msgs_fail_cnt, 1);

    // Explicit FAIL from the gateway
    link.push_response(fail_resp(GW2_ADDR));
    assert_eq!(
        client.publish("abc", "p").await.err(),
        Some(Error::MsgProcessingFailed)
    );
    assert_eq!(client.retain().msgs_fail_cnt, 2);

    // Success resets the counter
    link.push_response(ok_resp(GW2_ADDR));
    client.publish("abc", "p").await.unwrap();
    assert_eq!(client.retain().msgs_fail_cnt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_relayed_response_accepted() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    // Relays answer on behalf of the gateway; the source address is what
    // has to match
    let mut resp = ok_resp(GW2_ADDR);
    resp.node_type = NodeType::Relay;
    link.push_response(resp);
    client.publish("abc", "p").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_empty_bulk_request_is_a_no_op() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;
    link.clear_sent();

    client
        .pub_sub_unsub_bulk(Vec::new(), Vec::new(), Vec::new())
        .await
        .unwrap();
    assert!(link.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_after_failed_messages() {
    warm_clock().await;
    let link = MockLink::new();

    let mut conf = test_config();
    conf.gw_dscv.trig_msgs_fail_cnt = 3;

    link.push_response(probe_res(GW2_ADDR, 200, 0));
    let client = Arc::new(Client::new(conf, link.clone(), None).await.unwrap());
    link.clear_sent();

    for _ in 0..3 {
        assert_eq!(client.publish("abc", "p").await.err(), Some(Error::Timeout));
    }

    // The watchdog is now rediscovering in the background; let it find GW3
    link.push_response(probe_res(GW3_ADDR, 300, 0));
    for _ in 0..500 {
        if client.gateway().map(|gw| gw.addr) == Some(LinkAddr::from(GW3_ADDR)) {
            break;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.gateway().unwrap().addr, LinkAddr::from(GW3_ADDR));
    assert_eq!(client.retain().msgs_fail_cnt, 0);

    // The rediscovery probe went out as a broadcast
    let sent = link.sent();
    let probe = sent[3..].iter().find(|m| m.kind == MsgKind::ProbeReq);
    assert!(probe.unwrap().addr.is_empty());

    // Unicasts to the new gateway work again
    link.push_response(ok_resp(GW3_ADDR));
    client.publish("abc", "p").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_subscription_delivery_with_wildcard() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    let deliveries: Arc<Mutex<Vec<SubData>>> = Arc::new(Mutex::new(Vec::new()));
    let log = deliveries.clone();
    link.push_response(ok_resp(GW2_ADDR));
    client
        .subscribe("aaa/bbb/#", move |data: &SubData| {
            log.lock().unwrap().push(data.clone());
        })
        .await
        .unwrap();
    link.clear_sent();

    let sub_data = LinkMsg {
        kind: MsgKind::SubData,
        addr: LinkAddr::from(GW2_ADDR),
        node_type: NodeType::Gateway,
        id: 0x5000,
        ts: msg_ts(0),
        subs_data: vec![
            SubData::new("aaa/bbb/123", "P1"),
            SubData::new("aaa/bbb/1/2", "P2"),
        ],
        ..LinkMsg::default()
    };
    client.recv_link(sub_data).await.unwrap();

    let got = deliveries.lock().unwrap().clone();
    let topics: HashSet<String> = got.iter().map(|d| d.topic.clone()).collect();
    assert_eq!(got.len(), 2);
    assert!(topics.contains("aaa/bbb/123"));
    assert!(topics.contains("aaa/bbb/1/2"));

    // The delivery was acked back to the gateway
    let sent = link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MsgKind::Ok);
    assert_eq!(sent[0].addr, LinkAddr::from(GW2_ADDR));
    assert_eq!(sent[0].req_id, 0x5000);
}

#[tokio::test(start_paused = true)]
async fn test_sub_data_replay_protection() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    let hits = Arc::new(Mutex::new(0usize));
    let counter = hits.clone();
    link.push_response(ok_resp(GW2_ADDR));
    client
        .subscribe("abc", move |_: &SubData| {
            *counter.lock().unwrap() += 1;
        })
        .await
        .unwrap();

    let sub_data = LinkMsg {
        kind: MsgKind::SubData,
        addr: LinkAddr::from(GW2_ADDR),
        node_type: NodeType::Gateway,
        id: 0x5001,
        ts: msg_ts(0),
        subs_data: vec![SubData::new("abc", "P1")],
        ..LinkMsg::default()
    };

    client.recv_link(sub_data.clone()).await.unwrap();
    assert_eq!(
        client.recv_link(sub_data.clone()).await.err(),
        Some(Error::MsgDupId)
    );
    assert_eq!(
        client.recv_link(sub_data.clone()).await.err(),
        Some(Error::MsgDupId)
    );
    assert_eq!(*hits.lock().unwrap(), 1);

    // After the cache entry expired the stale timestamp is what rejects
    // the replay
    time::advance(TIME_UNIT * 3 + Duration::from_millis(5)).await;
    settle().await;
    assert_eq!(
        client.recv_link(sub_data).await.err(),
        Some(Error::MsgInvalidTs)
    );
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sub_data_from_unknown_sender() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;
    link.clear_sent();

    let sub_data = LinkMsg {
        kind: MsgKind::SubData,
        addr: LinkAddr::from(GW3_ADDR),
        node_type: NodeType::Gateway,
        id: 0x5002,
        ts: msg_ts(0),
        subs_data: vec![SubData::new("abc", "P1")],
        ..LinkMsg::default()
    };

    assert_eq!(
        client.recv_link(sub_data).await.err(),
        Some(Error::MsgUnknownSender)
    );
    // No ack for rejected deliveries
    assert!(link.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_inbound_messages_rejected() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    // Responses are only accepted from gateways and relays
    let mut msg = ok_resp(GW2_ADDR);
    msg.node_type = NodeType::Client;
    assert_eq!(client.recv_link(msg).await.err(), Some(Error::InvalidArg));

    let mut msg = ok_resp(GW2_ADDR);
    msg.node_type = NodeType::Unknown;
    assert_eq!(client.recv_link(msg).await.err(), Some(Error::InvalidArg));

    // Requests are not valid inbound kinds for a client
    let msg = LinkMsg {
        kind: MsgKind::ProbeReq,
        addr: LinkAddr::from(GW2_ADDR),
        node_type: NodeType::Gateway,
        id: 0x5003,
        ts: msg_ts(0),
        ..LinkMsg::default()
    };
    assert_eq!(client.recv_link(msg).await.err(), Some(Error::InvalidArg));

    // A response without a matching pending request
    let msg = LinkMsg {
        id: 0x5004,
        ts: msg_ts(0),
        req_id: 0x1234,
        ..ok_resp(GW2_ADDR)
    };
    assert_eq!(client.recv_link(msg).await.err(), Some(Error::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_callback_does_not_poison_dispatcher() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    let hits = Arc::new(Mutex::new(0usize));
    let counter = hits.clone();
    link.push_response(ok_resp(GW2_ADDR));
    client
        .subscribe_bulk(vec![
            picolink_tokio::SubReq::new("bad", |_: &SubData| panic!("user bug")),
            picolink_tokio::SubReq::new("good", move |_: &SubData| {
                *counter.lock().unwrap() += 1;
            }),
        ])
        .await
        .unwrap();

    let sub_data = LinkMsg {
        kind: MsgKind::SubData,
        addr: LinkAddr::from(GW2_ADDR),
        node_type: NodeType::Gateway,
        id: 0x5005,
        ts: msg_ts(0),
        subs_data: vec![SubData::new("bad", "P1"), SubData::new("good", "P2")],
        ..LinkMsg::default()
    };
    client.recv_link(sub_data).await.unwrap();

    assert_eq!(*hits.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_all() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    link.push_response(ok_resp(GW2_ADDR));
    client
        .subscribe_bulk(vec![
            picolink_tokio::SubReq::new("abc", |_: &SubData| {}),
            picolink_tokio::SubReq::new("def", |_: &SubData| {}),
        ])
        .await
        .unwrap();
    link.clear_sent();

    link.push_response(ok_resp(GW2_ADDR));
    client.unsubscribe_all().await.unwrap();

    let sent = link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MsgKind::PubSubUnsub);
    let unsubs: HashSet<&str> = sent[0].unsubs.iter().map(String::as_str).collect();
    assert_eq!(unsubs, HashSet::from(["abc", "def"]));
    assert!(sent[0].subs.is_empty());

    // Database is now empty, a second call sends nothing
    client.unsubscribe_all().await.unwrap();
    assert_eq!(link.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_all_keeps_database() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;

    link.push_response(ok_resp(GW2_ADDR));
    client.subscribe("abc", |_: &SubData| {}).await.unwrap();
    link.clear_sent();

    for _ in 0..2 {
        link.push_response(ok_resp(GW2_ADDR));
        client.resubscribe_all().await.unwrap();
    }

    let sent = link.sent();
    assert_eq!(sent.len(), 2);
    for msg in &sent {
        assert_eq!(msg.subs, vec!["abc".to_string()]);
        assert!(msg.unsubs.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscription_lease_renewal() {
    warm_clock().await;
    let link = MockLink::new();

    let mut conf = test_config();
    conf.sub_db.sub_lifetime = Duration::from_millis(200);

    link.push_response(probe_res(GW2_ADDR, 200, 0));
    let client = Client::new(conf, link.clone(), None).await.unwrap();

    link.push_response(ok_resp(GW2_ADDR));
    client.subscribe("abc", |_: &SubData| {}).await.unwrap();
    link.clear_sent();

    link.push_response(ok_resp(GW2_ADDR));
    time::advance(Duration::from_millis(250)).await;
    settle().await;

    let renewals: Vec<LinkMsg> = link
        .sent()
        .into_iter()
        .filter(|m| m.kind == MsgKind::PubSubUnsub)
        .collect();
    assert!(!renewals.is_empty());
    assert_eq!(renewals[0].subs, vec!["abc".to_string()]);
    assert!(renewals[0].pubs.is_empty());
    assert!(renewals[0].unsubs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sync_time_updates_ts_diff() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;
    link.clear_sent();

    link.push_response(probe_res(GW2_ADDR, 200, 500));
    client.sync_time().await.unwrap();

    let sent = link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MsgKind::ProbeReq);
    assert_eq!(sent[0].addr, LinkAddr::from(GW2_ADDR));

    assert_eq!(client.gateway().unwrap().ts_diff_ms, 500);
    assert_eq!(client.retain().time_sync_no_resp_cnt, 0);

    // Traffic keeps flowing under the shifted gateway clock
    link.set_resp_ts_diff(500);
    link.push_response(ok_resp(GW2_ADDR));
    client.publish("abc", "p").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sync_time_failures_trigger_rediscovery() {
    warm_clock().await;
    let link = MockLink::new();
    let client = Arc::new(connect(&link).await);

    assert_eq!(client.sync_time().await.err(), Some(Error::Timeout));
    assert_eq!(client.retain().time_sync_no_resp_cnt, 1);

    // Second failure reaches trig_time_sync_no_resp_cnt
    assert_eq!(client.sync_time().await.err(), Some(Error::Timeout));

    link.push_response(probe_res(GW3_ADDR, 300, 0));
    for _ in 0..500 {
        if client.gateway().map(|gw| gw.addr) == Some(LinkAddr::from(GW3_ADDR)) {
            break;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.gateway().unwrap().addr, LinkAddr::from(GW3_ADDR));
    assert_eq!(client.retain().time_sync_no_resp_cnt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_system_time_hook_invoked() {
    warm_clock().await;
    let link = MockLink::new();

    let set_times: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
    let log = set_times.clone();

    let mut conf = test_config();
    conf.time_sync.system_time_hook = Some(Arc::new(move |now| {
        log.lock().unwrap().push(now);
        Ok(())
    }));

    link.push_response(probe_res(GW2_ADDR, 200, 0));
    let client = Client::new(conf, link.clone(), None).await.unwrap();

    link.push_response(probe_res(GW2_ADDR, 200, 250));
    client.sync_time().await.unwrap();

    let times = set_times.lock().unwrap().clone();
    assert_eq!(times.len(), 1);
    assert_eq!(
        times[0],
        Duration::from_millis((steady_now_ms() + 250) as u64)
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_discovery_clears_gateway() {
    warm_clock().await;
    let link = MockLink::new();
    let client = connect(&link).await;
    assert!(client.gateway().is_some());

    assert_eq!(
        client.discover_gateway(1).await.err(),
        Some(Error::TooManyFailedAttempts)
    );
    assert!(client.gateway().is_none());

    assert_eq!(
        client.publish("abc", "p").await.err(),
        Some(Error::NoGateway)
    );
}

#[tokio::test(start_paused = true)]
async fn test_rssi_report_after_discovery() {
    warm_clock().await;
    let link = MockLink::new();

    let mut conf = test_config();
    conf.reporting.rssi_on_gw_dscv = true;

    let mut res = probe_res(GW2_ADDR, 200, 0);
    res.rssi = -42;
    link.push_response(res);

    let client = Client::new(conf, link.clone(), None).await.unwrap();

    let sent = link.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, MsgKind::PubSubUnsub);
    assert_eq!(sent[1].addr, LinkAddr::from(GW2_ADDR));
    assert_eq!(sent[1].pubs.len(), 1);
    assert_eq!(sent[1].pubs[0].topic, "_report/rssi/02010203");
    assert_eq!(sent[1].pubs[0].payload, Bytes::from("-42"));

    // The report went unanswered; best effort must not touch the
    // failure accounting of the fresh binding
    assert_eq!(client.retain().msgs_fail_cnt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retain_and_reconnect() {
    warm_clock().await;
    let link = MockLink::with_channels(vec![74, 39, 88]);
    link.push_response(probe_res(GW1_ADDR, 100, 0));
    link.push_response(probe_res(GW3_ADDR, 300, 0));
    link.push_response(probe_res(GW2_ADDR, 200, 0));

    let client = Client::new(test_config(), link.clone(), None)
        .await
        .unwrap();
    let retained = client.retain();
    client.shutdown().await;

    // Survives the binary round trip used by deep-sleep stores
    let restored = ClientRetainedState::from_bytes(&retained.to_bytes()).unwrap();
    assert_eq!(restored, retained);

    let link2 = MockLink::with_channels(vec![74, 39, 88]);
    link2.push_response(probe_res(GW3_ADDR, 300, 0));

    let client2 = Client::new(test_config(), link2.clone(), Some(restored))
        .await
        .unwrap();

    // Exactly one channel switch and one unicast probe exchange
    assert_eq!(link2.channel_log(), vec![39]);
    let sent = link2.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MsgKind::ProbeReq);
    assert_eq!(sent[0].addr, LinkAddr::from(GW3_ADDR));
    assert_eq!(client2.gateway().unwrap().addr, LinkAddr::from(GW3_ADDR));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_clears_hook_and_wakes_senders() {
    warm_clock().await;
    let link = MockLink::new();
    let client = Arc::new(connect(&link).await);
    assert!(link.has_recv_cb());

    let sender = {
        let client = client.clone();
        tokio::spawn(async move { client.publish("abc", "p").await })
    };
    tokio::task::yield_now().await;

    client.shutdown().await;
    assert!(!link.has_recv_cb());

    assert_eq!(sender.await.unwrap().err(), Some(Error::Timeout));
}
