use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use picolink_core::NodeConfig;

/// Gateway discovery parameters.
#[derive(Debug, Clone)]
pub struct GatewayDiscovery {
    /// Cool-down after the first failed discovery attempt.
    ///
    /// The actual delay starts here and doubles on each further failure
    /// until capped at `dscv_max_delay`. A successful discovery resets it.
    pub dscv_min_delay: Duration,

    /// Cap for the discovery cool-down delay.
    pub dscv_max_delay: Duration,

    /// Failure threshold of the initial discovery.
    ///
    /// This many failed attempts during construction are considered
    /// unrecoverable and fail the constructor. Value 0 means try
    /// indefinitely.
    pub initial_dscv_fail_thres: u16,

    /// After how many failed or unresponded messages from the current
    /// gateway in a row to trigger rediscovery.
    ///
    /// Values 0 and 1 are equivalent (no loss is permitted).
    pub trig_msgs_fail_cnt: u16,

    /// After how many unresponded time-sync probes in a row to trigger
    /// rediscovery.
    ///
    /// Values 0 and 1 are equivalent (no loss is permitted).
    pub trig_time_sync_no_resp_cnt: u16,
}

impl Default for GatewayDiscovery {
    fn default() -> Self {
        GatewayDiscovery {
            dscv_min_delay: Duration::from_secs(1),
            dscv_max_delay: Duration::from_secs(120),
            initial_dscv_fail_thres: 5,
            trig_msgs_fail_cnt: 5,
            trig_time_sync_no_resp_cnt: 2,
        }
    }
}

/// Client-side reporting switches.
#[derive(Debug, Clone)]
pub struct ClientReporting {
    /// Report RSSI of all probe responses received during gateway
    /// discovery. In other words, the client reports its signal strength
    /// towards every reachable gateway, in a single publication bundle.
    pub rssi_on_gw_dscv: bool,
}

impl Default for ClientReporting {
    fn default() -> Self {
        ClientReporting {
            rssi_on_gw_dscv: true,
        }
    }
}

/// Subscription database parameters.
#[derive(Debug, Clone)]
pub struct SubDbConfig {
    /// Lifetime of a subscription on the client.
    ///
    /// The client automatically renews all subscriptions at this
    /// interval. Must be strictly below the gateway's subscription
    /// lifetime, otherwise the server-side lease lapses before renewal.
    pub sub_lifetime: Duration,
}

impl Default for SubDbConfig {
    fn default() -> Self {
        SubDbConfig {
            sub_lifetime: Duration::from_secs(600),
        }
    }
}

/// Hook used to set the system clock after a successful time sync.
///
/// Receives the synchronized wall-clock time as a duration since the Unix
/// epoch. The syscall glue is platform specific and injected by the
/// application; a failure is logged by the client, never surfaced.
pub type SystemTimeHook = Arc<dyn Fn(Duration) -> std::io::Result<()> + Send + Sync>;

/// Time synchronization parameters.
#[derive(Clone, Default)]
pub struct TimeSyncConfig {
    /// How often to reprobe the gateway in the background.
    ///
    /// Keeps the time difference fresh, which the replay protection
    /// depends on. Zero disables background reprobing; you then have to
    /// call `sync_time` yourself (safe for devices that fully reinitialize
    /// after periodic deep-sleep wakeups).
    ///
    /// Defaults to 60 minutes via [`ClientConfig::default`].
    pub reprobe_gateway_interval: Duration,

    /// When set, the system clock is updated after every successful time
    /// sync. Gateways usually follow SNTP, so their time is fairly
    /// precise; on IoT devices this can be safely enabled, while ordinary
    /// Linux systems keep their own synchronization and should leave it
    /// unset.
    pub system_time_hook: Option<SystemTimeHook>,
}

impl fmt::Debug for TimeSyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSyncConfig")
            .field("reprobe_gateway_interval", &self.reprobe_gateway_interval)
            .field("system_time_hook", &self.system_time_hook.is_some())
            .finish()
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub node: NodeConfig,
    pub gw_dscv: GatewayDiscovery,
    pub reporting: ClientReporting,
    pub sub_db: SubDbConfig,
    pub time_sync: TimeSyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            node: NodeConfig::default(),
            gw_dscv: GatewayDiscovery::default(),
            reporting: ClientReporting::default(),
            sub_db: SubDbConfig::default(),
            time_sync: TimeSyncConfig {
                reprobe_gateway_interval: Duration::from_secs(3600),
                system_time_hook: None,
            },
        }
    }
}
