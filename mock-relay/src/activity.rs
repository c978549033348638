use chrono::Utc;
use serde_json::{Map, Value, json};
use std::time::Duration;

const REGIONS: [&str; 3] = ["US", "DE", "BR"];

/// Capacity limits read back from the rendered engine config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub max_common_clients: u64,
    pub max_personal_clients: u64,
    /// Per direction, `None` when unlimited
    pub bytes_per_second: Option<u64>,
}

impl Capacity {
    pub fn from_engine_config(config: &Value) -> Self {
        let field = |key: &str| config.get(key).and_then(Value::as_u64);
        Self {
            max_common_clients: field("InproxyMaxCommonClients").unwrap_or(0),
            max_personal_clients: field("InproxyMaxPersonalClients").unwrap_or(0),
            bytes_per_second: field("InproxyLimitUpstreamBytesPerSecond").filter(|b| *b > 0),
        }
    }

    fn max_clients(&self) -> u64 {
        self.max_common_clients.saturating_add(self.max_personal_clients)
    }

    fn cap_bytes(&self, bytes: u64, interval: Duration) -> u64 {
        match self.bytes_per_second {
            Some(limit) => {
                let allowed = (limit as u128 * interval.as_millis() / 1000) as u64;
                bytes.min(allowed)
            }
            None => bytes,
        }
    }
}

pub fn notice(notice_type: &str, data: Value) -> Value {
    json!({
        "noticeType": notice_type,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Synthetic `InproxyProxyActivity` for the given tick. Client counts cycle
/// but never exceed the configured limits; bytes are per-tick increments.
pub fn activity(tick: u64, capacity: &Capacity, interval: Duration, bytes_per_tick: u64) -> Value {
    let max = capacity.max_clients();
    let connected = if max == 0 { 0 } else { (tick % 5 + 1).min(max) };
    let connecting = u64::from(connected < max);
    let announcing = u64::from(connected + connecting < max);

    let (bytes_up, bytes_down) = if connected == 0 {
        (0, 0)
    } else {
        (
            capacity.cap_bytes(bytes_per_tick, interval),
            capacity.cap_bytes(bytes_per_tick.saturating_mul(4), interval),
        )
    };

    let personal = connected.min(capacity.max_personal_clients);
    let common = connected - personal;

    let mut personal_regions = Map::new();
    if personal > 0 {
        personal_regions.insert(
            REGIONS[0].to_string(),
            region(personal, connected, bytes_up, bytes_down),
        );
    }

    let mut common_regions = Map::new();
    for (i, name) in REGIONS.iter().enumerate() {
        let clients = common / 3 + u64::from((i as u64) < common % 3);
        if clients > 0 {
            common_regions.insert(
                name.to_string(),
                region(clients, connected, bytes_up, bytes_down),
            );
        }
    }

    notice(
        "InproxyProxyActivity",
        json!({
            "announcing": announcing,
            "connectingClients": connecting,
            "connectedClients": connected,
            "bytesUp": bytes_up,
            "bytesDown": bytes_down,
            "personalRegionActivity": personal_regions,
            "commonRegionActivity": common_regions,
        }),
    )
}

fn region(clients: u64, connected: u64, bytes_up: u64, bytes_down: u64) -> Value {
    json!({
        "bytesUp": bytes_up * clients / connected,
        "bytesDown": bytes_down * clients / connected,
        "connectingClients": 0,
        "connectedClients": clients,
    })
}
