use once_cell::sync::Lazy;
use std::time::Duration;

const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

static READ_TIMEOUT: Lazy<Duration> = Lazy::new(|| {
    env_duration(
        "SWAGENT_READ_TIMEOUT_SECS",
        Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
    )
});

static SNMP_BULKWALK: Lazy<String> = Lazy::new(|| {
    std::env::var("SWAGENT_SNMP_BULKWALK").unwrap_or_else(|_| "snmpbulkwalk".to_string())
});

pub fn read_timeout() -> Duration {
    *READ_TIMEOUT
}

pub fn snmp_bulkwalk_bin() -> &'static str {
    SNMP_BULKWALK.as_str()
}

fn env_duration(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
