//! Environment variable overlay.
//!
//! The lookup is injected so callers decide where variables come from; the
//! binary passes `std::env::var`, tests pass a map.

use std::str::FromStr;

use crate::loader::ConfigError;
use crate::types::{BusTransport, CacheBackend, Config, Mode};

const BUS_CONTEXTS: [&str; 4] = ["PROXY", "PLAN", "BILLING", "USERS"];

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(name)
            .map(|v| {
                v.parse::<T>().map_err(|e| ConfigError::Env {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        self.raw(name)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(ConfigError::Env {
                    name: name.to_string(),
                    reason: format!("not a boolean: {other}"),
                }),
            })
            .transpose()
    }
}

/// Overlay environment variables onto `config`.
pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    if let Some(v) = env.parse::<Mode>("MODE")? {
        config.mode = v;
    }

    // Listener
    if let Some(v) = env.raw("LISTEN_HOST") {
        config.proxy.listen_host = v;
    }
    if let Some(v) = env.parse("HTTP_LISTENER_PORT")? {
        config.proxy.listen_port = v;
    }

    // Rate limiter
    let rl = &mut config.rate_limit;
    if let Some(v) = env.parse("NET_BANDWIDTH")? {
        rl.net_bandwidth_mbps = v;
    }
    if let Some(v) = env.parse("MAX_USERS")? {
        rl.max_users = v;
    }
    if let Some(v) = env.parse("SHARD_COUNT")? {
        rl.shard_count = Some(v);
    }
    if let Some(v) = env.parse("CAPACITY_MB")? {
        rl.capacity_mb = v;
    }
    if let Some(v) = env.parse("FILL_RATE_MBPS")? {
        rl.fill_rate_mbps = Some(v);
    }
    if let Some(v) = env.parse("MAX_CONNS")? {
        rl.max_connections = Some(v);
    }
    if let Some(v) = env.parse("BLOCK_DURATION_SEC")? {
        rl.block_duration_secs = v;
    }
    if let Some(v) = env.parse("CLEANUP_INTERVAL_SEC")? {
        rl.cleanup_interval_secs = v;
    }

    if let Some(v) = env.parse("AUTH_VALIDATE_TTL_MS")? {
        config.auth.validate_ttl_ms = v;
    }

    // Egress
    if let Some(v) = env.flag("EGRESS_ENABLED")? {
        config.egress.enabled = v;
    }
    if let Some(v) = env.parse("EGRESS_ROTATION_TTL_SEC")? {
        config.egress.rotation_ttl_secs = v;
    }
    if let Some(v) = env.parse("EGRESS_RESOLVE_INTERVAL_SEC")? {
        config.egress.resolve_interval_secs = v;
    }

    // Traffic reporter
    if let Some(v) = env.parse("TRAFFIC_THRESHOLD_BYTES")? {
        config.traffic.threshold_bytes = v;
    }
    if let Some(v) = env.parse("TRAFFIC_INTERVAL_SEC")? {
        config.traffic.interval_secs = v;
    }

    if let Some(v) = env.raw("DATABASE_URL") {
        config.database.url = Some(v);
    }

    // Remote cache
    if let Some(host) = env.raw("TC_CACHE_HOST") {
        config.cache.backend = CacheBackend::Sql;
        config.cache.url = Some(cache_url(&env, &host)?);
    }

    // Bus
    let mut any_bootstrap = false;
    for ctx in BUS_CONTEXTS {
        let Some(bus) = config.bus.context_mut(ctx) else {
            continue;
        };
        if let Some(v) = env.raw(&format!("{ctx}_KAFKA_BOOTSTRAP_SERVERS")) {
            bus.bootstrap_servers = Some(v);
            any_bootstrap = true;
        }
        if let Some(v) = env.raw(&format!("{ctx}_KAFKA_GROUP_ID")) {
            bus.group_id = Some(v);
        }
        if let Some(v) = env.raw(&format!("{ctx}_KAFKA_AUTO_OFFSET_RESET")) {
            bus.auto_offset_reset = v;
        }
        if let Some(v) = env.raw(&format!("{ctx}_KAFKA_TOPIC")) {
            bus.topic = Some(v);
        }
    }
    match env.raw("BUS_TRANSPORT").as_deref() {
        Some("memory") => config.bus.transport = BusTransport::Memory,
        Some("sql") => config.bus.transport = BusTransport::Sql,
        Some(other) => {
            return Err(ConfigError::Env {
                name: "BUS_TRANSPORT".into(),
                reason: format!("unknown transport: {other}"),
            });
        }
        None if any_bootstrap => config.bus.transport = BusTransport::Sql,
        None => {}
    }

    // Observability
    if let Some(v) = env.raw("METRICS_LISTEN") {
        config.metrics.listen = Some(v);
    }
    if let Some(v) = env.raw("LOG_LEVEL") {
        config.logging.level = Some(v);
    }
    if let Some(v) = env.raw("LOG_FORMAT") {
        config.logging.format = Some(v);
    }

    Ok(())
}

/// Build the remote cache URL from the `TC_CACHE_*` family.
fn cache_url<F>(env: &Env<F>, host: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let scheme = env
        .raw("TC_CACHE_SCHEME")
        .unwrap_or_else(|| "postgres".to_string());
    let database = env
        .raw("TC_CACHE_DATABASE")
        .unwrap_or_else(|| "tollgate".to_string());
    if scheme == "sqlite" {
        return Ok(format!("sqlite:{database}"));
    }

    let credentials = match (env.raw("TC_CACHE_USER"), env.raw("TC_CACHE_PASSWORD")) {
        (Some(user), Some(password)) => format!("{user}:{password}@"),
        (Some(user), None) => format!("{user}@"),
        _ => String::new(),
    };
    let port = env
        .parse::<u16>("TC_CACHE_PORT")?
        .map(|p| format!(":{p}"))
        .unwrap_or_default();

    Ok(format!("{scheme}://{credentials}{host}{port}/{database}"))
}
