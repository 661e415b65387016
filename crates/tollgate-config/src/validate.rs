//! Configuration validation logic.

use crate::Config;
use crate::loader::ConfigError;
use crate::types::BusTransport;

const OFFSET_RESET_POLICIES: [&str; 6] =
    ["earliest", "smallest", "beginning", "latest", "largest", "end"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];
const LOG_OUTPUTS: [&str; 2] = ["stdout", "stderr"];

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let proxy = &config.proxy;
    if proxy.listen_host.trim().is_empty() {
        return Err(ConfigError::Validation("proxy.listen_host is empty".into()));
    }
    if proxy.listen_port == 0 {
        return Err(ConfigError::Validation("proxy.listen_port must be > 0".into()));
    }
    if proxy.connection_backlog == 0 {
        return Err(ConfigError::Validation(
            "proxy.connection_backlog must be > 0".into(),
        ));
    }
    if proxy.max_connections == 0 {
        return Err(ConfigError::Validation(
            "proxy.max_connections must be > 0".into(),
        ));
    }
    if proxy.tcp_idle_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "proxy.tcp_idle_timeout_secs must be > 0".into(),
        ));
    }
    if proxy.connect_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "proxy.connect_timeout_secs must be > 0".into(),
        ));
    }
    if proxy.max_header_bytes < 1024 {
        return Err(ConfigError::Validation(
            "proxy.max_header_bytes must be >= 1024".into(),
        ));
    }
    if proxy.relay_buffer_size < 1024 || proxy.relay_buffer_size > 1024 * 1024 {
        return Err(ConfigError::Validation(
            "proxy.relay_buffer_size must be 1024..=1MB".into(),
        ));
    }
    if proxy.read_buffer_size == 0 {
        return Err(ConfigError::Validation(
            "proxy.read_buffer_size must be > 0".into(),
        ));
    }

    if config.auth.validate_ttl_ms == 0 {
        return Err(ConfigError::Validation(
            "auth.validate_ttl_ms must be > 0".into(),
        ));
    }
    for user in &config.auth.users {
        if user.username.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "auth.users[{}]: username is empty",
                user.id
            )));
        }
        if user.password.is_some() == user.password_hash.is_some() {
            return Err(ConfigError::Validation(format!(
                "auth.users '{}': set exactly one of password or password_hash",
                user.username
            )));
        }
    }

    if config.egress.rotation_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "egress.rotation_ttl_secs must be > 0".into(),
        ));
    }
    if config.egress.resolve_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "egress.resolve_interval_secs must be > 0".into(),
        ));
    }
    for ip in &config.egress.static_ips {
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "egress.static_ips: invalid address '{ip}'"
            )));
        }
    }

    if config.traffic.threshold_bytes == 0 {
        return Err(ConfigError::Validation(
            "traffic.threshold_bytes must be > 0".into(),
        ));
    }
    if config.traffic.interval_secs == 0 {
        return Err(ConfigError::Validation(
            "traffic.interval_secs must be > 0".into(),
        ));
    }

    if config.rate_limit.enabled {
        let rl = config.rate_limit.resolve();
        if rl.capacity_bytes == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.capacity_mb must be > 0".into(),
            ));
        }
        if rl.fill_rate_bytes_per_sec == 0 {
            return Err(ConfigError::Validation(
                "rate_limit fill rate must be > 0".into(),
            ));
        }
        if rl.max_connections == 0 {
            return Err(ConfigError::Validation(
                "rate_limit max connections must be > 0".into(),
            ));
        }
        if rl.shard_count == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.shard_count must be > 0".into(),
            ));
        }
        if rl.cleanup_interval.is_zero() {
            return Err(ConfigError::Validation(
                "rate_limit.cleanup_interval_secs must be > 0".into(),
            ));
        }
    }

    for ctx in ["PROXY", "PLAN", "BILLING", "USERS"] {
        let Some(bus) = config.bus.context(ctx) else {
            continue;
        };
        let policy = bus.auto_offset_reset.trim().to_ascii_lowercase();
        if !OFFSET_RESET_POLICIES.contains(&policy.as_str()) {
            return Err(ConfigError::Validation(format!(
                "bus.{}.auto_offset_reset must be one of: {:?}",
                ctx.to_ascii_lowercase(),
                OFFSET_RESET_POLICIES
            )));
        }
    }
    if config.bus.transport == BusTransport::Sql {
        for ctx in config.mode.bus_contexts() {
            let bootstrap = config
                .bus
                .context(ctx)
                .and_then(|b| b.bootstrap_servers.as_deref())
                .or(config.database.url.as_deref())
                .unwrap_or("");
            if bootstrap.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "bus.{}.bootstrap_servers is required in {} mode",
                    ctx.to_ascii_lowercase(),
                    config.mode
                )));
            }
        }
    } else if !matches!(config.mode, crate::Mode::Standalone) {
        return Err(ConfigError::Validation(format!(
            "the memory bus cannot connect separate processes; use the sql transport in {} mode",
            config.mode
        )));
    }

    if let Some(format) = config.logging.format.as_deref()
        && !LOG_FORMATS.contains(&format)
    {
        return Err(ConfigError::Validation(format!(
            "logging.format must be one of: {LOG_FORMATS:?}"
        )));
    }
    if let Some(output) = config.logging.output.as_deref()
        && !LOG_OUTPUTS.contains(&output)
    {
        return Err(ConfigError::Validation(format!(
            "logging.output must be one of: {LOG_OUTPUTS:?}"
        )));
    }

    Ok(())
}
