//! CLI override definitions and application logic.

use clap::Parser;

use crate::Config;
use crate::types::Mode;

#[derive(Debug, Clone, Parser, Default)]
pub struct CliOverrides {
    /// Override the component to run (proxy, controller, standalone)
    #[arg(long)]
    pub mode: Option<Mode>,
    /// Override proxy listen host
    #[arg(long)]
    pub listen_host: Option<String>,
    /// Override proxy listen port
    #[arg(long)]
    pub listen_port: Option<u16>,
    /// Override database URL (users, plans, bus, remote cache)
    #[arg(long)]
    pub database_url: Option<String>,
    /// Override metrics listen address
    #[arg(long)]
    pub metrics_listen: Option<String>,
    /// Override log level (trace/debug/info/warn/error)
    #[arg(long)]
    pub log_level: Option<String>,
    /// Disable egress address binding
    #[arg(long)]
    pub no_egress: bool,
}

pub fn apply_overrides(config: &mut Config, overrides: &CliOverrides) {
    if let Some(v) = overrides.mode {
        config.mode = v;
    }
    if let Some(v) = &overrides.listen_host {
        config.proxy.listen_host = v.clone();
    }
    if let Some(v) = overrides.listen_port {
        config.proxy.listen_port = v;
    }
    if let Some(v) = &overrides.database_url {
        config.database.url = Some(v.clone());
    }
    if let Some(v) = &overrides.metrics_listen {
        config.metrics.listen = Some(v.clone());
    }
    if let Some(v) = &overrides.log_level {
        config.logging.level = Some(v.clone());
    }
    if overrides.no_egress {
        config.egress.enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_applies() {
        let overrides = CliOverrides::parse_from([
            "tollgate",
            "--mode",
            "proxy",
            "--listen-port",
            "3128",
            "--log-level",
            "debug",
            "--no-egress",
        ]);
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &overrides);
        assert_eq!(cfg.mode, Mode::Proxy);
        assert_eq!(cfg.proxy.listen_port, 3128);
        assert_eq!(cfg.logging.level.as_deref(), Some("debug"));
        assert!(!cfg.egress.enabled);
    }

    #[test]
    fn empty_overrides_change_nothing() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &CliOverrides::default());
        assert_eq!(cfg.proxy.listen_port, 8080);
        assert!(cfg.metrics.listen.is_none());
    }
}
