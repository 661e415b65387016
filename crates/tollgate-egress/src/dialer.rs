//! Outbound TCP connector with an optional fixed source address.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream};
use tollgate_core::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_TCP_KEEPALIVE_SECS, DEFAULT_TCP_NO_DELAY,
};
use tracing::trace;

use crate::error::EgressError;

/// Socket options applied to every outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    pub no_delay: bool,
    /// `None` disables keepalive probes.
    pub keepalive: Option<Duration>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            no_delay: DEFAULT_TCP_NO_DELAY,
            keepalive: Some(Duration::from_secs(DEFAULT_TCP_KEEPALIVE_SECS)),
        }
    }
}

/// Establishes outbound connections, bound to `local_ip` when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialer {
    local_ip: Option<IpAddr>,
    options: DialOptions,
}

impl Dialer {
    /// Dialer bound to `ip`.
    pub fn bound(ip: IpAddr, options: DialOptions) -> Self {
        Self {
            local_ip: Some(ip),
            options,
        }
    }

    /// Dialer with no source-address preference.
    pub fn system(options: DialOptions) -> Self {
        Self {
            local_ip: None,
            options,
        }
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    pub fn options(&self) -> &DialOptions {
        &self.options
    }

    /// Resolve `host` and connect to the first address that answers.
    ///
    /// A bound dialer only tries addresses of its own family.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, EgressError> {
        let target = format!("{host}:{port}");
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| EgressError::Resolve(target.clone()))?
            .filter(|addr| {
                self.local_ip
                    .is_none_or(|ip| ip.is_ipv4() == addr.is_ipv4())
            })
            .collect();

        let mut last_err = EgressError::Resolve(target.clone());
        for addr in candidates {
            match tokio::time::timeout(self.options.connect_timeout, self.connect_addr(addr)).await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    trace!(%addr, error = %e, "connect attempt failed");
                    last_err = EgressError::Io(e);
                }
                Err(_) => last_err = EgressError::Timeout(target.clone()),
            }
        }
        Err(last_err)
    }

    /// Connect to an already resolved address.
    pub async fn connect_addr(&self, target: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = self.local_ip {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        let stream = socket.connect(target).await?;
        stream.set_nodelay(self.options.no_delay)?;
        if let Some(idle) = self.options.keepalive {
            SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(stream)
    }
}
