//! Instrument targets given on the command line.
//!
//! A target is either a USBTMC device node (`/dev/usbtmc0`) or a TCP endpoint
//! (`192.168.1.50`, `bench-psu:5025`). [`open_transport`] turns one into a
//! boxed [`Transport`] configured from [`BenchConfig`], optionally wrapped in a
//! [`LoggingTransport`].

use crate::config::BenchConfig;
use crate::error::DaqError;
use crate::transport::{
    LoggingTransport, OneShotTcpTransport, PersistentTcpTransport, ProtocolLog, Transport,
    UsbTmcTransport,
};
use std::fmt;
use std::path::PathBuf;

/// Where an instrument lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Linux usbtmc character device.
    UsbTmc(PathBuf),
    /// SCPI raw socket.
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl Target {
    /// Parse `text`, using `default_port` when a TCP target has none.
    ///
    /// Anything starting with `/dev/` or naming a `usbtmc*` node is a device
    /// path. Bracketed IPv6 (`[::1]:5025`) is accepted.
    pub fn parse(text: &str, default_port: u16) -> Result<Self, DaqError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DaqError::Configuration("empty instrument target".into()));
        }

        let is_device = text.starts_with("/dev/")
            || PathBuf::from(text)
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("usbtmc"))
                .unwrap_or(false);
        if is_device {
            return Ok(Target::UsbTmc(PathBuf::from(text)));
        }

        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                DaqError::Configuration(format!("unterminated IPv6 address in target '{}'", text))
            })?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => {
                    return Err(DaqError::Configuration(format!(
                        "unexpected text after address in target '{}'",
                        text
                    )))
                }
            }
        } else {
            match text.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                // Bare IPv6 without brackets.
                Some(_) => (text, None),
                None => (text, None),
            }
        };

        if host.is_empty() {
            return Err(DaqError::Configuration(format!(
                "missing host in target '{}'",
                text
            )));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(|| {
                DaqError::Configuration(format!("invalid port '{}' in target '{}'", p, text))
            })?,
            None => default_port,
        };

        Ok(Target::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::UsbTmc(path) => write!(f, "{}", path.display()),
            Target::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Target::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// How to reach one instrument.
#[derive(Clone)]
pub struct TransportOptions<'a> {
    /// Bench settings (timeouts, backoff, sysfs root).
    pub config: &'a BenchConfig,
    /// Reconnect for every TCP command instead of holding one socket.
    pub tcp_oneshot: bool,
    /// Protocol log shared by every instrument of the run.
    pub log: Option<ProtocolLog>,
}

/// Build the transport for `target`. Nothing is opened yet; every transport
/// connects lazily on first use.
///
/// `role` names the instrument in the protocol log (`psu`, `dmm`, `scope`).
pub fn open_transport(
    target: &Target,
    role: &str,
    options: &TransportOptions<'_>,
) -> Box<dyn Transport> {
    let config = options.config;
    let transport: Box<dyn Transport> = match target {
        Target::UsbTmc(path) => Box::new(
            UsbTmcTransport::new(path)
                .with_timeout(config.usbtmc.timeout)
                .with_inter_query_delay(config.usbtmc.inter_query_delay)
                .with_sysfs_root(&config.usbtmc.sysfs_root),
        ),
        Target::Tcp { host, port } if options.tcp_oneshot => Box::new(
            OneShotTcpTransport::new(host.clone(), *port)
                .with_timeout(config.tcp.timeout)
                .with_connect_backoff(config.tcp.oneshot_backoff),
        ),
        Target::Tcp { host, port } => Box::new(
            PersistentTcpTransport::new(host.clone(), *port).with_timeout(config.tcp.timeout),
        ),
    };

    match &options.log {
        Some(log) => Box::new(LoggingTransport::new(transport, role, log.clone())),
        None => transport,
    }
}
