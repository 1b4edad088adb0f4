//! Backend annotations
//!
//! Pods and Nodes request port mappings through annotations; the controller
//! writes the outcome back as JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clb_binding::PortEntry;

/// Port mapping request, one line per port
pub const PORT_MAPPING: &str = "networking.clb.io/port-mapping";

/// `"true"` or `"false"`; mapping is on by default
pub const ENABLE_PORT_MAPPING: &str = "networking.clb.io/enable-port-mapping";

/// JSON array of [`PortMappingResult`]
pub const PORT_MAPPING_RESULT: &str = "networking.clb.io/port-mapping-result";

/// Line option selecting same-port allocation
pub const USE_SAME_PORT_OPTION: &str = "useSamePortAcrossPools";

/// Line option prefix naming a certificate secret
pub const CERT_SECRET_OPTION: &str = "certSecretName=";

const PROTOCOLS: [&str; 5] = ["TCP", "UDP", "TCPUDP", "TCP_SSL", "QUIC"];

/// Malformed port mapping annotation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    /// Fewer than three fields on a line
    #[error("line {line}: expected `<port> <protocol> <pools>`, got {content:?}")]
    MissingField {
        /// 1-based line number
        line: usize,
        /// Offending line
        content: String,
    },

    /// Port is not a number in 1..=65535
    #[error("line {line}: invalid port {value:?}")]
    InvalidPort {
        /// 1-based line number
        line: usize,
        /// Offending value
        value: String,
    },

    /// Protocol not supported
    #[error("line {line}: invalid protocol {value:?}")]
    InvalidProtocol {
        /// 1-based line number
        line: usize,
        /// Offending value
        value: String,
    },

    /// Empty pool name in the pool list
    #[error("line {line}: empty pool name")]
    EmptyPool {
        /// 1-based line number
        line: usize,
    },

    /// Unrecognised trailing option
    #[error("line {line}: unknown option {value:?}")]
    UnknownOption {
        /// 1-based line number
        line: usize,
        /// Offending value
        value: String,
    },

    /// Enable flag is neither `true` nor `false`
    #[error("invalid networking.clb.io/enable-port-mapping value {0:?}")]
    InvalidEnableFlag(String),
}

/// Parses the port mapping annotation into binding spec entries.
///
/// ```text
/// # game traffic
/// 7777 TCPUDP pool-a,pool-b useSamePortAcrossPools
/// 443 TCP_SSL pool-a certSecretName=game-cert
/// ```
pub fn parse_port_mapping(value: &str) -> Result<Vec<PortEntry>, AnnotationError> {
    let mut entries = Vec::new();
    for (idx, raw) in value.lines().enumerate() {
        let line = idx + 1;
        let content = raw.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = content.split_whitespace().collect();
        let [port, protocol, pools, options @ ..] = fields.as_slice() else {
            return Err(AnnotationError::MissingField {
                line,
                content: content.to_string(),
            });
        };

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| AnnotationError::InvalidPort {
                line,
                value: (*port).to_string(),
            })?;

        let protocol = protocol.to_ascii_uppercase();
        if !PROTOCOLS.contains(&protocol.as_str()) {
            return Err(AnnotationError::InvalidProtocol { line, value: protocol });
        }

        let pools: Vec<String> = pools.split(',').map(|p| p.trim().to_string()).collect();
        if pools.iter().any(String::is_empty) {
            return Err(AnnotationError::EmptyPool { line });
        }

        let mut entry = PortEntry {
            port,
            protocol,
            pools,
            use_same_port_across_pools: None,
            cert_secret_name: None,
        };
        for option in options {
            if *option == USE_SAME_PORT_OPTION {
                entry.use_same_port_across_pools = Some(true);
            } else if let Some(name) = option.strip_prefix(CERT_SECRET_OPTION).filter(|n| !n.is_empty()) {
                entry.cert_secret_name = Some(name.to_string());
            } else {
                return Err(AnnotationError::UnknownOption {
                    line,
                    value: (*option).to_string(),
                });
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Reads the enable flag; a missing flag means enabled.
pub fn parse_enable_flag(value: Option<&str>) -> Result<bool, AnnotationError> {
    match value.map(str::trim) {
        None => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(v) => Err(AnnotationError::InvalidEnableFlag(v.to_string())),
    }
}

/// One bound listener, as reported on the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingResult {
    /// Backend port
    pub port: u16,
    /// Listener protocol
    pub protocol: String,
    /// Pool the port came from
    pub pool: String,
    /// Load balancer region
    pub region: String,
    /// Load balancer ID
    pub load_balancer_id: String,
    /// Load balancer port
    pub load_balancer_port: u16,
    /// Last port of a segment listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_end_port: Option<u16>,
    /// Listener ID
    pub listener_id: String,
    /// Load balancer VIPs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    /// Load balancer domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// `host:port` clients should connect to
    pub address: String,
}
