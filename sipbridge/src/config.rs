//! Environment configuration surface.
//!
//! Every knob arrives as an environment variable; numeric values are
//! clamped parse-style: anything invalid or out of range falls back
//! to the default.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use util::{DnsResolver, split_hostport};

use crate::error::{Error, Result};
use crate::parser::SIP_PORT;

/// Environment variable names.
pub mod env {
    pub const AS_SIP_UDP: &str = "as_sip_udp";
    pub const SERVER_IPV4: &str = "server_ipv4";
    pub const AUTO_SERVER_IPV4: &str = "auto_server_ipv4";
    pub const SIP_UDP_PORT: &str = "sip_udp_port";
    pub const HTTP_PORT: &str = "http_port";
    pub const KA_INTERVAL: &str = "ka_interval";
    pub const INDIALOGUE_INTERVAL: &str = "indialogue_interval";
    pub const PROXY_UDP_SERVER: &str = "proxy_udp_server";
    pub const RATE_LIMIT: &str = "rate_limit";
}

/// Default out-of-dialog probing period in seconds.
pub const OOD_PROBING_SEC: i64 = 30;

/// Default in-dialog probing period in seconds.
pub const ID_PROBING_SEC: i64 = 120;

/// Media relay port range.
pub const MEDIA_START_PORT: u16 = 10000;
pub const MEDIA_END_PORT: u16 = 19999;

/// Resolved startup configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The application server all calls route to; `None` switches the
    /// stack to its internal routing engine.
    pub as_sip: Option<SocketAddr>,
    pub server_ipv4: IpAddr,
    pub sip_udp_port: u16,
    pub http_port: u16,
    /// Out-of-dialog UA probing period, seconds.
    pub ka_interval: u64,
    /// In-dialog probing period, seconds.
    pub indialogue_interval: u64,
    /// Set when a custom in-dialog interval was provided (load-test
    /// mode: INVITEs are answered immediately without routing).
    pub sipp_testing: bool,
    pub proxy: Option<SocketAddr>,
    pub rate_limit: i64,
    pub media_start_port: u16,
    pub media_end_port: u16,
    /// Directory holding `rdb.json` and the CDR files.
    pub data_dir: PathBuf,
}

impl Config {
    /// Reads and validates the environment.
    pub async fn from_env(resolver: &DnsResolver) -> Result<Config> {
        let as_sip = match std::env::var(env::AS_SIP_UDP) {
            Ok(value) => Some(resolve_udp(&value, resolver).await.map_err(|err| {
                Error::Config(format!("error resolving AS UDP address {:?}: {}", value, err))
            })?),
            Err(_) => {
                tracing::warn!("no AS address provided - switching to internal routing engine");
                None
            }
        };

        let server_ipv4 = match std::env::var(env::SERVER_IPV4) {
            Ok(value) => value
                .parse()
                .map_err(|_| Error::Config(format!("bad {}: {:?}", env::SERVER_IPV4, value)))?,
            Err(_) => {
                if std::env::var(env::AUTO_SERVER_IPV4).is_err() {
                    return Err(Error::Config(
                        "no self IPv4 address provided and 'auto_server_ipv4' not specified".into(),
                    ));
                }
                local_ip_address::local_ip()
                    .map_err(|err| Error::Config(format!("cannot auto-detect IPv4: {}", err)))?
            }
        };

        let (sip_udp_port, _) =
            parse_clamped(&std::env::var(env::SIP_UDP_PORT).unwrap_or_default(), 5060, 5000, 6000);
        let (http_port, _) =
            parse_clamped(&std::env::var(env::HTTP_PORT).unwrap_or_default(), 8080, 80, 9080);

        let (ka_interval, explicit) = parse_clamped(
            &std::env::var(env::KA_INTERVAL).unwrap_or_default(),
            OOD_PROBING_SEC,
            5,
            9_999_999,
        );
        if explicit {
            tracing::info!(ka_interval, "setting KeepAlive interval");
        } else {
            tracing::warn!(ka_interval, "setting default KeepAlive interval");
        }

        let (indialogue_interval, sipp_testing) = match std::env::var(env::INDIALOGUE_INTERVAL) {
            Ok(value) => {
                let (interval, ok) = parse_clamped(&value, ID_PROBING_SEC, 1, 9_999_999);
                if ok {
                    tracing::info!(
                        interval,
                        "custom in-dialogue probing provided - SIPp testing mode activated"
                    );
                }
                (interval, ok)
            }
            Err(_) => (ID_PROBING_SEC, false),
        };

        let proxy = match std::env::var(env::PROXY_UDP_SERVER) {
            Ok(value) if !value.is_empty() => match resolve_udp(&value, resolver).await {
                Ok(addr) => {
                    tracing::info!(%addr, "proxy UDP server provided - proxy mode activated");
                    Some(addr)
                }
                Err(err) => {
                    tracing::warn!(%err, value, "bad proxy UDP server specified - ignored");
                    None
                }
            },
            _ => None,
        };

        let (rate_limit, _) =
            parse_clamped(&std::env::var(env::RATE_LIMIT).unwrap_or_default(), -1, -1, 1_000_000);

        Ok(Config {
            as_sip,
            server_ipv4,
            sip_udp_port: sip_udp_port as u16,
            http_port: http_port as u16,
            ka_interval: ka_interval as u64,
            indialogue_interval: indialogue_interval as u64,
            sipp_testing,
            proxy,
            rate_limit,
            media_start_port: MEDIA_START_PORT,
            media_end_port: MEDIA_END_PORT,
            data_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        })
    }

    /// A localhost configuration for tests.
    pub fn for_tests() -> Config {
        Config {
            as_sip: None,
            server_ipv4: "127.0.0.1".parse().expect("loopback"),
            sip_udp_port: 0,
            http_port: 0,
            ka_interval: 3600,
            indialogue_interval: 0,
            sipp_testing: false,
            proxy: None,
            rate_limit: -1,
            media_start_port: 0,
            media_end_port: 0,
            data_dir: std::env::temp_dir(),
        }
    }
}

async fn resolve_udp(hostport: &str, resolver: &DnsResolver) -> std::io::Result<SocketAddr> {
    let (host, port) = split_hostport(hostport, SIP_PORT)?;
    let ip = resolver.resolve(host).await?;
    Ok(SocketAddr::new(ip, port))
}

/// Parses an integer with a default and inclusive bounds. Returns the
/// value plus whether the input was a valid in-range number; anything
/// else yields `(default, false)`.
pub fn parse_clamped(input: &str, default: i64, min: i64, max: i64) -> (i64, bool) {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return (default, false);
    }
    match trimmed.parse::<i64>() {
        Ok(n) if (min..=max).contains(&n) => (n, true),
        _ => (default, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_parse_covers_the_boundaries() {
        let cases = [
            ("123", 123, true),
            ("-", 0, false),
            ("-0", 0, true),
            ("+50", 50, true),
            ("-123", 0, false),
            ("abc", 0, false),
            ("", 0, false),
            ("99", 99, true),
            ("-300", 0, false),
            ("0", 0, true),
            ("499", 499, true),
            ("500", 500, true),
            ("501", 0, false),
        ];
        for (input, expected, valid) in cases {
            assert_eq!(parse_clamped(input, 0, 0, 500), (expected, valid), "input {:?}", input);
        }
    }

    #[test]
    fn port_clamps_fall_back_to_default() {
        assert_eq!(parse_clamped("4999", 5060, 5000, 6000), (5060, false));
        assert_eq!(parse_clamped("6001", 5060, 5000, 6000), (5060, false));
        assert_eq!(parse_clamped("5555", 5060, 5000, 6000), (5555, true));
    }
}
