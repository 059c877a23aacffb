//! Splitting of `host[:port]` strings.

use std::io;

/// Splits a `host[:port]` string, falling back to `default_port`
/// when no port is present.
///
/// A port of `0` is rejected; the host part may be a name, an IPv4
/// literal or a bracketed IPv6 literal.
pub fn split_hostport(input: &str, default_port: u16) -> Result<(&str, u16), io::Error> {
    let input = input.trim();
    if input.is_empty() {
        return Err(io::Error::other("empty hostport"));
    }

    let (host, port) = match input.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no brackets.
        Some((h, p)) if !h.contains(':') || h.starts_with('[') => {
            let port: u16 = p
                .parse()
                .map_err(|_| io::Error::other(format!("bad port in {:?}", input)))?;
            (h.trim_end_matches(']').trim_start_matches('['), port)
        }
        _ => (input, default_port),
    };

    if port == 0 {
        return Err(io::Error::other(format!("port 0 in {:?}", input)));
    }
    Ok((host, port))
}
