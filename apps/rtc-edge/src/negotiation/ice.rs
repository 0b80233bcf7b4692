//! Conversion of resolved ICE servers into peer-connection configuration.

use crate::peer::{IceServerConfig, PeerError};
use crate::protocol::IceServer;

/// One entry per URL. Servers carrying a username are relays (`turn:`, or
/// `turns:` when the URL asked for TLS); everything else is `stun:`. The
/// fallback STUN server is always appended last.
pub fn peer_ice_servers(
    servers: &[IceServer],
    fallback_stun: &str,
) -> Result<Vec<IceServerConfig>, PeerError> {
    let mut out = Vec::new();
    for server in servers {
        let username = server.username.as_deref().filter(|name| !name.is_empty());
        for url in &server.urls {
            let (secure, authority) = strip_scheme(url);
            check_authority(url, authority)?;
            let scheme = match (username, secure) {
                (Some(_), true) => "turns",
                (Some(_), false) => "turn",
                (None, _) => "stun",
            };
            out.push(IceServerConfig {
                url: format!("{scheme}:{authority}"),
                username: username.map(str::to_owned),
                credential: username.and(server.credential.clone()),
            });
        }
    }
    out.push(IceServerConfig {
        url: fallback_stun.to_owned(),
        username: None,
        credential: None,
    });
    Ok(out)
}

fn strip_scheme(url: &str) -> (bool, &str) {
    if let Some(rest) = url.strip_prefix("turns:") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("turn:").or_else(|| url.strip_prefix("stun:")) {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("stuns:") {
        (false, rest)
    } else {
        (false, url)
    }
}

/// `host[:port][?transport=udp|tcp]`
fn check_authority(url: &str, authority: &str) -> Result<(), PeerError> {
    let invalid = |reason: &str| PeerError::Configuration(format!("{url}: {reason}"));
    let (address, query) = match authority.split_once('?') {
        Some((address, query)) => (address, Some(query)),
        None => (authority, None),
    };
    if let Some(query) = query {
        if !matches!(query, "transport=udp" | "transport=tcp") {
            return Err(invalid("unsupported query"));
        }
    }
    let host = match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
            host
        }
        _ => address,
    };
    if host.is_empty() || host.contains(char::is_whitespace) || host.contains('@') {
        return Err(invalid("invalid host"));
    }
    Ok(())
}
