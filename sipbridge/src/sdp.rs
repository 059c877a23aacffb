//! Minimal SDP handling.
//!
//! The stack needs four things from SDP: the peer's media endpoint, a
//! way to re-anchor the connection on a local relay socket, a
//! symmetric answer for the echo responder, and hold detection.
//! Everything else in the session description is carried through
//! untouched.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, SipParseError};

/// Audio payload types the echo responder answers with.
const SUPPORTED_PAYLOADS: [&str; 3] = ["0", "8", "101"];

/// One `m=` section with its attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaLine {
    pub kind: String,
    pub port: u16,
    pub proto: String,
    pub formats: Vec<String>,
    pub connection: Option<String>,
    pub attributes: Vec<String>,
}

impl MediaLine {
    fn has_direction(&self, dir: &str) -> bool {
        self.attributes.iter().any(|a| a == dir)
    }
}

/// A parsed session description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpSession {
    pub origin_user: String,
    pub session_id: i64,
    pub session_version: i64,
    pub origin_addr: String,
    pub session_name: String,
    pub connection: Option<String>,
    pub attributes: Vec<String>,
    pub media: Vec<MediaLine>,
}

impl SdpSession {
    pub fn parse(input: &str) -> Result<Self> {
        let mut session = SdpSession {
            session_name: "-".into(),
            ..Default::default()
        };
        let mut saw_version = false;

        for line in input.lines() {
            let line = line.trim_end_matches('\r');
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "v" => {
                    if value.trim() != "0" {
                        return Err(SipParseError::new("unsupported SDP version").into());
                    }
                    saw_version = true;
                }
                "o" => {
                    let mut it = value.split_ascii_whitespace();
                    session.origin_user = it.next().unwrap_or("-").to_string();
                    session.session_id = it.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    session.session_version = it.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    session.origin_addr = it.nth(2).unwrap_or_default().to_string();
                }
                "s" => session.session_name = value.to_string(),
                "c" => {
                    let addr = value.split_ascii_whitespace().nth(2).map(str::to_string);
                    match session.media.last_mut() {
                        Some(media) => media.connection = addr,
                        None => session.connection = addr,
                    }
                }
                "m" => {
                    let mut it = value.split_ascii_whitespace();
                    let kind = it.next().unwrap_or_default().to_string();
                    let port = it.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    let proto = it.next().unwrap_or_default().to_string();
                    let formats = it.map(str::to_string).collect();
                    session.media.push(MediaLine {
                        kind,
                        port,
                        proto,
                        formats,
                        connection: None,
                        attributes: Vec::new(),
                    });
                }
                "a" => match session.media.last_mut() {
                    Some(media) => media.attributes.push(value.to_string()),
                    None => session.attributes.push(value.to_string()),
                },
                _ => {}
            }
        }

        if !saw_version || session.media.is_empty() {
            return Err(SipParseError::new("not a usable session description").into());
        }
        Ok(session)
    }

    fn audio(&self) -> Option<&MediaLine> {
        self.media.iter().find(|m| m.kind == "audio")
    }

    /// The peer's audio endpoint: media-level connection wins over the
    /// session-level one.
    pub fn media_endpoint(&self) -> Option<SocketAddr> {
        let audio = self.audio()?;
        let addr = audio.connection.as_deref().or(self.connection.as_deref())?;
        let ip: IpAddr = addr.parse().ok()?;
        (audio.port > 0).then(|| SocketAddr::new(ip, audio.port))
    }

    /// Re-anchors the audio connection on `local` (media steering).
    pub fn rewrite_connection(&mut self, local: SocketAddr) {
        self.connection = Some(local.ip().to_string());
        self.origin_addr = local.ip().to_string();
        for media in &mut self.media {
            media.connection = None;
            if media.kind == "audio" {
                media.port = local.port();
            }
        }
    }

    /// An offer on hold either mutes the stream or turns it inactive.
    pub fn is_hold(&self) -> bool {
        let session_hold = self.attributes.iter().any(|a| a == "sendonly" || a == "inactive");
        let media_hold = self
            .audio()
            .is_some_and(|m| m.has_direction("sendonly") || m.has_direction("inactive"));
        session_hold || media_hold
    }

    /// Builds the symmetric echo answer anchored at `local`.
    ///
    /// Returns the answer plus whether the offer held the call; `None`
    /// when the offer shares no supported audio codec.
    pub fn build_echo_answer(&self, local: SocketAddr) -> Option<(SdpSession, bool)> {
        let offer_audio = self.audio()?;
        let formats: Vec<String> = offer_audio
            .formats
            .iter()
            .filter(|f| SUPPORTED_PAYLOADS.contains(&f.as_str()))
            .cloned()
            .collect();
        if formats.iter().all(|f| f == "101") || formats.is_empty() {
            return None;
        }

        let held = self.is_hold();
        let direction = if offer_audio.has_direction("inactive") || self.attributes.iter().any(|a| a == "inactive") {
            "inactive"
        } else if held {
            "recvonly"
        } else {
            "sendrecv"
        };

        let mut attributes: Vec<String> = offer_audio
            .attributes
            .iter()
            .filter(|a| {
                let keep = a.starts_with("rtpmap:") || a.starts_with("fmtp:") || a.starts_with("ptime");
                keep && formats.iter().any(|f| {
                    a.strip_prefix("rtpmap:")
                        .or_else(|| a.strip_prefix("fmtp:"))
                        .map_or(true, |rest| rest.split_ascii_whitespace().next() == Some(f.as_str()))
                })
            })
            .cloned()
            .collect();
        attributes.push(direction.to_string());

        let answer = SdpSession {
            origin_user: "sipbridge".into(),
            session_id: 0,
            session_version: 0,
            origin_addr: local.ip().to_string(),
            session_name: "echo".into(),
            connection: Some(local.ip().to_string()),
            attributes: Vec::new(),
            media: vec![MediaLine {
                kind: "audio".into(),
                port: local.port(),
                proto: offer_audio.proto.clone(),
                formats,
                connection: None,
                attributes,
            }],
        };
        Some((answer, held))
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} {} {} IN IP4 {}\r\n",
            if self.origin_user.is_empty() { "-" } else { &self.origin_user },
            self.session_id,
            self.session_version,
            self.origin_addr
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(conn) = &self.connection {
            write!(f, "c=IN IP4 {}\r\n", conn)?;
        }
        write!(f, "t=0 0\r\n")?;
        for attr in &self.attributes {
            write!(f, "a={}\r\n", attr)?;
        }
        for media in &self.media {
            write!(f, "m={} {} {} {}\r\n", media.kind, media.port, media.proto, media.formats.join(" "))?;
            if let Some(conn) = &media.connection {
                write!(f, "c=IN IP4 {}\r\n", conn)?;
            }
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=caller 123 1 IN IP4 192.0.2.4\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.4\r\n\
        t=0 0\r\n\
        m=audio 40000 RTP/AVP 0 8 96 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:96 opus/48000/2\r\n\
        a=rtpmap:101 telephone-event/8000\r\n";

    #[test]
    fn parses_and_exposes_media_endpoint() {
        let sdp = SdpSession::parse(OFFER).unwrap();
        assert_eq!(sdp.media_endpoint(), Some("192.0.2.4:40000".parse().unwrap()));
        assert_eq!(sdp.session_id, 123);
        assert!(!sdp.is_hold());
    }

    #[test]
    fn rewrite_moves_the_anchor() {
        let mut sdp = SdpSession::parse(OFFER).unwrap();
        sdp.rewrite_connection("10.0.0.9:30002".parse().unwrap());
        assert_eq!(sdp.media_endpoint(), Some("10.0.0.9:30002".parse().unwrap()));
        let text = sdp.to_string();
        assert!(text.contains("c=IN IP4 10.0.0.9"));
        assert!(text.contains("m=audio 30002"));
    }

    #[test]
    fn echo_answer_keeps_supported_codecs_only() {
        let sdp = SdpSession::parse(OFFER).unwrap();
        let (answer, held) = sdp.build_echo_answer("10.0.0.9:30002".parse().unwrap()).unwrap();
        assert!(!held);
        assert_eq!(answer.media[0].formats, vec!["0", "8", "101"]);
        assert!(answer.media[0].attributes.iter().any(|a| a == "sendrecv"));
        assert!(answer.media[0].attributes.iter().all(|a| !a.contains("opus")));
    }

    #[test]
    fn echo_answer_rejects_unsupported_offer() {
        let offer = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=-\r\nc=IN IP4 1.2.3.4\r\nt=0 0\r\nm=audio 5000 RTP/AVP 96\r\n";
        let sdp = SdpSession::parse(offer).unwrap();
        assert!(sdp.build_echo_answer("10.0.0.9:30002".parse().unwrap()).is_none());
    }

    #[test]
    fn hold_offer_is_detected_and_mirrored() {
        let offer = format!("{}a=sendonly\r\n", OFFER);
        let sdp = SdpSession::parse(&offer).unwrap();
        assert!(sdp.is_hold());
        let (answer, held) = sdp.build_echo_answer("10.0.0.9:30002".parse().unwrap()).unwrap();
        assert!(held);
        assert!(answer.media[0].attributes.iter().any(|a| a == "recvonly"));
    }

    #[test]
    fn media_level_connection_wins() {
        let offer = "v=0\r\no=- 1 1 IN IP4 1.1.1.1\r\ns=-\r\nc=IN IP4 1.1.1.1\r\nt=0 0\r\nm=audio 5000 RTP/AVP 0\r\nc=IN IP4 2.2.2.2\r\n";
        let sdp = SdpSession::parse(offer).unwrap();
        assert_eq!(sdp.media_endpoint(), Some("2.2.2.2:5000".parse().unwrap()));
    }

    #[test]
    fn round_trip_is_stable() {
        let sdp = SdpSession::parse(OFFER).unwrap();
        let again = SdpSession::parse(&sdp.to_string()).unwrap();
        assert_eq!(sdp, again);
    }
}
