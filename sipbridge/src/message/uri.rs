/// Decomposed INVITE Request-URI.
///
/// Grammar handled here:
/// `scheme:userpart[;user-params][:password]@host[:port][;uri-params][?headers]`
///
/// The userpart is matched with visual separators stripped but the
/// original spelling is retained for rebuilding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestUri {
    pub scheme: String,
    pub original_userpart: String,
    pub userpart: String,
    pub user_params: Vec<(String, Option<String>)>,
    pub password: String,
    pub hostport: String,
    pub uri_params: Vec<(String, Option<String>)>,
    pub uri_headers: String,
}

const KNOWN_SCHEMES: [&str; 3] = ["sip", "sips", "tel"];

pub fn is_known_scheme(scheme: &str) -> bool {
    KNOWN_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str())
}

/// Drops the visual separators `. - ( )` a dial string may carry.
pub fn strip_visual_separators(userpart: &str) -> String {
    userpart
        .chars()
        .filter(|c| !matches!(c, '.' | '-' | '(' | ')'))
        .collect()
}

fn parse_params(raw: &str) -> Vec<(String, Option<String>)> {
    raw.split(';')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

fn render_params(params: &[(String, Option<String>)]) -> String {
    let mut out = String::new();
    for (k, v) in params {
        out.push(';');
        out.push_str(k);
        if let Some(v) = v {
            out.push('=');
            out.push_str(v);
        }
    }
    out
}

impl RequestUri {
    /// Parses a Request-URI. Returns `None` when the shape is not
    /// recognizable (the caller then falls back to the raw string).
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (scheme, rest) = input.split_once(':')?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return None;
        }

        let mut uri = RequestUri {
            scheme: scheme.to_ascii_lowercase(),
            ..Default::default()
        };

        let host_and_more = match rest.split_once('@') {
            Some((userinfo, host_and_more)) => {
                let (head, password) = match userinfo.rsplit_once(':') {
                    Some((head, password)) => (head, password.to_string()),
                    None => (userinfo, String::new()),
                };
                let (userpart, user_params) = match head.split_once(';') {
                    Some((up, params)) => (up, parse_params(params)),
                    None => (head, Vec::new()),
                };
                uri.original_userpart = userpart.to_string();
                uri.userpart = strip_visual_separators(userpart);
                uri.user_params = user_params;
                uri.password = password;
                host_and_more
            }
            None => rest,
        };

        let (host_and_params, headers) = match host_and_more.split_once('?') {
            Some((h, q)) => (h, format!("?{}", q)),
            None => (host_and_more, String::new()),
        };
        uri.uri_headers = headers;

        match host_and_params.split_once(';') {
            Some((hostport, params)) => {
                uri.hostport = hostport.to_string();
                uri.uri_params = parse_params(params);
            }
            None => uri.hostport = host_and_params.to_string(),
        }

        if uri.hostport.is_empty() {
            return None;
        }
        Some(uri)
    }

    /// Rebuilds the URI, optionally with the original (unstripped)
    /// userpart spelling.
    pub fn build(&self, use_original: bool) -> String {
        let up = if use_original {
            &self.original_userpart
        } else {
            &self.userpart
        };
        if up.is_empty() {
            return format!(
                "{}:{}{}{}",
                self.scheme,
                self.hostport,
                render_params(&self.uri_params),
                self.uri_headers
            );
        }
        let password = if self.password.is_empty() {
            String::new()
        } else {
            format!(":{}", self.password)
        };
        format!(
            "{}:{}{}{}@{}{}{}",
            self.scheme,
            up,
            render_params(&self.user_params),
            password,
            self.hostport,
            render_params(&self.uri_params),
            self.uri_headers
        )
    }
}

/// Extracts the userpart of the first URI embedded in a header value
/// such as `From`, `Contact` or `Refer-To`.
pub fn uri_userpart(value: &str) -> Option<&str> {
    let start = value.find("sip:").or_else(|| value.find("sips:"))?;
    let after_scheme = &value[start..];
    let after_scheme = &after_scheme[after_scheme.find(':')? + 1..];
    let end = after_scheme.find('@')?;
    let userinfo = &after_scheme[..end];
    Some(match userinfo.find([';', ':']) {
        Some(idx) => &userinfo[..idx],
        None => userinfo,
    })
}

/// Extracts `host[:port]` of the first URI embedded in a header value.
pub fn uri_hostport(value: &str) -> Option<&str> {
    let start = value.find("sip:").or_else(|| value.find("sips:"))?;
    let after_scheme = &value[start..];
    let mut rest = &after_scheme[after_scheme.find(':')? + 1..];
    if let Some(at) = rest.find('@') {
        rest = &rest[at + 1..];
    }
    let end = rest
        .find([';', '?', '>', ' ', '\t'])
        .unwrap_or(rest.len());
    let hostport = &rest[..end];
    (!hostport.is_empty()).then_some(hostport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_invite_uri() {
        let uri = RequestUri::parse("sip:+1.202.555-0101;npdi:secret@as.example.net:5060;user=phone?h=v").unwrap();
        assert_eq!(uri.scheme, "sip");
        assert_eq!(uri.original_userpart, "+1.202.555-0101");
        assert_eq!(uri.userpart, "+12025550101");
        assert_eq!(uri.user_params, vec![("npdi".to_string(), None)]);
        assert_eq!(uri.password, "secret");
        assert_eq!(uri.hostport, "as.example.net:5060");
        assert_eq!(uri.uri_params, vec![("user".to_string(), Some("phone".to_string()))]);
        assert_eq!(uri.uri_headers, "?h=v");
    }

    #[test]
    fn rebuild_round_trips() {
        let raw = "sip:+1.202.555-0101@as.example.net;user=phone";
        let uri = RequestUri::parse(raw).unwrap();
        assert_eq!(uri.build(true), raw);
        assert_eq!(uri.build(false), "sip:+12025550101@as.example.net;user=phone");
    }

    #[test]
    fn hostless_uri_is_rejected() {
        assert!(RequestUri::parse("sip:").is_none());
        assert!(RequestUri::parse("nonsense").is_none());
    }

    #[test]
    fn userpart_extraction() {
        assert_eq!(uri_userpart("<sip:2001@1.2.3.4:5080>;expires=300"), Some("2001"));
        assert_eq!(uri_userpart("\"A\" <sip:echo;par=1@h>"), Some("echo"));
        assert_eq!(uri_userpart("<sip:1.2.3.4>"), None);
        assert_eq!(uri_hostport("<sip:2001@1.2.3.4:5080>;x"), Some("1.2.3.4:5080"));
    }
}
