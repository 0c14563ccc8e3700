//! Discovery target parsing
//!
//! Targets such as `etcd://10.0.0.1:2379,10.0.0.2:2379/dtmservice` carry a
//! comma-separated host list in the authority. WHATWG parsers (the `url`
//! crate included) reject that as an invalid port, so targets are split with
//! the same lenient rules the RPC framework applies when it formats them.

use crate::error::TargetError;
use url::form_urlencoded;

/// A parsed `scheme://host[,host...]/path[?query]` target
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetUrl {
    /// Lower-cased scheme, empty for schemeless input
    pub scheme: String,
    /// Authority without userinfo, port included, possibly a comma list
    pub host: String,
    /// Percent-decoded path, leading `/` kept
    pub path: String,
    /// Query string without the `?`
    pub raw_query: String,
}

impl TargetUrl {
    /// Parse a target string
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        if raw.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return Err(TargetError::InvalidControlCharacter(raw.to_string()));
        }

        let without_fragment = raw.split_once('#').map_or(raw, |(head, _)| head);
        let (scheme, rest) = split_scheme(without_fragment)
            .ok_or_else(|| TargetError::MissingScheme(raw.to_string()))?;

        let (rest, raw_query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, query.to_string()),
            None => (rest, String::new()),
        };

        let mut target = TargetUrl {
            scheme,
            raw_query,
            ..Default::default()
        };

        if !rest.starts_with('/') {
            if !target.scheme.is_empty() {
                // opaque form such as `mailto:someone`, nothing addressable
                return Ok(target);
            }
            let first_segment = rest.split('/').next().unwrap_or_default();
            if first_segment.contains(':') {
                return Err(TargetError::ColonInFirstSegment(raw.to_string()));
            }
        }

        let mut path = rest;
        let has_authority = (!target.scheme.is_empty() || !rest.starts_with("///"))
            && rest.starts_with("//");
        if has_authority {
            let authority_and_path = &rest[2..];
            let (authority, remainder) = match authority_and_path.find('/') {
                Some(slash) => authority_and_path.split_at(slash),
                None => (authority_and_path, ""),
            };
            target.host = parse_host(raw, authority)?;
            path = remainder;
        }

        validate_escapes(raw, path)?;
        target.path = decode(path);

        Ok(target)
    }

    /// Every backend address listed in the authority
    pub fn hosts(&self) -> Vec<String> {
        self.host.split(',').map(str::to_string).collect()
    }

    /// Path with a single leading `/` removed
    pub fn key(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    /// First value of a query parameter, or an empty string when absent
    pub fn query_value(&self, name: &str) -> String {
        form_urlencoded::parse(self.raw_query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default()
    }
}

/// Split off a leading scheme. `None` means the input starts with `:`.
fn split_scheme(raw: &str) -> Option<(String, &str)> {
    for (i, b) in raw.bytes().enumerate() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' => {}
            b'0'..=b'9' | b'+' | b'-' | b'.' => {
                if i == 0 {
                    return Some((String::new(), raw));
                }
            }
            b':' => {
                if i == 0 {
                    return None;
                }
                return Some((raw[..i].to_ascii_lowercase(), &raw[i + 1..]));
            }
            _ => return Some((String::new(), raw)),
        }
    }
    Some((String::new(), raw))
}

fn parse_host(raw: &str, authority: &str) -> Result<String, TargetError> {
    let host = authority
        .rfind('@')
        .map_or(authority, |at| &authority[at + 1..]);

    let port_start = if host.starts_with('[') {
        host.rfind(']').and_then(|end| {
            let after = &host[end + 1..];
            after.starts_with(':').then_some(end + 1)
        })
    } else {
        host.rfind(':')
    };

    if let Some(colon) = port_start {
        let port = &host[colon + 1..];
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TargetError::InvalidPort {
                url: raw.to_string(),
                port: host[colon..].to_string(),
            });
        }
    }

    validate_escapes(raw, host)?;
    validate_host(raw, host)?;
    Ok(decode(host))
}

/// Reject characters a host cannot carry and escapes of plain ASCII
///
/// Only `%25` and escapes of non-ASCII bytes are allowed, except inside the
/// zone of a bracketed IPv6 literal (`[fe80::1%25en0]`).
fn validate_host(raw: &str, host: &str) -> Result<(), TargetError> {
    let zone = match (host.starts_with('['), host.find("%25"), host.rfind(']')) {
        (true, Some(start), Some(end)) if start < end => start..end,
        _ => 0..0,
    };

    let bytes = host.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let escape = &host[i..i + 3];
                if !zone.contains(&i) && bytes[i + 1] < b'8' && escape != "%25" {
                    return Err(TargetError::InvalidEscape {
                        url: raw.to_string(),
                        escape: escape.to_string(),
                    });
                }
                i += 3;
            }
            b if b < 0x80 && !is_host_char(b) => {
                return Err(TargetError::InvalidHostCharacter {
                    url: raw.to_string(),
                    character: char::from(b).to_string(),
                });
            }
            _ => i += 1,
        }
    }
    Ok(())
}

fn is_host_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!$&'()*+,;=:[]<>\"-_.~".contains(&b)
}

fn validate_escapes(raw: &str, s: &str) -> Result<(), TargetError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(s.len());
                return Err(TargetError::InvalidEscape {
                    url: raw.to_string(),
                    escape: String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                });
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn decode(s: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multi_host_target() {
        let target = TargetUrl::parse("etcd://10.0.0.1:2379,10.0.0.2:2379/dtmservice").unwrap();
        assert_eq!(target.scheme, "etcd");
        assert_eq!(target.host, "10.0.0.1:2379,10.0.0.2:2379");
        assert_eq!(target.hosts(), vec!["10.0.0.1:2379", "10.0.0.2:2379"]);
        assert_eq!(target.path, "/dtmservice");
        assert_eq!(target.key(), "dtmservice");
    }

    #[test]
    fn test_parse_query_credentials() {
        let target = TargetUrl::parse("discov://localhost:2379/svc?user=root&password=s%3Dcret").unwrap();
        assert_eq!(target.query_value("user"), "root");
        assert_eq!(target.query_value("password"), "s=cret");
        assert_eq!(target.query_value("missing"), "");
        assert_eq!(target.key(), "svc");
    }

    #[test]
    fn test_scheme_is_lowercased_and_userinfo_dropped() {
        let target = TargetUrl::parse("GRPC://me:pw@host:9000/a/b").unwrap();
        assert_eq!(target.scheme, "grpc");
        assert_eq!(target.host, "host:9000");
        assert_eq!(target.path, "/a/b");
    }

    #[test]
    fn test_query_before_path_swallows_path() {
        let target = TargetUrl::parse("consul://host?wait=5s/pkg.Service/Method").unwrap();
        assert_eq!(target.host, "host");
        assert_eq!(target.path, "");
        assert_eq!(target.raw_query, "wait=5s/pkg.Service/Method");
    }

    #[test]
    fn test_fragment_is_dropped() {
        let target = TargetUrl::parse("etcd://host/key#frag").unwrap();
        assert_eq!(target.path, "/key");
    }

    #[test]
    fn test_key_strips_one_slash() {
        let target = TargetUrl::parse("etcd://host//nested").unwrap();
        assert_eq!(target.key(), "/nested");
    }

    #[test]
    fn test_path_is_percent_decoded() {
        let target = TargetUrl::parse("grpc://host/pkg%2EService/Method").unwrap();
        assert_eq!(target.path, "/pkg.Service/Method");
    }

    #[test]
    fn test_schemeless_path() {
        let target = TargetUrl::parse("a.b.c/Method").unwrap();
        assert_eq!(target.scheme, "");
        assert_eq!(target.host, "");
        assert_eq!(target.path, "a.b.c/Method");
    }

    #[test]
    fn test_bracketed_ipv6_host() {
        let target = TargetUrl::parse("grpc://[::1]:8080/svc/M").unwrap();
        assert_eq!(target.host, "[::1]:8080");
        assert_eq!(target.path, "/svc/M");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            TargetUrl::parse("://host/key"),
            Err(TargetError::MissingScheme(_))
        ));
        assert!(matches!(
            TargetUrl::parse("etcd://host:abc/key"),
            Err(TargetError::InvalidPort { .. })
        ));
        assert!(matches!(
            TargetUrl::parse("etcd://host/key\n"),
            Err(TargetError::InvalidControlCharacter(_))
        ));
        assert!(matches!(
            TargetUrl::parse("etcd://host/%zz"),
            Err(TargetError::InvalidEscape { .. })
        ));
        assert!(matches!(
            TargetUrl::parse("1etcd://host/key"),
            Err(TargetError::ColonInFirstSegment(_))
        ));
    }

    #[test]
    fn test_invalid_host_characters() {
        for target in ["consul://ho st/dtmservice", "grpc://h{x}/svc", "etcd://a|b/key", "etcd://h^/key"] {
            assert!(
                matches!(TargetUrl::parse(target), Err(TargetError::InvalidHostCharacter { .. })),
                "{} should be rejected",
                target
            );
        }

        let err = TargetUrl::parse("consul://ho st/dtmservice").unwrap_err();
        assert_eq!(
            err.to_string(),
            "parse \"consul://ho st/dtmservice\": invalid character \" \" in host name"
        );
    }

    #[test]
    fn test_host_escapes() {
        let err = TargetUrl::parse("grpc://h%41/svc").unwrap_err();
        assert!(matches!(err, TargetError::InvalidEscape { ref escape, .. } if escape == "%41"));

        assert_eq!(TargetUrl::parse("grpc://h%C3%A9/svc").unwrap().host, "hé");
        assert_eq!(TargetUrl::parse("grpc://h%25/svc").unwrap().host, "h%");
        assert_eq!(
            TargetUrl::parse("grpc://[fe80::1%25en%30]:8080/svc").unwrap().host,
            "[fe80::1%en0]:8080"
        );
    }

    #[test]
    fn test_invalid_port_message() {
        let err = TargetUrl::parse("etcd://host:x1/key").unwrap_err();
        assert_eq!(
            err.to_string(),
            "parse \"etcd://host:x1/key\": invalid port \":x1\" after host"
        );
    }
}
