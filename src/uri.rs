use crate::errors::*;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use snafu::ResultExt;
use std::fmt;
use url::{Host, Url};

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_TLS_PORT: u16 = 5671;

// Characters that must be escaped inside userinfo and vhost segments when
// formatting a URI back out.
const SEGMENT_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b':');

/// A parsed `amqp://` / `amqps://` connection URI.
///
/// Userinfo and vhost are percent-decoded (`+` is preserved literally, not
/// treated as a space). A missing vhost segment means the default vhost
/// `/`; an empty trailing segment (`amqp://host/`) means the empty-named
/// vhost. More than one path segment is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpUri {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub tls: bool,
}

impl AmqpUri {
    pub fn parse(raw: &str) -> Result<AmqpUri> {
        let url = Url::parse(raw).context(UrlParseSnafu)?;

        let tls = match url.scheme() {
            "amqp" => false,
            "amqps" => true,
            _ => {
                return InvalidUrlSnafu {
                    url,
                    reason: "scheme must be amqp or amqps",
                }
                .fail()
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => decode_segment(domain, &url)?,
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => format!("[{}]", addr),
            None => {
                return InvalidUrlSnafu {
                    url,
                    reason: "missing host",
                }
                .fail()
            }
        };
        let port = url.port().unwrap_or(if tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        });

        let user = match url.username() {
            "" => None,
            user => Some(decode_segment(user, &url)?),
        };
        let password = match url.password() {
            None => None,
            Some(password) => Some(decode_segment(password, &url)?),
        };

        let vhost = match url.path() {
            "" => "/".to_string(),
            path => {
                let segment = &path[1..];
                if segment.contains('/') {
                    return InvalidUrlSnafu {
                        url,
                        reason: "vhost must be a single path segment",
                    }
                    .fail();
                }
                decode_segment(segment, &url)?
            }
        };

        Ok(AmqpUri {
            user,
            password,
            host,
            port,
            vhost,
            tls,
        })
    }

    pub fn default_port(&self) -> u16 {
        if self.tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        }
    }
}

fn decode_segment(raw: &str, url: &Url) -> Result<String> {
    // percent_decode only touches %XX escapes; '+' passes through as '+'
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => Ok(decoded.into_owned()),
        Err(_) => InvalidUrlSnafu {
            url: url.clone(),
            reason: "percent-decoded segment is not utf-8",
        }
        .fail(),
    }
}

impl fmt::Display for AmqpUri {
    /// Formats with default elisions: default ports, the default vhost
    /// `/`, and absent userinfo are omitted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", if self.tls { "amqps" } else { "amqp" })?;
        if let Some(user) = &self.user {
            write!(f, "{}", utf8_percent_encode(user, SEGMENT_ESCAPES))?;
            if let Some(password) = &self.password {
                write!(f, ":{}", utf8_percent_encode(password, SEGMENT_ESCAPES))?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host)?;
        if self.port != self.default_port() {
            write!(f, ":{}", self.port)?;
        }
        if self.vhost != "/" {
            write!(f, "/{}", utf8_percent_encode(&self.vhost, SEGMENT_ESCAPES))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_secure_uri() {
        let uri = AmqpUri::parse("amqps://u:p%40@h:5671/prod%2Fweb").unwrap();
        assert_eq!(uri.user.as_deref(), Some("u"));
        assert_eq!(uri.password.as_deref(), Some("p@"));
        assert_eq!(uri.host, "h");
        assert_eq!(uri.port, 5671);
        assert_eq!(uri.vhost, "prod/web");
        assert!(uri.tls);
    }

    #[test]
    fn defaults() {
        let uri = AmqpUri::parse("amqp://localhost").unwrap();
        assert_eq!(uri.user, None);
        assert_eq!(uri.password, None);
        assert_eq!(uri.port, 5672);
        assert_eq!(uri.vhost, "/");
        assert!(!uri.tls);

        let secure = AmqpUri::parse("amqps://localhost").unwrap();
        assert_eq!(secure.port, 5671);
    }

    #[test]
    fn trailing_slash_is_empty_vhost() {
        let uri = AmqpUri::parse("amqp://localhost/").unwrap();
        assert_eq!(uri.vhost, "");
    }

    #[test]
    fn plus_survives_decoding() {
        let uri = AmqpUri::parse("amqp://localhost/a+b").unwrap();
        assert_eq!(uri.vhost, "a+b");
    }

    #[test]
    fn ipv6_host_keeps_brackets() {
        let uri = AmqpUri::parse("amqp://[::1]:5673").unwrap();
        assert_eq!(uri.host, "[::1]");
        assert_eq!(uri.port, 5673);
    }

    #[test]
    fn multiple_path_segments_rejected() {
        match AmqpUri::parse("amqp://localhost/a/b") {
            Err(Error::InvalidUrl { .. }) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn wrong_scheme_rejected() {
        assert!(AmqpUri::parse("http://localhost").is_err());
    }

    #[test]
    fn format_parse_roundtrip() {
        for raw in [
            "amqp://localhost",
            "amqps://u:p%40@h/prod%2Fweb",
            "amqp://h:5673",
            "amqp://user@h",
        ] {
            let uri = AmqpUri::parse(raw).unwrap();
            let reparsed = AmqpUri::parse(&uri.to_string()).unwrap();
            assert_eq!(reparsed, uri, "roundtrip failed for {}", raw);
        }
    }
}
