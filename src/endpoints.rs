use crate::errors::*;
use crate::uri::{AmqpUri, DEFAULT_PORT, DEFAULT_TLS_PORT};
use log::{debug, warn};
use mio::net::TcpStream;
use rand::seq::SliceRandom;
use snafu::IntoError;
use std::fmt;

/// One broker address candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Host/port pair as accepted by `ToSocketAddrs` (IPv6 hosts keep
    /// their brackets).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&AmqpUri> for Endpoint {
    fn from(uri: &AmqpUri) -> Endpoint {
        Endpoint {
            host: uri.host.clone(),
            port: uri.port,
            tls: uri.tls,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// Parse a comma-separated endpoint list: `host[:port]`, IPv6 literals in
/// brackets, port optional (5672, or 5671 when `tls` is set).
pub fn parse_endpoint_list(list: &str, tls: bool) -> Result<Vec<Endpoint>> {
    let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
    let mut endpoints = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return InvalidEndpointListSnafu {
                list,
                reason: "empty endpoint entry",
            }
            .fail();
        }

        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            // IPv6 literal; the closing bracket splits host from port
            let close = rest.find(']').ok_or_else(|| {
                InvalidEndpointListSnafu {
                    list,
                    reason: "unterminated IPv6 literal",
                }
                .build()
            })?;
            let host = format!("[{}]", &rest[..close]);
            match &rest[close + 1..] {
                "" => (host, default_port),
                port => {
                    let port = port.strip_prefix(':').ok_or_else(|| {
                        InvalidEndpointListSnafu {
                            list,
                            reason: "expected ':' after IPv6 literal",
                        }
                        .build()
                    })?;
                    (host, parse_port(port, list)?)
                }
            }
        } else {
            match entry.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), parse_port(port, list)?),
                None => (entry.to_string(), default_port),
            }
        };

        endpoints.push(Endpoint { host, port, tls });
    }
    Ok(endpoints)
}

fn parse_port(raw: &str, list: &str) -> Result<u16> {
    raw.parse().map_err(|_| {
        InvalidEndpointListSnafu {
            list,
            reason: "invalid port",
        }
        .build()
    })
}

/// Strategy for picking one reachable endpoint out of a candidate list.
///
/// The default implementation shuffles and walks the list; replace it (via
/// [`Connection::open_with_resolver`](crate::Connection::open_with_resolver))
/// to implement stickiness, DNS expansion, or custom ordering.
pub trait EndpointResolver: Send + Sync {
    /// Invoke `attempt` on candidates until one yields a connected
    /// transport. Exhausting all candidates is a `BrokerUnreachable` error
    /// wrapping the final attempt's failure.
    fn select_one(
        &self,
        endpoints: &[Endpoint],
        attempt: &mut dyn FnMut(&Endpoint) -> Result<TcpStream>,
    ) -> Result<TcpStream>;
}

/// Default resolver: iterate the candidates in a freshly-shuffled but then
/// stable order.
#[derive(Debug, Default)]
pub struct ShuffledResolver;

impl EndpointResolver for ShuffledResolver {
    fn select_one(
        &self,
        endpoints: &[Endpoint],
        attempt: &mut dyn FnMut(&Endpoint) -> Result<TcpStream>,
    ) -> Result<TcpStream> {
        let mut order: Vec<&Endpoint> = endpoints.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        let mut last_error = None;
        for endpoint in &order {
            debug!("attempting connection to {}", endpoint);
            match attempt(endpoint) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    warn!("connection attempt to {} failed: {}", endpoint, err);
                    last_error = Some(err);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| {
            InvalidEndpointListSnafu {
                list: "",
                reason: "no endpoints configured",
            }
            .build()
        });
        Err(BrokerUnreachableSnafu {
            attempts: order.len(),
        }
        .into_error(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_with_mixed_entries() {
        let endpoints = parse_endpoint_list("one:5673, two ,[::1]:5674,[fe80::1]", false).unwrap();
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("one", 5673),
                Endpoint::new("two", 5672),
                Endpoint::new("[::1]", 5674),
                Endpoint::new("[fe80::1]", 5672),
            ]
        );
    }

    #[test]
    fn tls_list_uses_tls_default_port() {
        let endpoints = parse_endpoint_list("secure", true).unwrap();
        assert_eq!(endpoints[0].port, 5671);
        assert!(endpoints[0].tls);
    }

    #[test]
    fn bad_entries_rejected() {
        assert!(parse_endpoint_list("", false).is_err());
        assert!(parse_endpoint_list("host:notaport", false).is_err());
        assert!(parse_endpoint_list("[::1", false).is_err());
        assert!(parse_endpoint_list("a,,b", false).is_err());
    }

    #[test]
    fn resolver_tries_every_candidate_once() {
        let endpoints = vec![
            Endpoint::new("bad1", 1),
            Endpoint::new("bad2", 2),
            Endpoint::new("bad3", 3),
        ];
        let mut attempted = Vec::new();
        let result = ShuffledResolver.select_one(&endpoints, &mut |endpoint| {
            attempted.push(endpoint.host.clone());
            Err(FailedToConnectSnafu.into_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        });

        match result {
            Err(Error::BrokerUnreachable { attempts: 3, .. }) => (),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
        attempted.sort();
        assert_eq!(attempted, vec!["bad1", "bad2", "bad3"]);
    }

    #[test]
    fn resolver_stops_at_first_success() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoints = vec![Endpoint::new(addr.ip().to_string(), addr.port())];

        let mut attempts = 0;
        let stream = ShuffledResolver
            .select_one(&endpoints, &mut |endpoint| {
                attempts += 1;
                let addr = endpoint.address().parse().unwrap();
                TcpStream::connect(&addr).map_err(|err| FailedToConnectSnafu.into_error(err))
            })
            .unwrap();
        drop(stream);
        assert_eq!(attempts, 1);
    }
}
