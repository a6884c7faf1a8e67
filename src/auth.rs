/// A SASL mechanism: its advertised name plus the initial (and challenge)
/// response payloads.
pub trait Sasl {
    fn mechanism(&self) -> &'static str;
    fn response(&self) -> String;
}

/// Authentication credentials for one SASL mechanism.
///
/// Connections carry an ordered preference list of these; the handshake
/// picks the first whose mechanism the server advertises.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    /// Username/password, sent as a PLAIN initial response.
    Plain { username: String, password: String },

    /// No credentials on the wire; identity comes from the transport (e.g.,
    /// a client TLS certificate).
    External,

    /// Token-based auth (e.g., an OAuth 2 access token). Brokers accept
    /// these over the PLAIN mechanism with an empty username.
    Token { token: String },
}

impl Default for Auth {
    fn default() -> Auth {
        Auth::Plain {
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl Sasl for Auth {
    fn mechanism(&self) -> &'static str {
        match self {
            Auth::Plain { .. } | Auth::Token { .. } => "PLAIN",
            Auth::External => "EXTERNAL",
        }
    }

    fn response(&self) -> String {
        match self {
            Auth::Plain { username, password } => format!("\x00{}\x00{}", username, password),
            Auth::External => String::new(),
            Auth::Token { token } => format!("\x00\x00{}", token),
        }
    }
}

/// Pick the first configured mechanism the server also supports, honoring
/// the preference list's declared order. Mechanism lists are
/// space-separated on the wire.
pub(crate) fn select_mechanism<'a>(preferences: &'a [Auth], available: &str) -> Option<&'a Auth> {
    preferences
        .iter()
        .find(|auth| available.split(' ').any(|m| m == auth.mechanism()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_response_framing() {
        let auth = Auth::Plain {
            username: "u".to_string(),
            password: "p".to_string(),
        };
        assert_eq!(auth.response(), "\x00u\x00p");
    }

    #[test]
    fn preference_order_wins() {
        let preferences = vec![Auth::External, Auth::default()];
        let selected = select_mechanism(&preferences, "PLAIN EXTERNAL AMQPLAIN").unwrap();
        assert_eq!(selected, &Auth::External);
    }

    #[test]
    fn no_common_mechanism() {
        let preferences = vec![Auth::default()];
        assert!(select_mechanism(&preferences, "GSSAPI AMQPLAIN").is_none());
    }
}
