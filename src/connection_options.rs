use crate::auth::Auth;
use crate::errors::*;
use crate::wire::constants::FRAME_MIN_SIZE;
use crate::wire::method::connection::{Tune, TuneOk};
use crate::wire::{FieldTable, FieldValue};
use std::time::Duration;

/// Hard ceiling on the inbound message body size limit.
const MAX_INBOUND_BODY_CEILING: u64 = 512 << 20;

/// Longest accepted client-provided connection name.
const CLIENT_NAME_MAX: usize = 3000;

/// Options that control the overall AMQP connection.
///
/// `ConnectionOptions` uses the builder pattern and is immutable once the
/// connection is opened; reconnections during automatic recovery reuse the
/// exact same options. The default settings are equivalent to
///
/// ```rust
/// use coney::{Auth, ConnectionOptions};
/// use std::time::Duration;
///
/// # fn default_connection_options() -> ConnectionOptions {
/// ConnectionOptions::default()
///     .auth_mechanisms(vec![Auth::default()])
///     .virtual_host("/")
///     .locale("en_US")
///     .channel_max(2047)
///     .frame_max(0)
///     .heartbeat(60)
///     .connection_timeout(Some(Duration::from_secs(30)))
///     .automatic_recovery(true)
///     .topology_recovery(true)
///     .network_recovery_interval(Duration::from_secs(5))
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub(crate) auth_mechanisms: Vec<Auth>,
    pub(crate) virtual_host: String,
    pub(crate) locale: String,
    pub(crate) channel_max: u16,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: u16,
    pub(crate) max_inbound_message_body_size: u64,
    pub(crate) handshake_timeout: Duration,
    pub(crate) continuation_timeout: Duration,
    pub(crate) connection_timeout: Option<Duration>,
    pub(crate) socket_read_timeout: Option<Duration>,
    pub(crate) socket_write_timeout: Option<Duration>,
    pub(crate) automatic_recovery: bool,
    pub(crate) topology_recovery: bool,
    pub(crate) network_recovery_interval: Duration,
    pub(crate) max_recovery_attempts: u32,
    pub(crate) consumer_dispatch_concurrency: usize,
    pub(crate) client_provided_name: Option<String>,
    pub(crate) client_properties: FieldTable,
    information: Option<String>,
}

impl Default for ConnectionOptions {
    // NOTE: If we change this, make sure to change the doc comment above.
    fn default() -> Self {
        ConnectionOptions {
            auth_mechanisms: vec![Auth::default()],
            virtual_host: "/".to_string(),
            locale: "en_US".to_string(),
            channel_max: 2047,
            frame_max: 0,
            heartbeat: 60,
            max_inbound_message_body_size: 64 << 20,
            handshake_timeout: Duration::from_secs(10),
            continuation_timeout: Duration::from_secs(20),
            connection_timeout: Some(Duration::from_secs(30)),
            socket_read_timeout: Some(Duration::from_secs(30)),
            socket_write_timeout: Some(Duration::from_secs(30)),
            automatic_recovery: true,
            topology_recovery: true,
            network_recovery_interval: Duration::from_secs(5),
            max_recovery_attempts: 6,
            consumer_dispatch_concurrency: 1,
            client_provided_name: None,
            client_properties: FieldTable::new(),
            information: None,
        }
    }
}

impl ConnectionOptions {
    /// Sets the SASL credential preference list; the handshake selects the
    /// first entry whose mechanism the server advertises.
    pub fn auth_mechanisms(self, auth_mechanisms: Vec<Auth>) -> Self {
        ConnectionOptions {
            auth_mechanisms,
            ..self
        }
    }

    /// Convenience for a single PLAIN credential.
    pub fn auth(self, auth: Auth) -> Self {
        ConnectionOptions {
            auth_mechanisms: vec![auth],
            ..self
        }
    }

    /// Sets the AMQP virtual host.
    pub fn virtual_host<T: Into<String>>(self, virtual_host: T) -> Self {
        ConnectionOptions {
            virtual_host: virtual_host.into(),
            ..self
        }
    }

    /// Sets the locale. AMQP requires servers support `en_US`, which is
    /// also the default.
    pub fn locale<T: Into<String>>(self, locale: T) -> Self {
        ConnectionOptions {
            locale: locale.into(),
            ..self
        }
    }

    /// Sets the maximum number of channels that can be open simultaneously.
    /// 0 means no limit on our side; if the server requests a different
    /// nonzero value, the lower of the two wins.
    pub fn channel_max(self, channel_max: u16) -> Self {
        ConnectionOptions {
            channel_max,
            ..self
        }
    }

    /// Sets the maximum frame size in bytes. 0 means no limit on our side
    /// (servers usually clamp to 131072); a nonzero value below 4096 will
    /// fail the handshake, since AMQP forbids tuning below the minimum.
    ///
    /// The frame max says nothing about the maximum size of messages;
    /// larger message bodies are fragmented into multiple frames.
    pub fn frame_max(self, frame_max: u32) -> Self {
        ConnectionOptions { frame_max, ..self }
    }

    /// Sets the heartbeat interval in seconds; 0 disables heartbeats. If
    /// the server requests a different value, the lower of the two wins.
    pub fn heartbeat(self, heartbeat: u16) -> Self {
        ConnectionOptions { heartbeat, ..self }
    }

    /// Largest inbound message body we will assemble before treating the
    /// message as a protocol violation. Clamped to a 512 MiB ceiling.
    pub fn max_inbound_message_body_size(self, max_inbound_message_body_size: u64) -> Self {
        ConnectionOptions {
            max_inbound_message_body_size: max_inbound_message_body_size
                .min(MAX_INBOUND_BODY_CEILING),
            ..self
        }
    }

    /// Bounds every step of the connection handshake (protocol header
    /// through open-ok).
    pub fn handshake_timeout(self, handshake_timeout: Duration) -> Self {
        ConnectionOptions {
            handshake_timeout,
            ..self
        }
    }

    /// Bounds every post-handshake RPC awaiting its server reply.
    pub fn continuation_timeout(self, continuation_timeout: Duration) -> Self {
        ConnectionOptions {
            continuation_timeout,
            ..self
        }
    }

    /// Sets the timeout for the initial TCP connection. `None` means no
    /// timeout.
    pub fn connection_timeout(self, connection_timeout: Option<Duration>) -> Self {
        ConnectionOptions {
            connection_timeout,
            ..self
        }
    }

    /// Read deadline for the socket. The effective deadline is the larger
    /// of this and twice the negotiated heartbeat interval.
    pub fn socket_read_timeout(self, socket_read_timeout: Option<Duration>) -> Self {
        ConnectionOptions {
            socket_read_timeout,
            ..self
        }
    }

    /// How long a socket write may stall before the connection is treated
    /// as dead.
    pub fn socket_write_timeout(self, socket_write_timeout: Option<Duration>) -> Self {
        ConnectionOptions {
            socket_write_timeout,
            ..self
        }
    }

    /// Enables or disables automatic connection recovery after involuntary
    /// failures.
    pub fn automatic_recovery(self, automatic_recovery: bool) -> Self {
        ConnectionOptions {
            automatic_recovery,
            ..self
        }
    }

    /// Enables or disables replaying recorded topology (exchanges, queues,
    /// bindings, consumers) after a successful reconnect.
    pub fn topology_recovery(self, topology_recovery: bool) -> Self {
        ConnectionOptions {
            topology_recovery,
            ..self
        }
    }

    /// How long to wait after an involuntary disconnect before the first
    /// reconnection attempt (and between subsequent rounds).
    pub fn network_recovery_interval(self, network_recovery_interval: Duration) -> Self {
        ConnectionOptions {
            network_recovery_interval,
            ..self
        }
    }

    /// How many reconnection rounds to attempt before giving up and
    /// surfacing the connection as permanently closed.
    pub fn max_recovery_attempts(self, max_recovery_attempts: u32) -> Self {
        ConnectionOptions {
            max_recovery_attempts,
            ..self
        }
    }

    /// Default number of worker threads used by
    /// [`Consumer::dispatch`](crate::Consumer::dispatch). Delivery order is
    /// only guaranteed when this is 1.
    pub fn consumer_dispatch_concurrency(self, consumer_dispatch_concurrency: usize) -> Self {
        ConnectionOptions {
            consumer_dispatch_concurrency: consumer_dispatch_concurrency.max(1),
            ..self
        }
    }

    /// Human-readable connection name shown in the server's management
    /// interface; truncated to 3000 characters.
    pub fn client_provided_name<T: Into<String>>(self, client_provided_name: Option<T>) -> Self {
        ConnectionOptions {
            client_provided_name: client_provided_name.map(|name| {
                let mut name = name.into();
                name.truncate(CLIENT_NAME_MAX);
                name
            }),
            ..self
        }
    }

    /// Extra entries merged into the client-properties table sent in
    /// start-ok. Entries here override the built-in defaults on key
    /// collision.
    pub fn client_properties(self, client_properties: FieldTable) -> Self {
        ConnectionOptions {
            client_properties,
            ..self
        }
    }

    /// Sets the "information" string reported during handshaking; shown in
    /// the server's management interface.
    pub fn information<T: Into<String>>(self, information: Option<T>) -> Self {
        ConnectionOptions {
            information: information.map(Into::into),
            ..self
        }
    }

    /// The client-properties table for start-ok: product, version,
    /// platform, copyright, information, capabilities, plus any
    /// user-supplied entries.
    pub(crate) fn client_properties_table(&self) -> FieldTable {
        let mut client_properties = FieldTable::new();
        let mut set_prop = |k: &str, v: String| {
            client_properties.insert(k, FieldValue::LongString(v));
        };
        set_prop("product", env!("CARGO_PKG_NAME").to_string());
        set_prop("version", env!("CARGO_PKG_VERSION").to_string());
        set_prop("platform", std::env::consts::OS.to_string());
        set_prop(
            "copyright",
            "Licensed under MIT or Apache-2.0".to_string(),
        );
        set_prop(
            "information",
            self.information
                .clone()
                .unwrap_or_else(|| concat!("coney ", env!("CARGO_PKG_VERSION")).to_string()),
        );
        if let Some(name) = &self.client_provided_name {
            set_prop("connection_name", name.clone());
        }

        let mut capabilities = FieldTable::new();
        capabilities.insert("consumer_cancel_notify", FieldValue::Boolean(true));
        capabilities.insert("connection.blocked", FieldValue::Boolean(true));
        capabilities.insert("publisher_confirms", FieldValue::Boolean(true));
        client_properties.insert("capabilities", FieldValue::FieldTable(capabilities));

        for (key, value) in self.client_properties.iter() {
            client_properties.insert(key.clone(), value.clone());
        }

        client_properties
    }

    /// Negotiate tune parameters: pairwise minimum, where 0 means "no
    /// limit" and loses to any nonzero value.
    pub(crate) fn make_tune_ok(&self, tune: Tune) -> Result<TuneOk> {
        fn promote_0_u16(mut val: u16) -> u16 {
            if val == 0 {
                val = u16::max_value();
            }
            val
        }
        fn promote_0_u32(mut val: u32) -> u32 {
            if val == 0 {
                val = u32::max_value();
            }
            val
        }

        let chan_max0 = promote_0_u16(tune.channel_max);
        let chan_max1 = promote_0_u16(self.channel_max);

        let frame_max0 = promote_0_u32(tune.frame_max);
        let frame_max1 = promote_0_u32(self.frame_max);

        let channel_max = u16::min(chan_max0, chan_max1);
        let frame_max = u32::min(frame_max0, frame_max1);

        // 0 means "disabled, peer's preference wins"; both zero disables
        // heartbeats outright.
        let heartbeat = if tune.heartbeat == 0 || self.heartbeat == 0 {
            u16::max(tune.heartbeat, self.heartbeat)
        } else {
            u16::min(tune.heartbeat, self.heartbeat)
        };

        if frame_max < FRAME_MIN_SIZE {
            return FrameMaxTooSmallSnafu {
                min: FRAME_MIN_SIZE,
                requested: frame_max,
            }
            .fail();
        }

        Ok(TuneOk {
            channel_max,
            frame_max,
            heartbeat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> Tune {
        Tune {
            channel_max,
            frame_max,
            heartbeat,
        }
    }

    #[test]
    fn channel_max_pairwise_min_with_zero_promotion() {
        let cases = [
            // (ours, server's, negotiated)
            (0u16, 0u16, u16::max_value()),
            (10, 0, 10),
            (0, 10, 10),
            (20, 10, 10),
            (10, 20, 10),
        ];
        for (ours, servers, expected) in cases {
            let options = ConnectionOptions::default().channel_max(ours);
            let tune_ok = options.make_tune_ok(tune(servers, 1 << 17, 60)).unwrap();
            assert_eq!(tune_ok.channel_max, expected);
        }
    }

    #[test]
    fn heartbeat_negotiation() {
        let cases = [
            // (ours, server's, negotiated)
            (0u16, 0u16, 0u16),
            (0, 60, 60),
            (60, 0, 60),
            (30, 60, 30),
            (60, 30, 30),
        ];
        for (ours, servers, expected) in cases {
            let options = ConnectionOptions::default().heartbeat(ours);
            let tune_ok = options.make_tune_ok(tune(0, 1 << 17, servers)).unwrap();
            assert_eq!(tune_ok.heartbeat, expected);
        }
    }

    #[test]
    fn frame_max_too_small() {
        let options = ConnectionOptions::default().frame_max(FRAME_MIN_SIZE - 1);
        let res = options.make_tune_ok(tune(0, 1 << 17, 60));
        match res.unwrap_err() {
            Error::FrameMaxTooSmall { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn client_name_truncated() {
        let long = "x".repeat(5000);
        let options = ConnectionOptions::default().client_provided_name(Some(long));
        assert_eq!(options.client_provided_name.unwrap().len(), 3000);
    }

    #[test]
    fn inbound_body_limit_clamped() {
        let options = ConnectionOptions::default().max_inbound_message_body_size(u64::max_value());
        assert_eq!(options.max_inbound_message_body_size, 512 << 20);
    }

    #[test]
    fn client_properties_contains_required_defaults() {
        let options = ConnectionOptions::default();
        let table = options.client_properties_table();
        for key in ["product", "version", "platform", "copyright", "information"] {
            assert!(table.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn user_client_properties_override_defaults() {
        let mut extra = FieldTable::new();
        extra.insert("product", FieldValue::LongString("custom".to_string()));
        let options = ConnectionOptions::default().client_properties(extra);
        let table = options.client_properties_table();
        assert_eq!(
            table.get("product"),
            Some(&FieldValue::LongString("custom".to_string()))
        );
    }
}
