use super::Inner;
use crate::auth::{select_mechanism, Auth, Sasl};
use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::wire::method::connection::{self, Close, TuneOk};
use crate::wire::{AmqpClass, AmqpFrame, FieldTable};
use log::debug;

/// The connection-open state machine, driven by inbound channel-0 method
/// frames. The protocol header has already been queued when this starts.
///
/// Start -> Secure (0+ challenge rounds) -> Tune -> Open -> Done, with a
/// detour to ServerClosing if the server rejects us (bad vhost, bad tune
/// parameters, bad credentials).
pub(super) enum HandshakeState {
    Start(ConnectionOptions),
    Secure(ConnectionOptions, Auth, FieldTable),
    Tune(ConnectionOptions, Auth, FieldTable),
    Open(TuneOk, FieldTable),
    ServerClosing(Close),
    Done(TuneOk, FieldTable),
}

fn expect_channel0(frame: AmqpFrame) -> Result<connection::Method> {
    match frame {
        AmqpFrame::Method(0, AmqpClass::Connection(method)) => Ok(method),
        _ => FrameUnexpectedSnafu.fail(),
    }
}

impl HandshakeState {
    pub(super) fn process(&mut self, inner: &mut Inner, frame: AmqpFrame) -> Result<()> {
        // Take the current state so we can move option values forward
        // without cloning; every arm must put a state back.
        let state = std::mem::replace(self, HandshakeState::Start(ConnectionOptions::default()));
        match state {
            HandshakeState::Start(options) => {
                let start = match expect_channel0(frame)? {
                    connection::Method::Start(start) => start,
                    _ => return FrameUnexpectedSnafu.fail(),
                };
                debug!(
                    "received connection.start (mechanisms = {:?}, locales = {:?})",
                    start.mechanisms, start.locales
                );

                let auth = match select_mechanism(&options.auth_mechanisms, &start.mechanisms) {
                    Some(auth) => auth.clone(),
                    None => {
                        return UnsupportedAuthMechanismSnafu {
                            available: start.mechanisms,
                        }
                        .fail()
                    }
                };
                if !start.locales.split(' ').any(|l| l == options.locale) {
                    return UnsupportedLocaleSnafu {
                        available: start.locales,
                        requested: options.locale.clone(),
                    }
                    .fail();
                }

                let start_ok = connection::StartOk {
                    client_properties: options.client_properties_table(),
                    mechanism: auth.mechanism().to_string(),
                    response: auth.response(),
                    locale: options.locale.clone(),
                };
                debug!("sending connection.start-ok (mechanism = {})", start_ok.mechanism);
                inner.push_method(0, connection::Method::StartOk(start_ok))?;

                *self = HandshakeState::Secure(options, auth, start.server_properties);
                Ok(())
            }
            HandshakeState::Secure(options, auth, server_properties) => {
                match expect_channel0(frame)? {
                    // Challenge round; PLAIN and EXTERNAL just repeat their
                    // response.
                    connection::Method::Secure(secure) => {
                        debug!("received connection.secure challenge ({} bytes)", secure.challenge.len());
                        inner.push_method(
                            0,
                            connection::Method::SecureOk(connection::SecureOk {
                                response: auth.response(),
                            }),
                        )?;
                        *self = HandshakeState::Secure(options, auth, server_properties);
                        Ok(())
                    }
                    method => {
                        *self = HandshakeState::Tune(options, auth, server_properties);
                        self.process_tune(inner, method)
                    }
                }
            }
            HandshakeState::Tune(options, auth, server_properties) => {
                let state = HandshakeState::Tune(options, auth, server_properties);
                *self = state;
                let method = expect_channel0(frame)?;
                self.process_tune(inner, method)
            }
            HandshakeState::Open(tune_ok, server_properties) => {
                match expect_channel0(frame)? {
                    // If we sent bad tune params or a bad vhost, the server
                    // sends a Close instead of open-ok.
                    connection::Method::Close(close) => {
                        inner.push_method(
                            0,
                            connection::Method::CloseOk(connection::CloseOk {}),
                        )?;
                        inner.seal_writes();
                        *self = HandshakeState::ServerClosing(close);
                        Ok(())
                    }
                    connection::Method::OpenOk(open_ok) => {
                        debug!("received connection.open-ok: {:?}", open_ok);
                        *self = HandshakeState::Done(tune_ok, server_properties);
                        Ok(())
                    }
                    _ => FrameUnexpectedSnafu.fail(),
                }
            }
            state @ (HandshakeState::ServerClosing(_) | HandshakeState::Done(_, _)) => {
                *self = state;
                FrameUnexpectedSnafu.fail()
            }
        }
    }

    fn process_tune(&mut self, inner: &mut Inner, method: connection::Method) -> Result<()> {
        let (options, server_properties) = match std::mem::replace(
            self,
            HandshakeState::Start(ConnectionOptions::default()),
        ) {
            HandshakeState::Tune(options, _, server_properties) => (options, server_properties),
            _ => unreachable!("process_tune called outside Tune state"),
        };

        let tune = match method {
            connection::Method::Tune(tune) => tune,
            connection::Method::Close(close) => {
                // e.g. bad credentials surfaced as an explicit close
                inner.push_method(0, connection::Method::CloseOk(connection::CloseOk {}))?;
                inner.seal_writes();
                *self = HandshakeState::ServerClosing(close);
                return Ok(());
            }
            _ => return FrameUnexpectedSnafu.fail(),
        };
        debug!("received connection.tune: {:?}", tune);

        let tune_ok = options.make_tune_ok(tune)?;
        inner.start_heartbeats(tune_ok.heartbeat, options.socket_read_timeout);

        debug!("sending connection.tune-ok: {:?}", tune_ok);
        inner.push_method(0, connection::Method::TuneOk(tune_ok))?;

        let open = connection::Open {
            virtual_host: options.virtual_host.clone(),
            capabilities: String::new(), // reserved
            insist: false,               // reserved
        };
        debug!("sending connection.open (vhost = {})", open.virtual_host);
        inner.push_method(0, connection::Method::Open(open))?;

        *self = HandshakeState::Open(tune_ok, server_properties);
        Ok(())
    }

    /// True if we sent start-ok but never heard back. Brokers drop the
    /// socket without a message on bad credentials, so dying in this state
    /// reads as an authentication failure.
    pub(super) fn awaiting_post_start(&self) -> bool {
        matches!(self, HandshakeState::Secure(_, _, _))
    }
}
