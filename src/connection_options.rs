use crate::errors::*;
use crate::Sasl;
use amq_protocol::protocol::connection::{Open, Start, StartOk, Tune, TuneOk};
use amq_protocol::protocol::constants::FRAME_MIN_SIZE;
use amq_protocol::types::{AMQPValue, FieldTable};
use std::time::Duration;

/// Requested heartbeat behavior.
///
/// Heartbeats are negotiated with the server during handshake; see
/// [`ConnectionOptions::heartbeat`] for the resolution rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Heartbeat {
    /// Accept whatever interval the server suggests.
    Server,

    /// Request an explicit interval in seconds; 0 disables heartbeats.
    Seconds(u16),
}

/// Options that control the overall AMQP connection.
///
/// `ConnectionOptions` uses the builder pattern. The default settings are
/// equivalent to
///
/// ```rust
/// use burrow::{Auth, ConnectionOptions, Heartbeat};
///
/// # fn default_connection_options() -> ConnectionOptions<Auth> {
/// ConnectionOptions::default()
///     .auth(Auth::default())
///     .virtual_host("/")
///     .locale("en_US")
///     .channel_max(0)
///     .frame_max(0)
///     .heartbeat(Heartbeat::Server)
///     .connection_timeout(None)
///     .information(None)
/// # }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionOptions<Auth: Sasl> {
    pub(crate) auth: Auth,
    pub(crate) virtual_host: String,
    pub(crate) locale: String,
    pub(crate) channel_max: u16,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: Heartbeat,
    pub(crate) connection_timeout: Option<Duration>,
    information: Option<String>,
}

impl<Auth: Sasl> Default for ConnectionOptions<Auth> {
    // NOTE: If we change this, make sure to change the doc comment above.
    fn default() -> Self {
        ConnectionOptions {
            auth: Auth::default(),
            virtual_host: "/".to_string(),
            locale: "en_US".to_string(),
            channel_max: 0,
            frame_max: 0,
            heartbeat: Heartbeat::Server,
            connection_timeout: None,
            information: None,
        }
    }
}

impl<Auth: Sasl> ConnectionOptions<Auth> {
    /// Sets the SASL authentication method.
    pub fn auth(self, auth: Auth) -> Self {
        ConnectionOptions { auth, ..self }
    }

    /// Sets the AMQP virtual host.
    pub fn virtual_host<T: Into<String>>(self, virtual_host: T) -> Self {
        ConnectionOptions {
            virtual_host: virtual_host.into(),
            ..self
        }
    }

    /// Sets the locale. AMQP requires servers support the `en_US` locale
    /// (which is also the default locale for `ConnectionOptions`).
    pub fn locale<T: Into<String>>(self, locale: T) -> Self {
        ConnectionOptions {
            locale: locale.into(),
            ..self
        }
    }

    /// Sets the maximum number of channels that can be opened simultaneously
    /// on this connection. 0 means to let the server choose; otherwise the
    /// lower of the client and server values wins.
    pub fn channel_max(self, channel_max: u16) -> Self {
        ConnectionOptions {
            channel_max,
            ..self
        }
    }

    /// Sets the maximum size in bytes of frames used for this connection.
    /// 0 means to let the server choose; otherwise the lower of the client
    /// and server values wins.
    ///
    /// The frame max says nothing about the maximum size of messages;
    /// messages larger than `frame_max` are broken up into multiple frames.
    ///
    /// Note that AMQP specifies a minimum frame_max of 4096; negotiating a
    /// lower value is an error when opening the connection.
    pub fn frame_max(self, frame_max: u32) -> Self {
        ConnectionOptions { frame_max, ..self }
    }

    /// Sets the heartbeat interval. [`Heartbeat::Server`] defers to whatever
    /// the server asks for; an explicit [`Heartbeat::Seconds`] of 0 disables
    /// heartbeats; any other explicit value resolves to the lower of the
    /// client and server values, except a server value of 0 yields the
    /// client's.
    pub fn heartbeat(self, heartbeat: Heartbeat) -> Self {
        ConnectionOptions { heartbeat, ..self }
    }

    /// Sets the timeout for the initial TCP connection. If None (the
    /// default), there is no timeout.
    pub fn connection_timeout(self, connection_timeout: Option<Duration>) -> Self {
        ConnectionOptions {
            connection_timeout,
            ..self
        }
    }

    /// Sets the "information" string reported to the server during
    /// handshaking. It shows up under "Client properties" of a connection in
    /// the RabbitMQ management interface.
    pub fn information(self, information: Option<String>) -> Self {
        ConnectionOptions {
            information,
            ..self
        }
    }

    pub(crate) fn make_start_ok(&self, start: Start) -> Result<(StartOk, FieldTable)> {
        // helper to search space-separated strings (mechanisms and locales)
        fn server_supports(server: &str, client: &str) -> bool {
            server.split(' ').any(|s| s == client)
        }

        // ensure our requested auth mechanism and locale are available
        let mechanism = self.auth.mechanism();
        if !server_supports(&start.mechanisms, &mechanism) {
            return UnsupportedAuthMechanismSnafu {
                available: start.mechanisms.clone(),
                requested: mechanism,
            }
            .fail();
        }
        if !server_supports(&start.locales, &self.locale) {
            return UnsupportedLocaleSnafu {
                available: start.locales.clone(),
                requested: self.locale.clone(),
            }
            .fail();
        }

        // bundle up info about this crate as client properties
        let mut client_properties = FieldTable::new();
        let mut set_prop = |k: &str, v: String| {
            client_properties.insert(k.to_string(), AMQPValue::LongString(v));
        };
        set_prop("product", env!("CARGO_PKG_NAME").to_string());
        set_prop("version", env!("CARGO_PKG_VERSION").to_string());
        set_prop("platform", "Rust".to_string());
        if let Some(information) = &self.information {
            set_prop("information", information.to_string());
        }
        let mut capabilities = FieldTable::new();
        let mut set_cap = |k: &str| {
            capabilities.insert(k.to_string(), AMQPValue::Boolean(true));
        };
        set_cap("consumer_cancel_notify");
        set_cap("connection.blocked");
        set_cap("publisher_confirms");
        set_cap("authentication_failure_close");
        client_properties.insert(
            "capabilities".to_string(),
            AMQPValue::FieldTable(capabilities),
        );

        Ok((
            StartOk {
                client_properties,
                mechanism,
                response: self.auth.response(),
                locale: self.locale.clone(),
            },
            start.server_properties,
        ))
    }

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

        let channel_max = u16::min(
            promote_0_u16(tune.channel_max),
            promote_0_u16(self.channel_max),
        );
        let frame_max = u32::min(
            promote_0_u32(tune.frame_max),
            promote_0_u32(self.frame_max),
        );

        let heartbeat = match self.heartbeat {
            Heartbeat::Server => tune.heartbeat,
            Heartbeat::Seconds(0) => 0,
            Heartbeat::Seconds(client) if tune.heartbeat == 0 => client,
            Heartbeat::Seconds(client) => u16::min(client, tune.heartbeat),
        };

        if frame_max < u32::from(FRAME_MIN_SIZE) {
            return FrameMaxTooSmallSnafu {
                min: u32::from(FRAME_MIN_SIZE),
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

    pub(crate) fn make_open(&self) -> Open {
        Open {
            virtual_host: self.virtual_host.clone(),
            capabilities: "".to_string(), // reserved
            insist: false,                // reserved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;

    fn tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> Tune {
        Tune {
            channel_max,
            frame_max,
            heartbeat,
        }
    }

    #[test]
    fn channel_max_negotiation() {
        let cases: &[(u16, u16, u16)] = &[
            // (client, server, expected)
            (0, 0, 65535),
            (10, 0, 10),
            (0, 10, 10),
            (20, 10, 10),
            (10, 20, 10),
        ];
        for &(client, server, expected) in cases {
            let options = ConnectionOptions::<Auth>::default().channel_max(client);
            let tune_ok = options.make_tune_ok(tune(server, 1 << 17, 60)).unwrap();
            assert_eq!(tune_ok.channel_max, expected);
        }
    }

    #[test]
    fn frame_max_negotiation() {
        let cases: &[(u32, u32, u32)] = &[
            (0, 0, u32::max_value()),
            (0, 1 << 17, 1 << 17),
            (1 << 20, 1 << 17, 1 << 17),
            (8192, 1 << 17, 8192),
        ];
        for &(client, server, expected) in cases {
            let options = ConnectionOptions::<Auth>::default().frame_max(client);
            let tune_ok = options.make_tune_ok(tune(0, server, 60)).unwrap();
            assert_eq!(tune_ok.frame_max, expected);
        }
    }

    #[test]
    fn heartbeat_negotiation() {
        let cases: &[(Heartbeat, u16, u16)] = &[
            (Heartbeat::Server, 60, 60),
            (Heartbeat::Server, 0, 0),
            (Heartbeat::Seconds(0), 60, 0),
            (Heartbeat::Seconds(30), 0, 30),
            (Heartbeat::Seconds(30), 60, 30),
            (Heartbeat::Seconds(90), 60, 60),
        ];
        for &(client, server, expected) in cases {
            let options = ConnectionOptions::<Auth>::default().heartbeat(client);
            let tune_ok = options.make_tune_ok(tune(0, 1 << 17, server)).unwrap();
            assert_eq!(tune_ok.heartbeat, expected, "client {:?}", client);
        }
    }

    #[test]
    fn unsupported_auth_mechanism() {
        let options = ConnectionOptions::<Auth>::default();

        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: "NOTPLAIN SOMETHINGELSE".to_string(),
            locales: options.locale.clone(),
        };

        let res = options.make_start_ok(start);
        match res.unwrap_err() {
            Error::UnsupportedAuthMechanism { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn unsupported_locale() {
        let options = ConnectionOptions::<Auth>::default().locale("nonexistent");

        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: options.auth.mechanism(),
            locales: "en_US es_ES".to_string(),
        };

        let res = options.make_start_ok(start);
        match res.unwrap_err() {
            Error::UnsupportedLocale { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn frame_max_too_small() {
        let frame_max = u32::from(FRAME_MIN_SIZE) - 1;
        let options = ConnectionOptions::<Auth>::default().frame_max(frame_max);

        let res = options.make_tune_ok(tune(u16::max_value(), 1 << 17, 60));
        match res.unwrap_err() {
            Error::FrameMaxTooSmall { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }
}
