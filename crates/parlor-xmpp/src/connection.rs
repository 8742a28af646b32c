//! Client connection: negotiation state machine and reply correlation.
//!
//! A [`Connection`] owns one [`Channel`] and one [`StanzaReader`] and walks
//! the channel through the RFC 6120 client negotiation:
//!
//! ```text
//! Disconnected -> ChannelOpen -> Authenticated -> ResourceBound
//!              -> SessionEstablished -> Ready
//! ```
//!
//! Every step checks its precondition before touching the wire, so calling
//! an operation out of order fails without changing state. Replies are
//! correlated with [`Connection::wait_for`], which drops every inbound
//! element that does not satisfy the caller's [`Matcher`]. There is no
//! queue of unmatched replies: only one request may be outstanding at a
//! time, which `&mut self` enforces.

use std::time::Duration;

use minidom::Element;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::channel::{Channel, TcpChannel};
use crate::config::ConnectionConfig;
use crate::error::XmppError;
use crate::jid;
use crate::parser::{element_to_string, ns, Frame, StanzaReader};
use crate::sasl;
use crate::stanza::{error_condition, IqType, Stanza};
use crate::xep::xep0030;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Disconnected,
    ChannelOpen,
    Authenticated,
    ResourceBound,
    SessionEstablished,
    Ready,
}

/// Which inbound element satisfies a [`Connection::wait_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// The next complete element, whatever it is.
    Any,
    /// The next element with this local name (`iq`, `features`, ...).
    Tag(String),
    /// The next element whose `id` attribute equals this value.
    Id(String),
}

impl Matcher {
    pub fn tag(name: impl Into<String>) -> Self {
        Matcher::Tag(name.into())
    }

    pub fn id(id: impl Into<String>) -> Self {
        Matcher::Id(id.into())
    }

    pub fn matches(&self, element: &Element) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Tag(name) => element.name() == name.as_str(),
            Matcher::Id(id) => element.attr("id") == Some(id.as_str()),
        }
    }
}

/// Values learned during negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Full JID confirmed by the server at resource binding.
    pub full_jid: Option<String>,
    /// `id` of the most recent server stream header.
    pub stream_id: Option<String>,
    /// MUC component found through service discovery.
    pub muc_server: Option<String>,
}

pub struct Connection<C = TcpChannel>
where
    C: Channel,
{
    config: ConnectionConfig,
    state: ConnectionState,
    channel: Option<C>,
    reader: StanzaReader,
    session: SessionContext,
    stream_open: bool,
    terminated: bool,
}

impl<C> Connection<C>
where
    C: Channel,
{
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            channel: None,
            reader: StanzaReader::new(),
            session: SessionContext::default(),
            stream_open: false,
            terminated: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    fn require(&self, expected: ConnectionState) -> Result<(), XmppError> {
        if self.terminated {
            return Err(XmppError::Disconnected);
        }
        if self.state != expected {
            return Err(XmppError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = ?self.state, to = ?next, "connection state change");
        self.state = next;
    }

    /// Open the channel and, when configured, upgrade it to TLS.
    #[instrument(
        skip(self),
        fields(host = %self.config.host, port = self.config.port),
        name = "xmpp.connection.connect"
    )]
    pub async fn connect(&mut self) -> Result<(), XmppError> {
        self.require(ConnectionState::Disconnected)?;

        let mut channel = C::open(&self.config.address(), self.config.timeouts.connect()).await?;

        if self.config.use_encryption {
            if let Err(error) = channel.upgrade_to_encrypted().await {
                if let Err(close_error) = channel.close().await {
                    debug!(error = %close_error, "failed to close channel after TLS failure");
                }
                return Err(error);
            }
        }

        self.channel = Some(channel);
        self.transition(ConnectionState::ChannelOpen);
        info!(encrypted = self.config.use_encryption, "channel open");
        Ok(())
    }

    /// Open the XML stream and run one SASL exchange.
    #[instrument(skip(self), name = "xmpp.connection.authenticate")]
    pub async fn authenticate(&mut self) -> Result<(), XmppError> {
        self.require(ConnectionState::ChannelOpen)?;
        let response_timeout = self.config.timeouts.response();

        self.open_stream().await?;
        let features = self.wait_for(&Matcher::tag("features"), response_timeout).await?;

        let offered = sasl::offered_mechanisms(&features);
        debug!(mechanisms = ?offered, "server advertised SASL mechanisms");

        let selected = sasl::select_mechanism(&offered).ok_or_else(|| {
            XmppError::auth_failed(format!(
                "no supported SASL mechanism found; server offers: {}",
                offered.iter().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        debug!(mechanism = %selected, "selected SASL mechanism");

        let credentials = sasl::credentials(self.config.local_part(), &self.config.password);
        let mut mechanism = sasl::build_mechanism(selected, &credentials)?;
        let initial = mechanism.initial();
        self.send_element(&sasl::auth_element(selected, &initial)).await?;

        loop {
            let reply = self.wait_for(&Matcher::Any, response_timeout).await?;

            if reply.is("challenge", ns::SASL) {
                let challenge = sasl::decode_payload(&reply)?;
                let response = mechanism.response(&challenge).map_err(|e| {
                    XmppError::auth_failed(format!("SASL challenge-response failed: {e:?}"))
                })?;
                self.send_element(&sasl::response_element(&response)).await?;
            } else if reply.is("success", ns::SASL) {
                let data = sasl::decode_payload(&reply)?;
                if let Err(e) = mechanism.success(&data) {
                    warn!(error = ?e, "server signature verification failed");
                    return Err(XmppError::auth_failed(format!(
                        "server signature verification failed: {e:?}"
                    )));
                }
                break;
            } else if reply.is("failure", ns::SASL) {
                let error = sasl::map_failure(&reply);
                debug!(%error, "SASL authentication failed");
                return Err(error);
            } else {
                debug!(element = reply.name(), "ignoring element during SASL exchange");
            }
        }

        // Authentication restarts the stream; the new features list
        // advertises bind and session.
        self.open_stream().await?;
        self.wait_for(&Matcher::tag("features"), response_timeout).await?;

        self.transition(ConnectionState::Authenticated);
        info!(mechanism = %selected, "authenticated");
        Ok(())
    }

    /// Bind the configured resource and record the server-confirmed full JID.
    #[instrument(skip(self), name = "xmpp.connection.bind")]
    pub async fn bind(&mut self) -> Result<(), XmppError> {
        self.require(ConnectionState::Authenticated)?;

        let mut bind = Element::builder("bind", ns::BIND);
        if !self.config.resource.is_empty() {
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(self.config.resource.clone())
                    .build(),
            );
        }
        let request = Stanza::iq(IqType::Set).with_payload(bind.build());

        let reply = self.request(&request).await?;
        expect_result(&reply, "resource binding")?;

        let full_jid = reply
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("jid", ns::BIND))
            .map(|jid| jid.text().trim().to_string())
            .filter(|jid| !jid.is_empty())
            .unwrap_or_else(|| {
                jid::full_user_id(
                    self.config.local_part(),
                    self.config.domain(),
                    &self.config.resource,
                )
            });

        info!(jid = %full_jid, "resource bound");
        self.session.full_jid = Some(full_jid);
        self.transition(ConnectionState::ResourceBound);
        Ok(())
    }

    #[instrument(skip(self), name = "xmpp.connection.establish_session")]
    pub async fn establish_session(&mut self) -> Result<(), XmppError> {
        self.require(ConnectionState::ResourceBound)?;

        let request = Stanza::iq(IqType::Set)
            .with_to(self.config.domain())
            .with_payload(Element::builder("session", ns::SESSION).build());

        let reply = self.request(&request).await?;
        expect_result(&reply, "session establishment")?;

        self.transition(ConnectionState::SessionEstablished);
        Ok(())
    }

    /// Announce availability. No reply is expected.
    #[instrument(skip(self), name = "xmpp.connection.presence")]
    pub async fn presence(&mut self) -> Result<(), XmppError> {
        self.require(ConnectionState::SessionEstablished)?;
        self.send(&Stanza::presence()).await?;
        self.transition(ConnectionState::Ready);
        info!("session ready");
        Ok(())
    }

    /// Run every negotiation step in order, ending in `Ready`.
    pub async fn negotiate(&mut self) -> Result<(), XmppError> {
        self.connect().await?;
        self.authenticate().await?;
        self.bind().await?;
        self.establish_session().await?;
        self.presence().await
    }

    /// Close the stream and channel. Safe to call in any state, any number
    /// of times. The connection cannot be reconnected afterwards.
    #[instrument(skip(self), name = "xmpp.connection.disconnect")]
    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if self.stream_open {
                if let Err(error) = channel.write(b"</stream:stream>").await {
                    debug!(%error, "failed to send stream close");
                }
            }
            if let Err(error) = channel.close().await {
                debug!(%error, "failed to close channel");
            }
        }

        self.reader.reset();
        self.session = SessionContext::default();
        self.stream_open = false;
        self.terminated = true;

        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Serialize and write one stanza. Legal from `ChannelOpen` onward.
    pub async fn send(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        let bytes = stanza.to_bytes()?;
        debug!(kind = %stanza.kind, id = ?stanza.id(), "sending stanza");
        self.write_raw(&bytes).await
    }

    /// Write a non-stanza top-level element, such as a SASL nonza.
    pub async fn send_element(&mut self, element: &Element) -> Result<(), XmppError> {
        let markup = element_to_string(element)?;
        debug!(element = element.name(), "sending element");
        self.write_raw(markup.as_bytes()).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), XmppError> {
        if self.terminated {
            return Err(XmppError::Disconnected);
        }
        let state = self.state;
        let channel = self.channel.as_mut().ok_or(XmppError::InvalidState {
            expected: ConnectionState::ChannelOpen,
            actual: state,
        })?;

        let written = channel.write(data).await?;
        if written != data.len() {
            return Err(XmppError::transport(format!(
                "short write: {written} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    async fn open_stream(&mut self) -> Result<(), XmppError> {
        let header = format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='{}' xmlns:stream='{}'>",
            self.config.domain(),
            ns::JABBER_CLIENT,
            ns::STREAM
        );
        self.write_raw(header.as_bytes()).await?;
        self.stream_open = true;
        Ok(())
    }

    /// Send an `iq` and wait for the reply carrying the same id.
    async fn request(&mut self, stanza: &Stanza) -> Result<Element, XmppError> {
        let id = stanza
            .id()
            .ok_or_else(|| XmppError::protocol("request stanza has no id"))?
            .to_string();
        self.send(stanza).await?;
        self.wait_for(&Matcher::Id(id), self.config.timeouts.response()).await
    }

    /// Wait until an inbound element satisfies `matcher` or `timeout` passes.
    ///
    /// Elements that do not match are dropped. A stream error or the end of
    /// the stream fails the wait; a timeout leaves the connection state as
    /// it was.
    pub async fn wait_for(
        &mut self,
        matcher: &Matcher,
        timeout: Duration,
    ) -> Result<Element, XmppError> {
        if self.terminated {
            return Err(XmppError::Disconnected);
        }
        if self.channel.is_none() {
            return Err(XmppError::InvalidState {
                expected: ConnectionState::ChannelOpen,
                actual: self.state,
            });
        }

        let deadline = Instant::now() + timeout;
        let poll_interval = self.config.timeouts.poll_interval();

        loop {
            while let Some(frame) = self.reader.next_frame()? {
                match frame {
                    Frame::StreamStart(header) => {
                        debug!(stream_id = ?header.id, "server stream header");
                        self.session.stream_id = header.id;
                    }
                    Frame::StreamEnd => {
                        return Err(XmppError::transport("server closed the stream"));
                    }
                    Frame::Element(element) if element.is("error", ns::STREAM) => {
                        return Err(stream_error(&element));
                    }
                    Frame::Element(element) => {
                        if matcher.matches(&element) {
                            return Ok(element);
                        }
                        debug!(
                            element = element.name(),
                            id = ?element.attr("id"),
                            ?matcher,
                            "dropping unmatched element"
                        );
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(XmppError::Timeout { waited: timeout });
            }

            let Some(channel) = self.channel.as_mut() else {
                return Err(XmppError::transport("channel closed while waiting"));
            };
            if !channel.poll_readable(poll_interval.min(deadline - now)).await? {
                continue;
            }

            let data = channel.read(READ_CHUNK).await?;
            if data.is_empty() {
                return Err(XmppError::transport("connection closed by peer"));
            }
            self.reader.feed(&data);
        }
    }

    /// Ask the account's server whether it hosts Multi-User Chat.
    ///
    /// Any failure, including a timeout, reports `false`.
    #[instrument(skip(self), name = "xmpp.connection.is_muc_supported")]
    pub async fn is_muc_supported(&mut self) -> bool {
        let request = xep0030::disco_info_request(self.config.domain());
        match self
            .request(&request)
            .await
            .and_then(|reply| xep0030::parse_disco_info(&reply))
        {
            Ok(info) => info.supports_muc(),
            Err(error) => {
                warn!(%error, "MUC feature discovery failed");
                false
            }
        }
    }

    /// Find the MUC component among the server's disco items. The answer is
    /// cached for the life of the session.
    #[instrument(skip(self), name = "xmpp.connection.get_muc_server")]
    pub async fn get_muc_server(&mut self) -> Option<String> {
        if let Some(server) = &self.session.muc_server {
            return Some(server.clone());
        }

        let request = xep0030::disco_items_request(self.config.domain());
        let items = match self
            .request(&request)
            .await
            .and_then(|reply| xep0030::parse_disco_items(&reply))
        {
            Ok(items) => items,
            Err(error) => {
                warn!(%error, "MUC service discovery failed");
                return None;
            }
        };

        let server = xep0030::select_muc_service(&items).map(|item| item.jid.clone());
        match &server {
            Some(jid) => info!(muc_server = %jid, "discovered MUC service"),
            None => warn!("server lists no disco items"),
        }
        self.session.muc_server = server.clone();
        server
    }
}

fn expect_result(reply: &Element, step: &str) -> Result<(), XmppError> {
    if reply.name() == "iq" && reply.attr("type") == Some("result") {
        return Ok(());
    }
    let reason = error_condition(reply)
        .or_else(|| reply.attr("type").map(str::to_string))
        .unwrap_or_else(|| reply.name().to_string());
    Err(XmppError::protocol(format!("{step} rejected: {reason}")))
}

fn stream_error(element: &Element) -> XmppError {
    let condition = element
        .children()
        .find(|child| child.ns() == ns::STREAM_ERRORS && child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    XmppError::protocol(format!("stream error: {condition}"))
}
