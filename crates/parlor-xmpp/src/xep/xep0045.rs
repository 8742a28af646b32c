//! XEP-0045: Multi-User Chat (owner and admin use cases).
//!
//! Every operation is one request, sent from the account's bare JID,
//! followed by one wait on the underlying [`Connection`]. Replies are
//! received but, apart from the member list, not interpreted.
//!
//! Known limitation: `grant_member` waits for the next `iq` while
//! `revoke_member` and `get_member_list` take the next element of any
//! kind. Both drop anything that arrives first and does not match.

use std::collections::BTreeMap;
use std::time::Duration;

use minidom::Element;
use tracing::{debug, info, instrument, warn};

use crate::channel::{Channel, TcpChannel};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionState, Matcher};
use crate::error::XmppError;
use crate::jid;
use crate::parser::ns;
use crate::stanza::{error_condition, IqType, Stanza};

/// Room management for one authenticated session.
pub struct Muc<C = TcpChannel>
where
    C: Channel,
{
    connection: Connection<C>,
    muc_server: String,
    realm: String,
    from: String,
}

impl<C> Muc<C>
where
    C: Channel,
{
    /// Wrap a `Ready` connection.
    ///
    /// `muc_server` (or the configured one) is used as-is; otherwise the
    /// server is asked through service discovery. The connection is
    /// disconnected before any error is returned.
    #[instrument(skip(connection), name = "xmpp.muc.new")]
    pub async fn new(
        mut connection: Connection<C>,
        muc_server: Option<String>,
    ) -> Result<Self, XmppError> {
        if connection.state() != ConnectionState::Ready {
            let actual = connection.state();
            connection.disconnect().await;
            return Err(XmppError::InvalidState {
                expected: ConnectionState::Ready,
                actual,
            });
        }

        let muc_server = match muc_server.or_else(|| connection.config().muc_server.clone()) {
            Some(server) => server,
            None => match discover_muc_server(&mut connection).await {
                Ok(server) => server,
                Err(error) => {
                    warn!(%error, "server does not offer Multi-User Chat");
                    connection.disconnect().await;
                    return Err(error);
                }
            },
        };

        let realm = connection.config().domain().to_string();
        let from = connection.config().bare_jid();
        info!(%muc_server, "MUC ready");

        Ok(Self {
            connection,
            muc_server,
            realm,
            from,
        })
    }

    /// Run the full negotiation for `config` and wrap the result.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, XmppError> {
        let mut connection = Connection::new(config);
        if let Err(error) = connection.negotiate().await {
            connection.disconnect().await;
            return Err(error);
        }
        Self::new(connection, None).await
    }

    pub fn muc_server(&self) -> &str {
        &self.muc_server
    }

    pub fn connection(&self) -> &Connection<C> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection<C> {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection<C> {
        self.connection
    }

    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await;
    }

    /// `user@realm[/resource]`
    pub fn full_user_id(&self, user: &str, resource: &str) -> String {
        jid::full_user_id(user, &self.realm, resource)
    }

    /// `room@muc_server[/nickname]`
    pub fn full_room_id(&self, room: &str, nickname: &str) -> String {
        jid::full_room_id(room, &self.muc_server, nickname)
    }

    fn response_timeout(&self) -> Duration {
        self.connection.config().timeouts.response()
    }

    fn ensure_ready(&self) -> Result<(), XmppError> {
        match self.connection.state() {
            ConnectionState::Ready => Ok(()),
            actual => Err(XmppError::InvalidState {
                expected: ConnectionState::Ready,
                actual,
            }),
        }
    }

    /// Send `stanza` from the account's bare JID and wait for one reply.
    async fn round_trip(&mut self, stanza: Stanza, matcher: Matcher) -> Result<Element, XmppError> {
        self.ensure_ready()?;
        let stanza = stanza.with_from(self.from.clone());
        self.connection.send(&stanza).await?;
        let timeout = self.response_timeout();
        self.connection.wait_for(&matcher, timeout).await
    }

    /// Join (and thereby create) `room` as `nickname`.
    #[instrument(skip(self), name = "xmpp.muc.create_room")]
    pub async fn create_room(&mut self, room: &str, nickname: &str) -> Result<Element, XmppError> {
        let presence = create_room_presence(&self.from, &self.full_room_id(room, nickname));
        let reply = self.round_trip(presence, Matcher::Any).await?;
        debug!(reply = reply.name(), "response when creating room");
        Ok(reply)
    }

    #[instrument(skip(self), name = "xmpp.muc.destroy_room")]
    pub async fn destroy_room(&mut self, room: &str, reason: &str) -> Result<Element, XmppError> {
        let request = destroy_room_request(&self.full_room_id(room, ""), reason);
        let reply = self.round_trip(request, Matcher::Any).await?;
        debug!(reply = reply.name(), "response when destroying room");
        Ok(reply)
    }

    /// Not supported; always fails with [`XmppError::NotImplemented`].
    pub async fn rename_room(&mut self, room: &str, name: &str) -> Result<(), XmppError> {
        warn!(%room, %name, "changing chatroom names is not implemented");
        Err(XmppError::NotImplemented("rename_room"))
    }

    #[instrument(skip(self), name = "xmpp.muc.grant_member")]
    pub async fn grant_member(
        &mut self,
        room: &str,
        user: &str,
        reason: &str,
    ) -> Result<Element, XmppError> {
        let request = affiliation_request(
            &self.full_room_id(room, ""),
            &self.full_user_id(user, ""),
            "member",
            reason,
        );
        let reply = self.round_trip(request, Matcher::tag("iq")).await?;
        debug!(reply_type = ?reply.attr("type"), "response when granting membership");
        Ok(reply)
    }

    #[instrument(skip(self), name = "xmpp.muc.revoke_member")]
    pub async fn revoke_member(
        &mut self,
        room: &str,
        user: &str,
        reason: &str,
    ) -> Result<Element, XmppError> {
        let request = affiliation_request(
            &self.full_room_id(room, ""),
            &self.full_user_id(user, ""),
            "none",
            reason,
        );
        let reply = self.round_trip(request, Matcher::Any).await?;
        debug!(reply_type = ?reply.attr("type"), "response when revoking membership");
        Ok(reply)
    }

    /// Members of `room`, keyed by JID local part.
    ///
    /// An error reply yields an empty map; a missing reply is still a timeout.
    #[instrument(skip(self), name = "xmpp.muc.get_member_list")]
    pub async fn get_member_list(
        &mut self,
        room: &str,
    ) -> Result<BTreeMap<String, String>, XmppError> {
        let request = member_list_request(&self.full_room_id(room, ""));
        let reply = self.round_trip(request, Matcher::Any).await?;
        Ok(parse_member_list(&reply))
    }
}

async fn discover_muc_server<C: Channel>(
    connection: &mut Connection<C>,
) -> Result<String, XmppError> {
    if !connection.is_muc_supported().await {
        return Err(XmppError::capability(
            "server does not advertise Multi-User Chat",
        ));
    }
    connection
        .get_muc_server()
        .await
        .ok_or_else(|| XmppError::capability("no Multi-User Chat service found"))
}

fn reason_element(reason: &str, namespace: &str) -> Option<Element> {
    (!reason.is_empty()).then(|| {
        Element::builder("reason", namespace)
            .append(reason.to_string())
            .build()
    })
}

/// Presence that enters `room_jid` (`room@service/nick`), creating it if needed.
pub fn create_room_presence(from: &str, room_jid: &str) -> Stanza {
    Stanza::presence()
        .with_from(from)
        .with_to(room_jid)
        .with_payload(Element::builder("x", ns::MUC).build())
}

pub fn destroy_room_request(room_jid: &str, reason: &str) -> Stanza {
    let mut destroy = Element::builder("destroy", ns::MUC_OWNER).attr("jid", room_jid);
    if let Some(reason) = reason_element(reason, ns::MUC_OWNER) {
        destroy = destroy.append(reason);
    }
    let query = Element::builder("query", ns::MUC_OWNER)
        .append(destroy.build())
        .build();

    Stanza::iq(IqType::Set).with_to(room_jid).with_payload(query)
}

/// Set `user_jid`'s affiliation in `room_jid` (`member` grants, `none` revokes).
pub fn affiliation_request(
    room_jid: &str,
    user_jid: &str,
    affiliation: &str,
    reason: &str,
) -> Stanza {
    let mut item = Element::builder("item", ns::MUC_ADMIN)
        .attr("affiliation", affiliation)
        .attr("jid", user_jid);
    if let Some(reason) = reason_element(reason, ns::MUC_ADMIN) {
        item = item.append(reason);
    }
    let query = Element::builder("query", ns::MUC_ADMIN)
        .append(item.build())
        .build();

    Stanza::iq(IqType::Set).with_to(room_jid).with_payload(query)
}

pub fn member_list_request(room_jid: &str) -> Stanza {
    let item = Element::builder("item", ns::MUC_ADMIN)
        .attr("affiliation", "member")
        .build();
    let query = Element::builder("query", ns::MUC_ADMIN).append(item).build();

    Stanza::iq(IqType::Get).with_to(room_jid).with_payload(query)
}

/// Map `query/item[@jid]` local parts to their affiliation.
pub fn parse_member_list(reply: &Element) -> BTreeMap<String, String> {
    if reply.attr("type") == Some("error") {
        debug!(condition = ?error_condition(reply), "member list request failed");
        return BTreeMap::new();
    }

    let Some(query) = reply.get_child("query", ns::MUC_ADMIN) else {
        return BTreeMap::new();
    };

    query
        .children()
        .filter(|child| child.is("item", ns::MUC_ADMIN))
        .filter_map(|item| {
            let jid = item.attr("jid")?;
            let affiliation = item.attr("affiliation").unwrap_or_default();
            Some((jid::local_part(jid).to_string(), affiliation.to_string()))
        })
        .collect()
}
