//! # parlor-xmpp
//!
//! XMPP client core for Parlor: connection negotiation and group chat
//! room management.
//!
//! ## Architecture
//!
//! - **Channel**: byte transport to the server (TCP, optionally upgraded to TLS)
//! - **StanzaReader**: incremental framing of the inbound XML stream
//! - **Connection**: negotiation state machine plus request/reply correlation
//! - **Muc**: room lifecycle and membership on top of a ready connection
//!
//! ## XEP Support
//!
//! - RFC 6120 (XMPP Core): SASL, resource binding, legacy session
//! - XEP-0030 (Service Discovery), to locate the MUC component
//! - XEP-0045 (Multi-User Chat), owner and admin use cases
//!
//! ```no_run
//! use parlor_xmpp::{ConnectionConfig, Muc};
//!
//! # async fn run() -> Result<(), parlor_xmpp::XmppError> {
//! let config = ConnectionConfig::new("alice@example.com", "secret", "xmpp.example.com")
//!     .with_encryption(true);
//! let mut muc: Muc = Muc::connect(config).await?;
//! muc.create_room("lobby", "alice").await?;
//! muc.grant_member("lobby", "bob", "welcome").await?;
//! let members = muc.get_member_list("lobby").await?;
//! muc.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod jid;
pub mod parser;
pub mod sasl;
pub mod stanza;
pub mod xep;

pub use channel::{Channel, TcpChannel};
pub use config::{
    load_config_from, load_config_from_str, ConfigError, ConnectionConfig, TimeoutConfig,
};
pub use connection::{Connection, ConnectionState, Matcher, SessionContext};
pub use error::XmppError;
pub use parser::{Frame, StanzaReader, StreamHeader};
pub use sasl::SelectedMechanism;
pub use stanza::{IqType, Stanza, StanzaAttrs, StanzaKind};
pub use xep::xep0045::Muc;
