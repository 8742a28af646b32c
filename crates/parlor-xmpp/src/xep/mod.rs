//! XMPP extension protocols used by the client.

pub mod xep0030;
pub mod xep0045;
