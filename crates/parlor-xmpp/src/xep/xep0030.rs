//! XEP-0030: Service Discovery (client side).
//!
//! Only what MUC discovery needs: `disco#info` to learn whether the server
//! hosts group chat, and `disco#items` to find the component that does.

use std::collections::BTreeSet;

use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;
use crate::stanza::{error_condition, IqType, Stanza};

/// Service labels conventionally used for MUC components.
const MUC_SERVICE_PREFIXES: &[&str] = &["conference.", "muc.", "chat.", "rooms."];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: BTreeSet<String>,
}

impl DiscoInfo {
    pub fn has_feature(&self, var: &str) -> bool {
        self.features.contains(var)
    }

    /// True when the entity advertises the MUC feature or a conference identity.
    pub fn supports_muc(&self) -> bool {
        self.has_feature(ns::MUC)
            || self
                .identities
                .iter()
                .any(|identity| identity.category == "conference")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoItem {
    pub jid: String,
    pub name: Option<String>,
}

pub fn disco_info_request(to: &str) -> Stanza {
    Stanza::iq(IqType::Get)
        .with_to(to)
        .with_payload(Element::builder("query", ns::DISCO_INFO).build())
}

pub fn disco_items_request(to: &str) -> Stanza {
    Stanza::iq(IqType::Get)
        .with_to(to)
        .with_payload(Element::builder("query", ns::DISCO_ITEMS).build())
}

fn result_query<'a>(reply: &'a Element, query_ns: &str) -> Result<&'a Element, XmppError> {
    if reply.attr("type") != Some("result") {
        let condition = error_condition(reply).unwrap_or_else(|| "unexpected reply".to_string());
        return Err(XmppError::protocol(format!("discovery failed: {condition}")));
    }
    reply
        .get_child("query", query_ns)
        .ok_or_else(|| XmppError::protocol("discovery result has no query"))
}

pub fn parse_disco_info(reply: &Element) -> Result<DiscoInfo, XmppError> {
    let query = result_query(reply, ns::DISCO_INFO)?;
    let mut info = DiscoInfo::default();

    for child in query.children() {
        if child.is("identity", ns::DISCO_INFO) {
            info.identities.push(Identity {
                category: child.attr("category").unwrap_or_default().to_string(),
                kind: child.attr("type").unwrap_or_default().to_string(),
                name: child.attr("name").map(str::to_string),
            });
        } else if child.is("feature", ns::DISCO_INFO) {
            if let Some(var) = child.attr("var") {
                info.features.insert(var.to_string());
            }
        }
    }

    Ok(info)
}

pub fn parse_disco_items(reply: &Element) -> Result<Vec<DiscoItem>, XmppError> {
    let query = result_query(reply, ns::DISCO_ITEMS)?;
    Ok(query
        .children()
        .filter(|child| child.is("item", ns::DISCO_ITEMS))
        .filter_map(|child| {
            child.attr("jid").map(|jid| DiscoItem {
                jid: jid.to_string(),
                name: child.attr("name").map(str::to_string),
            })
        })
        .collect())
}

/// Pick the item most likely to be the MUC component: the first whose JID
/// starts with a conventional MUC label, otherwise the first item.
pub fn select_muc_service(items: &[DiscoItem]) -> Option<&DiscoItem> {
    items
        .iter()
        .find(|item| {
            MUC_SERVICE_PREFIXES
                .iter()
                .any(|prefix| item.jid.starts_with(prefix))
        })
        .or_else(|| items.first())
}
