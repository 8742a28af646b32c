//! Outbound and inbound stanza values.

use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;

/// The three stanza kinds of RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Iq,
    Presence,
    Message,
}

impl StanzaKind {
    pub fn name(&self) -> &'static str {
        match self {
            StanzaKind::Iq => "iq",
            StanzaKind::Presence => "presence",
            StanzaKind::Message => "message",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "iq" => Some(StanzaKind::Iq),
            "presence" => Some(StanzaKind::Presence),
            "message" => Some(StanzaKind::Message),
            _ => None,
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `type` values of an `iq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

/// Attributes shared by every stanza kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StanzaAttrs {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub stanza_type: Option<String>,
}

/// A stanza: kind, common attributes, and namespaced payload children.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    pub kind: StanzaKind,
    pub attrs: StanzaAttrs,
    pub payloads: Vec<Element>,
}

/// Fresh stanza id. Ids are always chosen by the sender.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Stanza {
    pub fn new(kind: StanzaKind) -> Self {
        Self {
            kind,
            attrs: StanzaAttrs::default(),
            payloads: Vec::new(),
        }
    }

    /// An `iq` of the given type carrying a freshly generated id.
    pub fn iq(iq_type: IqType) -> Self {
        Self::new(StanzaKind::Iq)
            .with_type(iq_type.as_str())
            .with_id(new_id())
    }

    pub fn presence() -> Self {
        Self::new(StanzaKind::Presence)
    }

    pub fn message() -> Self {
        Self::new(StanzaKind::Message)
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.attrs.from = Some(from.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.attrs.to = Some(to.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.attrs.id = Some(id.into());
        self
    }

    pub fn with_type(mut self, stanza_type: impl Into<String>) -> Self {
        self.attrs.stanza_type = Some(stanza_type.into());
        self
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    /// Message body shorthand.
    pub fn with_body(self, body: impl Into<String>) -> Self {
        let body = Element::builder("body", ns::JABBER_CLIENT)
            .append(body.into())
            .build();
        self.with_payload(body)
    }

    pub fn id(&self) -> Option<&str> {
        self.attrs.id.as_deref()
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.attrs.stanza_type.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder(self.kind.name(), ns::JABBER_CLIENT);
        let attrs = [
            ("from", &self.attrs.from),
            ("to", &self.attrs.to),
            ("id", &self.attrs.id),
            ("type", &self.attrs.stanza_type),
        ];
        for (name, value) in attrs {
            if let Some(value) = value {
                builder = builder.attr(name, value.as_str());
            }
        }
        builder.append_all(self.payloads.iter().cloned()).build()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, XmppError> {
        let mut payload = Vec::new();
        self.to_element().write_to(&mut payload).map_err(|error| {
            XmppError::decode(format!(
                "failed to serialize <{}/> stanza: {error}",
                self.kind
            ))
        })?;
        Ok(payload)
    }
}

impl From<&Stanza> for Element {
    fn from(value: &Stanza) -> Self {
        value.to_element()
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        value.to_element()
    }
}

impl TryFrom<Element> for Stanza {
    type Error = XmppError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        let kind = StanzaKind::from_name(element.name())
            .filter(|_| element.ns() == ns::JABBER_CLIENT)
            .ok_or_else(|| {
                XmppError::decode(format!(
                    "unexpected stanza element <{}/> in namespace {}",
                    element.name(),
                    element.ns()
                ))
            })?;

        let attr = |name: &str| element.attr(name).map(str::to_string);
        let attrs = StanzaAttrs {
            from: attr("from"),
            to: attr("to"),
            id: attr("id"),
            stanza_type: attr("type"),
        };

        Ok(Stanza {
            kind,
            attrs,
            payloads: element.children().cloned().collect(),
        })
    }
}

/// Defined condition of a stanza-level `<error/>` child, e.g. `item-not-found`.
pub fn error_condition(element: &Element) -> Option<String> {
    let error = element.get_child("error", ns::JABBER_CLIENT)?;
    error
        .children()
        .find(|child| child.ns() == ns::STANZAS && child.name() != "text")
        .map(|child| child.name().to_string())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn iq_gets_generated_id_and_type() {
        let a = Stanza::iq(IqType::Get);
        let b = Stanza::iq(IqType::Get);
        assert_eq!(a.stanza_type(), Some("get"));
        assert!(a.id().is_some());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn serializes_attributes_and_payload() {
        let query = Element::builder("query", ns::DISCO_INFO).build();
        let stanza = Stanza::iq(IqType::Get)
            .with_id("disco-1")
            .with_to("example.com")
            .with_payload(query);

        let element = stanza.to_element();
        assert!(element.is("iq", ns::JABBER_CLIENT));
        assert_eq!(element.attr("id"), Some("disco-1"));
        assert_eq!(element.attr("to"), Some("example.com"));
        assert_eq!(element.attr("from"), None);
        assert!(element.get_child("query", ns::DISCO_INFO).is_some());

        let text = String::from_utf8(stanza.to_bytes().unwrap()).unwrap();
        assert!(text.starts_with("<iq"));
        assert!(text.contains("disco#info"));
    }

    #[test]
    fn presence_without_attributes_is_empty_element() {
        let element = Stanza::presence().to_element();
        assert_eq!(element.name(), "presence");
        assert_eq!(element.attrs().count(), 0);
        assert_eq!(element.children().count(), 0);
    }

    #[test]
    fn parses_inbound_stanza() {
        let element = Element::from_str(
            "<message xmlns='jabber:client' from='a@example.com' id='m1' type='chat'><body>hi</body></message>",
        )
        .unwrap();
        let stanza = Stanza::try_from(element).unwrap();
        assert_eq!(stanza.kind, StanzaKind::Message);
        assert_eq!(stanza.attrs.from.as_deref(), Some("a@example.com"));
        assert_eq!(stanza.payloads.len(), 1);
        assert_eq!(stanza.payloads[0].text(), "hi");
    }

    #[test]
    fn rejects_non_stanza_elements() {
        let element =
            Element::from_str("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").unwrap();
        assert!(matches!(
            Stanza::try_from(element),
            Err(XmppError::Decode(_))
        ));
    }

    #[test]
    fn extracts_error_condition() {
        let element = Element::from_str(
            "<iq xmlns='jabber:client' type='error' id='x'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        )
        .unwrap();
        assert_eq!(error_condition(&element).as_deref(), Some("item-not-found"));
    }
}
