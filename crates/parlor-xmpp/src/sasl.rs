//! SASL mechanism selection and the `<auth/>`/`<response/>` nonzas.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use minidom::Element;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use crate::error::XmppError;
use crate::parser::ns;

/// SASL mechanisms this client can run, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    const BY_STRENGTH: [SelectedMechanism; 3] = [
        SelectedMechanism::ScramSha256,
        SelectedMechanism::ScramSha1,
        SelectedMechanism::Plain,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The strongest mechanism the server offers, if any is supported.
pub fn select_mechanism(offered: &HashSet<String>) -> Option<SelectedMechanism> {
    SelectedMechanism::BY_STRENGTH
        .into_iter()
        .find(|mechanism| offered.contains(mechanism.name()))
}

/// Mechanism names offered in a `<stream:features/>` element.
pub fn offered_mechanisms(features: &Element) -> HashSet<String> {
    features
        .get_child("mechanisms", ns::SASL)
        .map(|mechanisms| {
            mechanisms
                .children()
                .filter(|child| child.is("mechanism", ns::SASL))
                .map(|child| child.text().trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Client credentials for `username` (local part) and `password`.
pub fn credentials(username: &str, password: &str) -> Credentials {
    Credentials::default()
        .with_username(username)
        .with_password(password)
        .with_channel_binding(ChannelBinding::Unsupported)
}

pub fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, XmppError> {
    match selected {
        SelectedMechanism::ScramSha256 => boxed::<Scram<Sha256>>(selected, credentials),
        SelectedMechanism::ScramSha1 => boxed::<Scram<Sha1>>(selected, credentials),
        SelectedMechanism::Plain => boxed::<Plain>(selected, credentials),
    }
}

fn boxed<M>(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, XmppError>
where
    M: Mechanism + Send + 'static,
{
    let mechanism = M::from_credentials(credentials.clone()).map_err(|e| {
        XmppError::auth_failed(format!("failed to initialize {selected}: {e:?}"))
    })?;
    Ok(Box::new(mechanism))
}

/// Base64 payload of a SASL nonza; an empty payload is sent as `=`.
fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        STANDARD.encode(data)
    }
}

/// Decode the text of `<challenge/>` or `<success/>`.
pub fn decode_payload(element: &Element) -> Result<Vec<u8>, XmppError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(text)
        .map_err(|e| XmppError::decode(format!("invalid base64 in <{}/>: {e}", element.name())))
}

pub fn auth_element(mechanism: SelectedMechanism, initial: &[u8]) -> Element {
    Element::builder("auth", ns::SASL)
        .attr("mechanism", mechanism.name())
        .append(encode_payload(initial))
        .build()
}

pub fn response_element(data: &[u8]) -> Element {
    Element::builder("response", ns::SASL)
        .append(encode_payload(data))
        .build()
}

/// Map a `<failure/>` to an authentication error naming its condition.
pub fn map_failure(failure: &Element) -> XmppError {
    let condition = failure
        .children()
        .find(|child| child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let text = failure
        .get_child("text", ns::SASL)
        .map(|t| t.text())
        .unwrap_or_default();

    if text.is_empty() {
        XmppError::auth_failed(condition)
    } else {
        XmppError::auth_failed(format!("{condition}: {text}"))
    }
}
