//! Incremental reader for the inbound XMPP stream.
//!
//! The server's stream is one long-lived XML document whose root
//! (`<stream:stream>`) is only closed at session end. [`StanzaReader`]
//! accumulates raw bytes and hands out complete top-level units as they
//! become available: the stream header, each first-level child element,
//! and the closing stream tag.

use std::str::FromStr;

use minidom::Element;
use tracing::debug;

use crate::error::XmppError;

/// XMPP namespaces
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Service discovery info (XEP-0030)
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery items (XEP-0030)
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Multi-User Chat (XEP-0045)
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    /// MUC admin use case
    pub const MUC_ADMIN: &str = "http://jabber.org/protocol/muc#admin";
    /// MUC owner use case
    pub const MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";
}

const STREAM_TAG: &str = "stream:stream";

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute
    pub to: Option<String>,
    /// The 'from' attribute (server domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// Default namespace of the stream content
    pub xmlns: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from the text of its opening tag.
    ///
    /// The tag is intentionally unclosed, so attributes are pulled out by
    /// hand rather than through a full XML parse.
    pub fn parse(data: &str) -> Result<Self, XmppError> {
        let stream_start = data
            .find("<stream:stream")
            .ok_or_else(|| XmppError::decode("No stream:stream element found"))?;

        let stream_end = data[stream_start..]
            .find('>')
            .map(|i| stream_start + i)
            .ok_or_else(|| XmppError::decode("Incomplete stream header"))?;

        let tag = &data[stream_start..=stream_end];

        Ok(StreamHeader {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
            xmlns: extract_attribute(tag, "xmlns"),
        })
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        for sep in [' ', '\t', '\n', '\r'] {
            let pattern = format!("{sep}{name}={quote}");
            if let Some(start) = tag.find(&pattern) {
                let value_start = start + pattern.len();
                if let Some(value_end) = tag[value_start..].find(quote) {
                    return Some(tag[value_start..value_start + value_end].to_string());
                }
            }
        }
    }
    None
}

/// One complete unit read off the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `<stream:stream ...>` opened (initially, or after a restart)
    StreamStart(StreamHeader),
    /// A complete first-level element: stanza, features, SASL nonza, stream error
    Element(Element),
    /// `</stream:stream>`
    StreamEnd,
}

/// Where the next complete unit ends, if the buffer holds one.
enum Scan {
    Incomplete,
    Complete(usize),
}

/// Accumulates inbound bytes and yields [`Frame`]s.
///
/// Partial units stay buffered until the rest arrives; a malformed unit is
/// consumed and reported as [`XmppError::Decode`] without disturbing what
/// follows it.
#[derive(Debug, Default)]
pub struct StanzaReader {
    buffer: Vec<u8>,
    default_ns: Option<String>,
}

impl StanzaReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the channel.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Discard buffered bytes and stream state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.default_ns = None;
    }

    /// Bytes waiting for the rest of their unit.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next complete unit, or `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, XmppError> {
        loop {
            self.skip_text();

            if self.buffer.len() < 2 {
                return Ok(None);
            }

            match self.buffer[1] {
                b'?' => match find(&self.buffer, b"?>", 2) {
                    Some(end) => {
                        self.consume(end + 2);
                        continue;
                    }
                    None => return Ok(None),
                },
                b'!' => {
                    if self.buffer.starts_with(b"<!--") {
                        match find(&self.buffer, b"-->", 4) {
                            Some(end) => {
                                self.consume(end + 3);
                                continue;
                            }
                            None => return Ok(None),
                        }
                    }
                    if b"<!--".starts_with(&self.buffer) {
                        return Ok(None);
                    }
                    let end = self.next_lt(1);
                    self.consume(end);
                    return Err(XmppError::decode("unexpected markup declaration in stream"));
                }
                b'/' => return self.closing_tag(),
                first if is_name_start(first) => return self.element(),
                _ => {
                    let end = self.next_lt(1);
                    let junk = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
                    self.consume(end);
                    return Err(XmppError::decode(format!("invalid markup: {junk}")));
                }
            }
        }
    }

    fn closing_tag(&mut self) -> Result<Option<Frame>, XmppError> {
        let Some(gt) = self.buffer.iter().position(|&b| b == b'>') else {
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&self.buffer[2..gt]).trim().to_string();
        self.consume(gt + 1);

        if name == STREAM_TAG {
            debug!("stream closed by server");
            Ok(Some(Frame::StreamEnd))
        } else {
            Err(XmppError::decode(format!("unbalanced closing tag </{name}>")))
        }
    }

    fn element(&mut self) -> Result<Option<Frame>, XmppError> {
        let Some(tag_end) = tag_end(&self.buffer, 0) else {
            return Ok(None);
        };

        if self.buffer[1..].starts_with(STREAM_TAG.as_bytes())
            && matches!(
                self.buffer.get(1 + STREAM_TAG.len()),
                Some(b' ' | b'\t' | b'\r' | b'\n' | b'>' | b'/')
            )
        {
            let tag = self.take_utf8(tag_end + 1)?;
            let header = StreamHeader::parse(&tag)?;
            self.default_ns = header.xmlns.clone();
            return Ok(Some(Frame::StreamStart(header)));
        }

        match scan_element(&self.buffer) {
            Scan::Incomplete => Ok(None),
            Scan::Complete(end) => {
                let fragment = self.take_utf8(end)?;
                self.parse_fragment(&fragment).map(|el| Some(Frame::Element(el)))
            }
        }
    }

    /// Parse one first-level element inside an envelope that re-declares the
    /// stream's namespaces, so prefixed children (`stream:features`) and
    /// unqualified stanzas resolve the same way they do on the wire.
    fn parse_fragment(&self, fragment: &str) -> Result<Element, XmppError> {
        let default_ns = self.default_ns.as_deref().unwrap_or(ns::JABBER_CLIENT);
        let document = format!(
            "<stream:stream xmlns='{default_ns}' xmlns:stream='{}'>{fragment}</stream:stream>",
            ns::STREAM
        );

        let root = Element::from_str(&document)
            .map_err(|e| XmppError::decode(format!("malformed element: {e}")))?;

        root.children()
            .next()
            .cloned()
            .ok_or_else(|| XmppError::decode("empty element"))
    }

    fn take_utf8(&mut self, len: usize) -> Result<String, XmppError> {
        let unit: Vec<u8> = self.buffer.drain(..len).collect();
        String::from_utf8(unit).map_err(|e| XmppError::decode(format!("invalid UTF-8: {e}")))
    }

    /// Drop character data between first-level elements (whitespace keepalives).
    fn skip_text(&mut self) {
        let start = self
            .buffer
            .iter()
            .position(|&b| b == b'<')
            .unwrap_or(self.buffer.len());
        self.consume(start);
    }

    fn next_lt(&self, from: usize) -> usize {
        self.buffer[from..]
            .iter()
            .position(|&b| b == b'<')
            .map_or(self.buffer.len(), |i| from + i)
    }

    fn consume(&mut self, len: usize) {
        self.buffer.drain(..len);
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || b >= 0x80
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

/// Index of the `>` closing the tag opened at `start`, skipping quoted values.
fn tag_end(buf: &[u8], start: usize) -> Option<usize> {
    let mut quote = None;
    for (i, &b) in buf.iter().enumerate().skip(start + 1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

/// Tag name starting at `from`.
fn tag_name(buf: &[u8], from: usize) -> &[u8] {
    let len = buf[from..]
        .iter()
        .position(|&b| matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'/' | b'>'))
        .unwrap_or(buf.len() - from);
    &buf[from..from + len]
}

/// Find the end of the element starting at offset 0 by tracking open tags.
///
/// A closing tag for an outer element also closes everything inside it; one
/// that matches no open element ends the unit there. Either way a malformed
/// unit fails to parse on its own instead of absorbing the rest of the stream.
fn scan_element(buf: &[u8]) -> Scan {
    let mut open: Vec<&[u8]> = Vec::new();
    let mut i = 0;

    loop {
        let Some(lt) = buf[i..].iter().position(|&b| b == b'<').map(|p| i + p) else {
            return Scan::Incomplete;
        };
        let rest = &buf[lt..];
        if rest.len() < 2 {
            return Scan::Incomplete;
        }

        let skip_to = |marker: &[u8], close: &[u8]| -> Option<usize> {
            find(buf, close, lt + marker.len()).map(|end| end + close.len())
        };

        i = match rest[1] {
            b'!' if rest.starts_with(b"<!--") => match skip_to(b"<!--", b"-->") {
                Some(next) => next,
                None => return Scan::Incomplete,
            },
            b'!' if rest.starts_with(b"<![CDATA[") => match skip_to(b"<![CDATA[", b"]]>") {
                Some(next) => next,
                None => return Scan::Incomplete,
            },
            b'!' if b"<![CDATA[".starts_with(rest) || b"<!--".starts_with(rest) => {
                return Scan::Incomplete;
            }
            b'?' => match skip_to(b"<?", b"?>") {
                Some(next) => next,
                None => return Scan::Incomplete,
            },
            b'/' => {
                let Some(gt) = tag_end(buf, lt) else {
                    return Scan::Incomplete;
                };
                let name = tag_name(buf, lt + 2);
                match open.iter().rposition(|&tag| tag == name) {
                    Some(depth) => open.truncate(depth),
                    None => return Scan::Complete(gt + 1),
                }
                if open.is_empty() {
                    return Scan::Complete(gt + 1);
                }
                gt + 1
            }
            _ => {
                let Some(gt) = tag_end(buf, lt) else {
                    return Scan::Incomplete;
                };
                if buf[gt - 1] != b'/' {
                    open.push(tag_name(buf, lt + 1));
                } else if open.is_empty() {
                    return Scan::Complete(gt + 1);
                }
                gt + 1
            }
        };
    }
}

/// Serialize an element to its markup.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::decode(format!("Failed to serialize element: {e}")))?;
    String::from_utf8(output).map_err(|e| XmppError::decode(format!("Invalid UTF-8: {e}")))
}
