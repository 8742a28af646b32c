//! Test utilities: an in-memory scripted XMPP server.
//!
//! [`ScriptedChannel`] implements [`Channel`] without any sockets. Each
//! write is handed to a [`FakeServer`], whose replies are queued for the
//! next reads. Tests install the server for the current thread before the
//! connection opens its channel; `#[tokio::test]` runs each test on its own
//! thread, so installations never leak between tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use minidom::Element;
use parlor_xmpp::parser::ns;
use pbkdf2::pbkdf2_hmac;
use sha1::{Digest, Sha1};
use parlor_xmpp::{Channel, Connection, ConnectionConfig, XmppError};

/// Handler for stanzas the built-in negotiation does not answer.
pub type StanzaHandler = Box<dyn FnMut(&Element) -> Vec<String> + Send>;

/// What the client did to the channel.
#[derive(Debug, Default)]
pub struct ChannelLog {
    pub opened: Vec<String>,
    pub written: Vec<String>,
    pub upgraded: bool,
    pub closed: usize,
}

pub type SharedLog = Arc<Mutex<ChannelLog>>;

const SCRAM_SALT: &[u8] = b"parlor-fixture-salt";
const SCRAM_ITERATIONS: u32 = 4096;

/// Server half of an in-flight SCRAM-SHA-1 exchange.
pub(crate) struct ScramExchange {
    client_first_bare: String,
    server_first: String,
}

/// Scripted server answering the client negotiation.
pub struct FakeServer {
    /// JID returned from resource binding; `None` omits the `<jid/>` child.
    pub bound_jid: Option<String>,
    pub mechanisms: Vec<String>,
    pub accept_auth: bool,
    /// Password the SCRAM proof is checked against.
    pub password: String,
    /// Corrupt the server signature sent with SCRAM `<success/>`.
    pub forge_server_signature: bool,
    /// Elements sent ahead of every SASL challenge.
    pub interleave: Vec<String>,
    pub fail_tls: bool,
    pub muc_supported: bool,
    pub muc_items: Vec<String>,
    /// Split every reply into chunks of this many bytes.
    pub chunk_size: Option<usize>,
    pub handler: Option<StanzaHandler>,
    pub(crate) authenticated: bool,
    pub(crate) stream_count: usize,
    pub(crate) scram: Option<ScramExchange>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            bound_jid: Some("a@example.com/r".to_string()),
            mechanisms: vec!["PLAIN".to_string()],
            accept_auth: true,
            password: "p".to_string(),
            forge_server_signature: false,
            interleave: Vec::new(),
            fail_tls: false,
            muc_supported: true,
            muc_items: vec![
                "upload.example.com".to_string(),
                "conference.example.com".to_string(),
            ],
            chunk_size: None,
            handler: None,
            authenticated: false,
            stream_count: 0,
            scram: None,
        }
    }
}

impl FakeServer {
    pub fn with_handler(
        mut self,
        handler: impl FnMut(&Element) -> Vec<String> + Send + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    fn respond(&mut self, written: &str) -> Vec<String> {
        if written.contains("<stream:stream") {
            return self.open_stream();
        }
        if written.starts_with("</stream:stream") {
            return vec!["</stream:stream>".to_string()];
        }

        let element = match Element::from_str(written) {
            Ok(element) => element,
            Err(e) => panic!("client wrote malformed XML {written:?}: {e}"),
        };

        if element.is("auth", ns::SASL) {
            if element.attr("mechanism") == Some("SCRAM-SHA-1") {
                return self.scram_first(&element.text());
            }
            return if self.accept_auth {
                self.authenticated = true;
                vec![format!("<success xmlns='{}'/>", ns::SASL)]
            } else {
                vec![not_authorized()]
            };
        }

        if element.is("response", ns::SASL) {
            return self.scram_final(&element.text());
        }

        // Initial presence is broadcast, never answered.
        if element.name() == "presence" && element.attr("to").is_none() {
            return Vec::new();
        }

        if element.name() == "iq" {
            let id = element.attr("id").unwrap_or_default().to_string();
            if element.get_child("bind", ns::BIND).is_some() {
                let jid = self
                    .bound_jid
                    .as_ref()
                    .map(|jid| format!("<jid>{jid}</jid>"))
                    .unwrap_or_default();
                return vec![format!(
                    "<iq type='result' id='{id}'><bind xmlns='{}'>{jid}</bind></iq>",
                    ns::BIND
                )];
            }
            if element.get_child("session", ns::SESSION).is_some() {
                return vec![format!("<iq type='result' id='{id}'/>")];
            }
            if element.get_child("query", ns::DISCO_INFO).is_some() {
                let muc = if self.muc_supported {
                    format!("<feature var='{}'/>", ns::MUC)
                } else {
                    String::new()
                };
                return vec![format!(
                    "<iq type='result' id='{id}' from='example.com'><query xmlns='{}'><identity category='server' type='im'/>{muc}</query></iq>",
                    ns::DISCO_INFO
                )];
            }
            if element.get_child("query", ns::DISCO_ITEMS).is_some() {
                let items: String = self
                    .muc_items
                    .iter()
                    .map(|jid| format!("<item jid='{jid}'/>"))
                    .collect();
                return vec![format!(
                    "<iq type='result' id='{id}' from='example.com'><query xmlns='{}'>{items}</query></iq>",
                    ns::DISCO_ITEMS
                )];
            }
        }

        match self.handler.as_mut() {
            Some(handler) => handler(&element),
            None => Vec::new(),
        }
    }

    /// Answer `n,,n=user,r=nonce` with `r=nonce+server,s=salt,i=iterations`.
    fn scram_first(&mut self, payload: &str) -> Vec<String> {
        let client_first = decode_text(payload);
        let bare = client_first
            .strip_prefix("n,,")
            .unwrap_or_else(|| panic!("unexpected GS2 header in {client_first:?}"))
            .to_string();
        let client_nonce = scram_attribute(&bare, 'r');
        let server_first = format!(
            "r={client_nonce}fixture,s={},i={SCRAM_ITERATIONS}",
            STANDARD.encode(SCRAM_SALT)
        );
        self.scram = Some(ScramExchange {
            client_first_bare: bare,
            server_first: server_first.clone(),
        });

        let mut replies = self.interleave.clone();
        replies.push(format!(
            "<challenge xmlns='{}'>{}</challenge>",
            ns::SASL,
            STANDARD.encode(server_first)
        ));
        replies
    }

    /// Check the client proof and send `v=signature` with `<success/>`.
    fn scram_final(&mut self, payload: &str) -> Vec<String> {
        let exchange = self
            .scram
            .take()
            .expect("SASL response outside a SCRAM exchange");
        let client_final = decode_text(payload);
        let (without_proof, proof) = client_final
            .rsplit_once(",p=")
            .expect("client-final carries a proof");
        let auth_message = format!(
            "{},{},{without_proof}",
            exchange.client_first_bare, exchange.server_first
        );

        let mut salted = [0u8; 20];
        pbkdf2_hmac::<Sha1>(
            self.password.as_bytes(),
            SCRAM_SALT,
            SCRAM_ITERATIONS,
            &mut salted,
        );
        let client_key = hmac_sha1(&salted, b"Client Key");
        let stored_key = Sha1::digest(&client_key);
        let client_signature = hmac_sha1(stored_key.as_slice(), auth_message.as_bytes());
        let expected: Vec<u8> = client_key
            .iter()
            .zip(&client_signature)
            .map(|(key, sig)| key ^ sig)
            .collect();

        if !self.accept_auth || STANDARD.decode(proof).ok() != Some(expected) {
            return vec![not_authorized()];
        }

        let mut server_signature = hmac_sha1(
            &hmac_sha1(&salted, b"Server Key"),
            auth_message.as_bytes(),
        );
        if self.forge_server_signature {
            server_signature[0] ^= 0xff;
        }
        self.authenticated = true;
        vec![format!(
            "<success xmlns='{}'>{}</success>",
            ns::SASL,
            STANDARD.encode(format!("v={}", STANDARD.encode(server_signature)))
        )]
    }

    fn open_stream(&mut self) -> Vec<String> {
        self.stream_count += 1;
        let header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' id='stream-{}' from='example.com' version='1.0'>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            self.stream_count
        );
        let features = if self.authenticated {
            format!(
                "<stream:features><bind xmlns='{}'/><session xmlns='{}'/></stream:features>",
                ns::BIND,
                ns::SESSION
            )
        } else {
            let mechanisms: String = self
                .mechanisms
                .iter()
                .map(|m| format!("<mechanism>{m}</mechanism>"))
                .collect();
            format!(
                "<stream:features><mechanisms xmlns='{}'>{mechanisms}</mechanisms></stream:features>",
                ns::SASL
            )
        };
        vec![header, features]
    }
}

fn not_authorized() -> String {
    format!(
        "<failure xmlns='{}'><not-authorized/><text>bad credentials</text></failure>",
        ns::SASL
    )
}

fn decode_text(payload: &str) -> String {
    let bytes = STANDARD
        .decode(payload.trim())
        .unwrap_or_else(|e| panic!("SASL payload {payload:?} is not base64: {e}"));
    String::from_utf8(bytes).expect("SASL payload is UTF-8")
}

/// Value of `key=` in a comma-separated SCRAM message.
fn scram_attribute(message: &str, key: char) -> String {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
        .unwrap_or_else(|| panic!("{key}= missing from {message:?}"))
        .to_string()
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

enum Installed {
    Server(FakeServer, SharedLog),
    Refuse,
}

thread_local! {
    static NEXT_SERVER: RefCell<Option<Installed>> = const { RefCell::new(None) };
}

/// Install `server` for the next channel opened on this thread.
pub fn install(server: FakeServer) -> SharedLog {
    let log = SharedLog::default();
    NEXT_SERVER.with(|next| *next.borrow_mut() = Some(Installed::Server(server, log.clone())));
    log
}

/// Make the next channel open on this thread fail.
pub fn install_refusing() {
    NEXT_SERVER.with(|next| *next.borrow_mut() = Some(Installed::Refuse));
}

pub struct ScriptedChannel {
    server: FakeServer,
    log: SharedLog,
    inbound: VecDeque<Vec<u8>>,
    peer_closed: bool,
}

impl ScriptedChannel {
    fn queue(&mut self, replies: Vec<String>) {
        for reply in replies {
            if reply.starts_with("</stream:stream") {
                self.peer_closed = true;
            }
            let bytes = reply.into_bytes();
            match self.server.chunk_size {
                Some(size) => self
                    .inbound
                    .extend(bytes.chunks(size.max(1)).map(<[u8]>::to_vec)),
                None => self.inbound.push_back(bytes),
            }
        }
    }
}

impl Channel for ScriptedChannel {
    async fn open(address: &str, _timeout: Duration) -> Result<Self, XmppError> {
        match NEXT_SERVER.with(|next| next.borrow_mut().take()) {
            Some(Installed::Server(server, log)) => {
                log.lock().unwrap().opened.push(address.to_string());
                Ok(Self {
                    server,
                    log,
                    inbound: VecDeque::new(),
                    peer_closed: false,
                })
            }
            Some(Installed::Refuse) => Err(XmppError::transport(format!(
                "connect to {address} failed: connection refused"
            ))),
            None => panic!("no scripted server installed for this test"),
        }
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>, XmppError> {
        let Some(mut chunk) = self.inbound.pop_front() else {
            return Ok(Vec::new());
        };
        if chunk.len() > max {
            let rest = chunk.split_off(max);
            self.inbound.push_front(rest);
        }
        Ok(chunk)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, XmppError> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.log.lock().unwrap().written.push(text.clone());
        let replies = self.server.respond(&text);
        self.queue(replies);
        Ok(data.len())
    }

    async fn poll_readable(&mut self, timeout: Duration) -> Result<bool, XmppError> {
        if !self.inbound.is_empty() || self.peer_closed {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        Ok(false)
    }

    async fn upgrade_to_encrypted(&mut self) -> Result<(), XmppError> {
        if self.server.fail_tls {
            return Err(XmppError::tls("TLS handshake with example.com failed"));
        }
        self.log.lock().unwrap().upgraded = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), XmppError> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// `a@example.com` / `p` on `example.com:5222`, TLS on, resource `r`.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("a@example.com", "p", "example.com")
        .with_encryption(true)
        .with_port(5222)
        .with_resource("r")
}

/// A connection driven all the way to `Ready` against `server`.
pub async fn ready_connection(server: FakeServer) -> (Connection<ScriptedChannel>, SharedLog) {
    let log = install(server);
    let mut connection = Connection::<ScriptedChannel>::new(test_config());
    connection
        .negotiate()
        .await
        .expect("negotiation against the scripted server");
    (connection, log)
}

/// Id attribute of the last stanza the client wrote.
pub fn last_written_id(log: &SharedLog) -> Option<String> {
    let log = log.lock().unwrap();
    let last = log.written.last()?;
    Element::from_str(last)
        .ok()
        .and_then(|element| element.attr("id").map(str::to_string))
}
