//! Address concatenation helpers.
//!
//! Addresses are built by plain string concatenation and are not validated
//! beyond splitting on `@`.

/// `local@realm`, with `/resource` appended only when `resource` is non-empty.
pub fn full_user_id(local: &str, realm: &str, resource: &str) -> String {
    with_resource(format!("{local}@{realm}"), resource)
}

/// `room@muc_server`, with `/nickname` appended only when `nickname` is non-empty.
pub fn full_room_id(room: &str, muc_server: &str, nickname: &str) -> String {
    with_resource(format!("{room}@{muc_server}"), nickname)
}

/// Text before the first `@`, or the whole input when there is none.
pub fn local_part(jid: &str) -> &str {
    jid.split_once('@').map_or(jid, |(local, _)| local)
}

/// Text after the first `@` up to any `/resource`.
pub fn domain_part(jid: &str) -> Option<&str> {
    let (_, rest) = jid.split_once('@')?;
    Some(rest.split_once('/').map_or(rest, |(domain, _)| domain))
}

fn with_resource(mut bare: String, resource: &str) -> String {
    if !resource.is_empty() {
        bare.push('/');
        bare.push_str(resource);
    }
    bare
}
