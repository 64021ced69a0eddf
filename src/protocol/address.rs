//! Engine.io URL inspection and rewriting.

// ============================================================================
// Imports
// ============================================================================

use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Engine.io protocol revision spoken by the shadow client.
pub const ENGINE_IO_VERSION: &str = "4";

const TRANSPORT_PARAM: &str = "transport";
const SESSION_PARAM: &str = "sid";

// ============================================================================
// Inspection
// ============================================================================

/// Returns `true` if the URL addresses a polling transport.
#[must_use]
pub fn is_polling_url(url: &str) -> bool {
    query_value(url, TRANSPORT_PARAM).is_some_and(|value| value == "polling")
}

/// Returns `true` if the URL carries an engine.io session id.
#[must_use]
pub fn has_session_id(url: &str) -> bool {
    query_value(url, SESSION_PARAM).is_some_and(|value| !value.is_empty())
}

/// Returns `true` if the URL has the given query parameter.
#[must_use]
pub fn has_query_param(url: &str, name: &str) -> bool {
    query_value(url, name).is_some()
}

/// Returns `true` if the URL has a `name=value` query pair.
#[must_use]
pub fn has_query_pair(url: &str, name: &str, value: &str) -> bool {
    Url::parse(url)
        .ok()
        .is_some_and(|parsed| parsed.query_pairs().any(|(k, v)| k == name && v == value))
}

fn query_value(url: &str, name: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

// ============================================================================
// Rewriting
// ============================================================================

/// Rewrites a duplex socket address into its polling variant.
///
/// `wss` becomes `https`, `ws` becomes `http`, and the `transport` query
/// parameter becomes `polling`. Other parameters keep their order.
///
/// # Errors
///
/// Returns [`Error::Url`] if the address does not parse, or
/// [`Error::Protocol`] if the scheme cannot be rewritten.
pub fn to_polling_url(socket_url: &str) -> Result<Url> {
    let mut url = Url::parse(socket_url)?;

    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|()| Error::protocol(format!("cannot rewrite scheme of {socket_url}")))?;

    set_query_param(&mut url, TRANSPORT_PARAM, "polling");
    Ok(url)
}

/// Builds an engine.io endpoint address.
///
/// # Errors
///
/// Returns [`Error::Url`] if `path` cannot be joined onto `base`.
pub fn engine_url(
    base: &Url,
    path: &str,
    transport: &str,
    sid: Option<&str>,
    marker: (&str, &str),
) -> Result<Url> {
    let mut url = base.join(path)?;
    if transport == "websocket" {
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::protocol(format!("cannot use {scheme} for {base}")))?;
    }

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("EIO", ENGINE_IO_VERSION);
        query.append_pair(TRANSPORT_PARAM, transport);
        if let Some(sid) = sid {
            query.append_pair(SESSION_PARAM, sid);
        }
        query.append_pair(marker.0, marker.1);
    }
    Ok(url)
}

fn set_query_param(url: &mut Url, name: &str, value: &str) {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    match pairs.iter_mut().find(|(k, _)| k == name) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((name.to_string(), value.to_string())),
    }

    url.query_pairs_mut().clear().extend_pairs(pairs);
}

// ============================================================================
// Tests
// ============================================================================
