//! Splitting branch addresses into server and method
//!
//! Two forms are accepted:
//! - `server/method` for direct connections, split at the first `/`
//! - `scheme://host/server-segment/method-path`, where the server keeps the
//!   first path segment and the method is the rest

use crate::error::{GozeroError, Result};
use std::borrow::Cow;
use tracing::debug;
use zero_discov::resolver::CONSUL_SCHEME;
use zero_discov::TargetUrl;

/// Split `uri` into `(server, method)`
///
/// A scheme-form address that fails URL parsing yields `("", "")` rather
/// than an error; callers depend on that.
pub fn parse_server_method(uri: &str) -> Result<(String, String)> {
    if !uri.contains("//") {
        let sep = uri
            .find('/')
            .ok_or_else(|| GozeroError::MalformedAddress(uri.to_string()))?;
        return Ok((uri[..sep].to_string(), uri[sep..].to_string()));
    }

    let uri = normalize_consul_query(uri)?;
    let target = match TargetUrl::parse(&uri) {
        Ok(target) => target,
        Err(e) => {
            debug!("Address {:?} is not a valid URL, using empty server and method: {}", uri, e);
            return Ok((String::new(), String::new()));
        }
    };

    // index of the second `/` in the path, 0 when there is none
    let idx = target
        .path
        .as_bytes()
        .iter()
        .skip(1)
        .position(|&b| b == b'/')
        .map_or(0, |i| i + 1);

    let server = format!("{}://{}{}", target.scheme, target.host, &target.path[..idx]);
    Ok((server, target.path[idx..].to_string()))
}

/// Undo the `?query` the framework inserts before the path of Consul targets
///
/// `consul://host?wait=14s/pkg.Service/Method` becomes
/// `consul://host/pkg.Service/Method`. Only the text between the first and
/// second `?` is searched for the path; anything after a second `?` is dropped.
pub fn normalize_consul_query(uri: &str) -> Result<Cow<'_, str>> {
    if !(uri.contains(CONSUL_SCHEME) && uri.contains('?')) {
        return Ok(Cow::Borrowed(uri));
    }

    let mut parts = uri.split('?');
    let head = parts.next().unwrap_or_default();
    let query = parts.next().unwrap_or_default();

    let sep = query
        .find('/')
        .ok_or_else(|| GozeroError::MalformedAddress(uri.to_string()))?;

    Ok(Cow::Owned(format!("{}{}", head, &query[sep..])))
}
