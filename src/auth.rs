use hyper::Uri;
use url::form_urlencoded;

use crate::error::GateError;
use crate::keys::KeyStore;

pub const AUTH_PARAM: &str = "auth";

/// Returns the first `auth` query value, percent-decoded.
#[must_use]
pub fn extract_key(uri: &Uri) -> Option<String> {
    uri.query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == AUTH_PARAM)
            .map(|(_, value)| value.into_owned())
    })
}

/// Checks the presented key against a fresh read of the key store.
///
/// The key comparison is exact and case-sensitive. A key store that cannot
/// be read fails this request only.
pub async fn authorize(uri: &Uri, store: &KeyStore) -> Result<String, GateError> {
    let key = extract_key(uri).ok_or(GateError::MissingCredential)?;

    if store.contains(&key).await? {
        Ok(key)
    } else {
        Err(GateError::InvalidCredential)
    }
}
