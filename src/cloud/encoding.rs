//! Web form parameter encoding.
//!
//! The OAuth endpoint takes `application/x-www-form-urlencoded` bodies and
//! cloud URLs carry query strings in the same format: RFC 3986
//! percent-encoding with `+` for space.

use url::form_urlencoded;

/// A single `name=value` form parameter.
pub type WebParam = (String, String);

/// Encode parameter pairs into a form-urlencoded string.
pub fn web_params_encode<I, K, V>(params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in params {
        serializer.append_pair(name.as_ref(), value.as_ref());
    }
    serializer.finish()
}

/// Decode a form-urlencoded string into parameter pairs.
pub fn web_params_decode(data: &str) -> Vec<WebParam> {
    form_urlencoded::parse(data.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

/// Find the value for `name` in a form-urlencoded body.
pub fn form_field(data: &str, name: &str) -> Option<String> {
    web_params_decode(data)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
}
