//! Key-value form encoding used in direct provider responses and signatures.

use crate::error::OpenIdError;

/// Encode pairs as `key:value\n` lines.
pub fn encode<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Result<String, OpenIdError> {
    let mut out = String::new();
    for (k, v) in pairs {
        let (k, v) = (k.as_ref(), v.as_ref());
        if k.contains(':') || k.contains('\n') || v.contains('\n') {
            return Err(OpenIdError::Malformed(format!(
                "cannot encode key-value pair {k:?}"
            )));
        }
        out.push_str(k);
        out.push(':');
        out.push_str(v);
        out.push('\n');
    }
    Ok(out)
}

/// Decode a key-value form body. Lines without a colon are skipped.
pub fn decode(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub fn get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
