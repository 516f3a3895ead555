use crate::error::OpenIdError;
use crate::openid::kvform;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssocType {
    #[serde(rename = "HMAC-SHA1")]
    HmacSha1,
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

impl AssocType {
    pub fn as_str(self) -> &'static str {
        match self {
            AssocType::HmacSha1 => "HMAC-SHA1",
            AssocType::HmacSha256 => "HMAC-SHA256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HMAC-SHA1" => Some(AssocType::HmacSha1),
            "HMAC-SHA256" => Some(AssocType::HmacSha256),
            _ => None,
        }
    }

    fn algorithm(self) -> hmac::Algorithm {
        match self {
            AssocType::HmacSha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            AssocType::HmacSha256 => hmac::HMAC_SHA256,
        }
    }

    fn secret_len(self) -> usize {
        match self {
            AssocType::HmacSha1 => 20,
            AssocType::HmacSha256 => 32,
        }
    }
}

/// Shared secret negotiated with a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub handle: String,
    #[serde(with = "secret_base64")]
    pub secret: Vec<u8>,
    /// Unix seconds.
    pub issued: i64,
    /// Seconds.
    pub lifetime: i64,
    pub assoc_type: AssocType,
}

impl Association {
    pub fn new(
        handle: String,
        secret: Vec<u8>,
        issued: i64,
        lifetime: i64,
        assoc_type: AssocType,
    ) -> Result<Self, OpenIdError> {
        if secret.len() != assoc_type.secret_len() {
            return Err(OpenIdError::Malformed(format!(
                "{} secret must be {} bytes, got {}",
                assoc_type.as_str(),
                assoc_type.secret_len(),
                secret.len()
            )));
        }
        Ok(Self {
            handle,
            secret,
            issued,
            lifetime,
            assoc_type,
        })
    }

    /// Seconds left before expiry, never negative.
    pub fn expires_in(&self, now: i64) -> i64 {
        (self.issued + self.lifetime - now).max(0)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_in(now) == 0
    }

    fn key(&self) -> hmac::Key {
        hmac::Key::new(self.assoc_type.algorithm(), &self.secret)
    }

    /// Signature over the fields listed in `openid.signed`, base64 encoded.
    pub fn sign(&self, params: &BTreeMap<String, String>) -> Result<String, OpenIdError> {
        let message = signed_message(params)?;
        let tag = hmac::sign(&self.key(), message.as_bytes());
        Ok(STANDARD.encode(tag.as_ref()))
    }

    /// Constant-time check of `openid.sig`.
    pub fn check_signature(&self, params: &BTreeMap<String, String>) -> Result<bool, OpenIdError> {
        let sig = params
            .get("openid.sig")
            .ok_or_else(|| OpenIdError::Malformed("missing openid.sig".into()))?;
        let Ok(sig) = STANDARD.decode(sig) else {
            return Ok(false);
        };
        let message = signed_message(params)?;
        Ok(hmac::verify(&self.key(), message.as_bytes(), &sig).is_ok())
    }
}

/// Key-value form of the signed fields, in `openid.signed` order.
fn signed_message(params: &BTreeMap<String, String>) -> Result<String, OpenIdError> {
    let signed = params
        .get("openid.signed")
        .ok_or_else(|| OpenIdError::Malformed("missing openid.signed".into()))?;
    let mut pairs = Vec::new();
    for field in signed.split(',') {
        let value = params.get(&format!("openid.{field}")).ok_or_else(|| {
            OpenIdError::Malformed(format!("signed field openid.{field} is missing"))
        })?;
        pairs.push((field, value.as_str()));
    }
    kvform::encode(&pairs)
}

mod secret_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(secret))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}
