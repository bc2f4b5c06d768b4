//! SASL mechanism encode/decode helpers shared by the server and client
//! sessions (spec.md §4.2/§4.3): `PLAIN`, `LOGIN`, and `CRAM-MD5`.
//!
//! This module only speaks the wire encoding of each mechanism; credential
//! verification (looking up a password/secret for an identity) is left to a
//! caller-supplied closure so this crate never bundles an authentication
//! database.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    CramMd5,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
            Mechanism::CramMd5 => "CRAM-MD5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Mechanism::Plain),
            "LOGIN" => Some(Mechanism::Login),
            "CRAM-MD5" => Some(Mechanism::CramMd5),
            _ => None,
        }
    }

    /// `PLAIN` and `LOGIN` transmit the password in the clear (base64 is not
    /// encryption); `CRAM-MD5` never does.
    pub fn is_plaintext(self) -> bool {
        matches!(self, Mechanism::Plain | Mechanism::Login)
    }
}

fn b64_decode(s: &str) -> Result<Vec<u8>, AuthError> {
    BASE64.decode(s.trim()).map_err(|_| AuthError::Rejected)
}

pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decodes a `PLAIN` response: `authzid\0authcid\0password`.
pub fn decode_plain(response_b64: &str) -> Result<(Option<String>, String, String), AuthError> {
    let raw = b64_decode(response_b64)?;
    let parts: Vec<&[u8]> = raw.splitn(3, |&b| b == 0).collect();
    if parts.len() != 3 {
        return Err(AuthError::Rejected);
    }
    let authzid = if parts[0].is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(parts[0]).into_owned())
    };
    let authcid = String::from_utf8_lossy(parts[1]).into_owned();
    let password = String::from_utf8_lossy(parts[2]).into_owned();
    Ok((authzid, authcid, password))
}

pub fn encode_plain(authzid: Option<&str>, authcid: &str, password: &str) -> String {
    let mut raw = Vec::new();
    raw.extend_from_slice(authzid.unwrap_or("").as_bytes());
    raw.push(0);
    raw.extend_from_slice(authcid.as_bytes());
    raw.push(0);
    raw.extend_from_slice(password.as_bytes());
    b64_encode(&raw)
}

pub fn decode_base64_text(response_b64: &str) -> Result<String, AuthError> {
    let raw = b64_decode(response_b64)?;
    String::from_utf8(raw).map_err(|_| AuthError::Rejected)
}

pub fn encode_base64_text(text: &str) -> String {
    b64_encode(text.as_bytes())
}

/// Builds the CRAM-MD5 challenge: `<random-id.timestamp@hostname>`, and its
/// base64 wire form.
pub fn cram_md5_challenge(hostname: &str, nonce: u64, unix_time: i64) -> (String, String) {
    let plain = format!("<{nonce:x}.{unix_time}@{hostname}>");
    let encoded = b64_encode(plain.as_bytes());
    (plain, encoded)
}

type HmacMd5 = Hmac<Md5>;

/// Computes the CRAM-MD5 digest a client would send back for `challenge`
/// keyed on `secret`, rendered as lowercase hex.
pub fn cram_md5_digest(challenge: &str, secret: &str) -> String {
    let mut mac = HmacMd5::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Parses a CRAM-MD5 response of the form `user digest-in-hex` and verifies
/// the digest against `challenge`/`secret` with a constant-time compare.
/// `secret` is `None` when the claimed identity has no registered secret;
/// the lookup itself is async (backed by a credential store) so it is done
/// by the caller before this is reached.
pub fn verify_cram_md5(challenge: &str, response_b64: &str, secret: Option<&str>) -> Result<String, AuthError> {
    let response = decode_base64_text(response_b64)?;
    let (user, digest) = response.rsplit_once(' ').ok_or(AuthError::Rejected)?;
    let secret = secret.ok_or(AuthError::Rejected)?;
    let expected = cram_md5_digest(challenge, secret);
    if constant_time_eq(expected.as_bytes(), digest.as_bytes()) {
        Ok(user.to_string())
    } else {
        Err(AuthError::Rejected)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trips() {
        let encoded = encode_plain(Some("z"), "user", "pass");
        let (authzid, authcid, password) = decode_plain(&encoded).unwrap();
        assert_eq!(authzid.as_deref(), Some("z"));
        assert_eq!(authcid, "user");
        assert_eq!(password, "pass");
    }

    #[test]
    fn cram_md5_digest_matches_known_vector() {
        // RFC 2195 example: secret "tanstaaftanstaaf",
        // challenge "<1896.697170952@postoffice.reston.mci.net>"
        let challenge = "<1896.697170952@postoffice.reston.mci.net>";
        let digest = cram_md5_digest(challenge, "tanstaaftanstaaf");
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn verify_cram_md5_accepts_correct_digest_and_rejects_wrong_one() {
        let challenge = "<1896.697170952@postoffice.reston.mci.net>";
        let digest = cram_md5_digest(challenge, "tanstaaftanstaaf");
        let response = format!("tim {digest}");
        let response_b64 = encode_base64_text(&response);
        let identity = verify_cram_md5(challenge, &response_b64, Some("tanstaaftanstaaf")).unwrap();
        assert_eq!(identity, "tim");

        let bad_response_b64 = encode_base64_text("tim deadbeef");
        assert!(verify_cram_md5(challenge, &bad_response_b64, Some("tanstaaftanstaaf")).is_err());
    }

    #[test]
    fn mechanism_plaintext_classification() {
        assert!(Mechanism::Plain.is_plaintext());
        assert!(Mechanism::Login.is_plaintext());
        assert!(!Mechanism::CramMd5.is_plaintext());
    }
}
