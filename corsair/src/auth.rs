//! Request authentication for the remote sink.
//!
//! Every request is signed with HMAC-SHA1 over a canonical string binding
//! the method, the MD5 of the body, the content type, the `Date` header and
//! the account id:
//!
//! ```text
//! signature = base64(hmac_sha1(secret_key,
//!     method + "\n" + hex(md5(body)) + "\n" + content_type + "\n" + date + "\n" + account_id))
//! Authorization: corsair <access_key>:<signature>
//! ```
//!
//! Changing any of those inputs invalidates the signature.

use std::fmt;

use chrono::{DateTime, Utc};
use data_encoding::BASE64;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Scheme name used in the `Authorization` header.
pub const AUTH_SCHEME: &str = "corsair";

/// `strftime` pattern for the RFC 7231 HTTP-date.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Identity and credentials of this agent.
///
/// Built once from configuration at startup and shared read-only by every
/// shard for the life of the process.
#[derive(Clone)]
pub struct AuthContext {
    /// Account (team) the data belongs to.
    pub team_id: String,
    /// Unique id of this uploader installation.
    pub uploader_uid: String,
    /// Host identifier (usually an address) reported with every request.
    pub host: String,
    /// Machine host name reported with every request.
    pub host_name: String,
    /// Public access key.
    pub access_key: String,
    secret_key: String,
}

impl AuthContext {
    /// Creates an auth context. `secret_key` must already be decoded.
    pub fn new(
        team_id: impl Into<String>,
        uploader_uid: impl Into<String>,
        host: impl Into<String>,
        host_name: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            uploader_uid: uploader_uid.into(),
            host: host.into(),
            host_name: host_name.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Signs a request and returns the complete `Authorization` header value.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidLength`] if the secret key is rejected by the MAC.
    pub fn authorization(
        &self,
        method: &str,
        body: &[u8],
        content_type: &str,
        date: &str,
    ) -> Result<String, InvalidLength> {
        let signature = sign(
            &self.secret_key,
            method,
            body,
            content_type,
            date,
            &self.team_id,
        )?;
        Ok(format!("{AUTH_SCHEME} {}:{signature}", self.access_key))
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("team_id", &self.team_id)
            .field("uploader_uid", &self.uploader_uid)
            .field("host", &self.host)
            .field("host_name", &self.host_name)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Computes the Base64 HMAC-SHA1 request signature.
///
/// # Errors
///
/// Returns [`InvalidLength`] if the MAC refuses the key.
pub fn sign(
    secret_key: &str,
    method: &str,
    body: &[u8],
    content_type: &str,
    date: &str,
    account_id: &str,
) -> Result<String, InvalidLength> {
    let content_hash = md5::compute(body);
    let string_to_sign = format!("{method}\n{content_hash:x}\n{content_type}\n{date}\n{account_id}");

    let mut mac = Hmac::<Sha1>::new_from_slice(secret_key.as_bytes())?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(&mac.finalize().into_bytes()))
}

/// Formats `time` as an HTTP-date, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn context() -> AuthContext {
        AuthContext::new("team-1", "uid-1", "10.0.0.1", "web1", "AK", "secret")
    }

    #[test]
    fn test_http_date() {
        let time = Utc.with_ymd_and_hms(1994, 11, 15, 8, 12, 31).unwrap();
        assert_eq!(http_date(time), "Tue, 15 Nov 1994 08:12:31 GMT");
    }

    #[test]
    fn test_sign_known_vector() {
        // RFC 2202 test case 2: HMAC-SHA1 with key "Jefe".
        let mut mac = Hmac::<Sha1>::new_from_slice(b"Jefe").unwrap();
        mac.update(b"what do ya want for nothing?");
        assert_eq!(
            format!("{:x}", mac.finalize().into_bytes()),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );

        // md5 of an empty body is the well-known d41d8cd9... digest.
        assert_eq!(format!("{:x}", md5::compute(b"")), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_sign_is_deterministic() {
        let a = sign("secret", "POST", b"body", "application/x-protobuf", "date", "team").unwrap();
        let b = sign("secret", "POST", b"body", "application/x-protobuf", "date", "team").unwrap();
        assert_eq!(a, b);
        // Base64 of a 20-byte SHA1 MAC is 28 characters.
        assert_eq!(a.len(), 28);
    }

    #[test]
    fn test_sign_binds_every_input() {
        let sig = |key, method, body: &[u8], ct, date, team| {
            sign(key, method, body, ct, date, team).unwrap()
        };
        let base = sig("secret", "POST", b"body", "ct", "date", "team");

        assert_ne!(base, sig("other", "POST", b"body", "ct", "date", "team"));
        assert_ne!(base, sig("secret", "PUT", b"body", "ct", "date", "team"));
        assert_ne!(base, sig("secret", "POST", b"bodY", "ct", "date", "team"));
        assert_ne!(base, sig("secret", "POST", b"body", "ct2", "date", "team"));
        assert_ne!(base, sig("secret", "POST", b"body", "ct", "date2", "team"));
        assert_ne!(base, sig("secret", "POST", b"body", "ct", "date", "team2"));
    }

    #[test]
    fn test_authorization_header() {
        let ctx = context();
        let header = ctx
            .authorization("POST", b"x", "application/x-protobuf", "date")
            .unwrap();

        let expected_sig =
            sign("secret", "POST", b"x", "application/x-protobuf", "date", "team-1").unwrap();
        assert_eq!(header, format!("corsair AK:{expected_sig}"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", context());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("\"secret\""));
    }
}
