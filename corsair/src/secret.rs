//! On-disk obfuscation of the secret key.
//!
//! The configuration file never holds the secret key in clear text. It holds
//! a 128-byte block, Base64 encoded:
//!
//! ```text
//! block[0]      = len(secret)
//! block[1..=n]  = secret
//! block[n+1..]  = random padding
//! stored        = base64(block XOR KEY_TABLE)
//! ```
//!
//! This keeps the key out of casual view; it is not encryption.

use data_encoding::BASE64;
use rand::Rng;

use crate::error::ConfigError;

/// Size of the obfuscated block.
pub const BLOCK_LEN: usize = 128;

/// Longest secret that fits in a block.
pub const MAX_SECRET_LEN: usize = BLOCK_LEN - 1;

const KEY_TABLE: [u8; BLOCK_LEN] = [
    0xbb, 0x74, 0x24, 0xa5, 0xba, 0x5a, 0x0a, 0x8c, 0x65, 0x61, 0xdf, 0x57, 0xa1, 0x3c, 0xfb, 0xe9,
    0x89, 0x12, 0xcb, 0x5a, 0xd2, 0x70, 0xf3, 0x82, 0x67, 0xdd, 0x5c, 0x8a, 0xec, 0x77, 0xcf, 0x48,
    0x39, 0x1c, 0x0e, 0xab, 0xee, 0x0e, 0x16, 0xe8, 0x2c, 0xab, 0xf2, 0x61, 0xfc, 0xc7, 0xfd, 0x1c,
    0x58, 0xfc, 0xe7, 0x4f, 0x70, 0xed, 0xc8, 0xf1, 0x5f, 0x36, 0x18, 0x3c, 0x29, 0x38, 0x27, 0xc1,
    0xbc, 0x29, 0x03, 0x89, 0xcb, 0xbe, 0xc7, 0xc8, 0xce, 0xb3, 0x7d, 0x7d, 0xe1, 0x84, 0x74, 0x0d,
    0x1c, 0x66, 0xb6, 0x86, 0xbc, 0x0b, 0x33, 0x01, 0x17, 0x93, 0xd3, 0x82, 0xb7, 0xb0, 0x96, 0xe3,
    0xd6, 0xef, 0xc4, 0xa1, 0xf7, 0xb0, 0x6e, 0x0d, 0x55, 0x2e, 0x3e, 0x25, 0x4c, 0xf7, 0xc6, 0xeb,
    0x63, 0x8c, 0x88, 0x69, 0xf5, 0x86, 0x6a, 0x56, 0xc1, 0xaf, 0x46, 0xbf, 0x6f, 0x35, 0xfc, 0x90,
];

/// Obfuscates `secret` for storage in the configuration file.
///
/// Two calls with the same secret give different output because of the
/// random padding; both decode to the same secret.
///
/// # Errors
///
/// Returns [`ConfigError::Secret`] if `secret` is longer than
/// [`MAX_SECRET_LEN`] bytes.
pub fn encode_secret(secret: &str) -> Result<String, ConfigError> {
    let bytes = secret.as_bytes();
    let Ok(len) = u8::try_from(bytes.len()) else {
        return Err(too_long(bytes.len()));
    };
    if bytes.len() > MAX_SECRET_LEN {
        return Err(too_long(bytes.len()));
    }

    let mut block = [0u8; BLOCK_LEN];
    block[0] = len;
    block[1..=bytes.len()].copy_from_slice(bytes);
    rand::rng().fill(&mut block[bytes.len() + 1..]);

    xor_in_place(&mut block);
    Ok(BASE64.encode(&block))
}

/// Recovers the secret from its obfuscated form.
///
/// # Errors
///
/// Returns [`ConfigError::Secret`] if `encoded` is not Base64, is not a
/// full block, or carries an impossible length or non-UTF-8 secret.
pub fn decode_secret(encoded: &str) -> Result<String, ConfigError> {
    let mut block = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|e| secret_error(format!("not valid base64: {e}")))?;
    if block.len() != BLOCK_LEN {
        return Err(secret_error(format!(
            "expected {BLOCK_LEN} bytes, got {}",
            block.len()
        )));
    }

    xor_in_place(&mut block);
    let len = usize::from(block[0]);
    if len > MAX_SECRET_LEN {
        return Err(secret_error(format!("embedded length {len} is out of range")));
    }

    String::from_utf8(block[1..=len].to_vec())
        .map_err(|_| secret_error("secret is not valid UTF-8".to_string()))
}

fn xor_in_place(block: &mut [u8]) {
    for (byte, key) in block.iter_mut().zip(KEY_TABLE.iter()) {
        *byte ^= key;
    }
}

fn too_long(len: usize) -> ConfigError {
    secret_error(format!("secret is {len} bytes, at most {MAX_SECRET_LEN} allowed"))
}

fn secret_error(reason: String) -> ConfigError {
    ConfigError::Secret { reason }
}
