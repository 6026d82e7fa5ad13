use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Characters used for request ids and session tokens.
pub const ALPHANUMERIC: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Characters used for verification codes.
pub const DIGITS: &str = "0123456789";

pub const KEY_LENGTH: usize = 32;
pub const CODE_LENGTH: usize = 6;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("secure random source unavailable: {0}")]
    RandomSource(#[from] rand::Error),

    #[error("alphabet must contain between 1 and 256 ASCII characters")]
    InvalidAlphabet,
}

/// Builds a string of `length` characters, each picked uniformly from
/// `alphabet` using the operating system's CSPRNG.
///
/// Bytes that would bias the modulo are rejected and redrawn.
pub fn generate(alphabet: &str, length: usize) -> Result<String, GenerationError> {
    let chars = alphabet.as_bytes();
    if chars.is_empty() || chars.len() > 256 || !alphabet.is_ascii() {
        return Err(GenerationError::InvalidAlphabet);
    }

    let n = chars.len();
    // Largest multiple of n that fits in a byte's range.
    let limit = 256 - (256 % n);

    let mut out = String::with_capacity(length);
    let mut buf = [0u8; 64];
    while out.len() < length {
        OsRng.try_fill_bytes(&mut buf)?;
        for &b in &buf {
            if (b as usize) < limit {
                out.push(chars[b as usize % n] as char);
                if out.len() == length {
                    break;
                }
            }
        }
    }

    Ok(out)
}

/// A 32-character alphanumeric key, used for request ids and session tokens.
pub fn random_key() -> Result<String, GenerationError> {
    generate(ALPHANUMERIC, KEY_LENGTH)
}

/// A 6-digit verification code.
pub fn random_code() -> Result<String, GenerationError> {
    generate(DIGITS, CODE_LENGTH)
}
