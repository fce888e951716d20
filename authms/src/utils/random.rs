use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng, RngCore};

/// Digits in an SMS verification code.
pub const NUMERIC_CODE_LEN: usize = 6;
/// Random bytes behind an email verification token.
pub const EMAIL_TOKEN_BYTES: usize = 56;

/// Fixed-length numeric code, leading zeros allowed.
pub fn numeric_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// URL-safe token for links sent by email.
pub fn url_safe_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

pub fn alphanumeric(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
