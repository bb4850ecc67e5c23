// Encrypted game arguments.
//
// The game accepts its whole argument list as a single opaque token:
//
//   //**sqex0003<payload><checksum>**//
//
// where <payload> is the list rendered as ` /T =<ticks> /KEY =VALUE ...`, zero padded
// to the 8-byte block size, encrypted with little-endian Blowfish keyed by the
// lowercase hex of `ticks & 0xFFFF_0000`, then base64 encoded with `+/=` replaced
// by `-_*`. The trailing checksum character lets the game recover the key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use blowfish::BlowfishLE;
use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use thiserror::Error;

const PREFIX: &str = "//**sqex0003";
const SUFFIX: &str = "**//";
const CHECKSUM_TABLE: &[u8; 16] = b"fX1pGtdS5CAP4_VL";
const BLOCK_SIZE: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    #[error("not an encrypted argument token")]
    NotEncrypted,

    #[error("checksum does not match the key")]
    ChecksumMismatch,

    #[error("payload is not valid base64: {0}")]
    Encoding(String),

    #[error("payload length is not a multiple of the block size")]
    BlockLength,

    #[error("decrypted payload is not a valid argument list")]
    Garbled,
}

/// Encrypt `(key, value)` pairs into the single token the game accepts.
pub fn encrypt_arguments(args: &[(String, String)], ticks: u32) -> String {
    let key = ticks & 0xFFFF_0000;
    let plain = render_plain(args, ticks);

    let mut buffer = plain.into_bytes();
    let padded_len = buffer.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    buffer.resize(padded_len, 0);

    let cipher = cipher_for(key);
    for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    let payload = STANDARD
        .encode(&buffer)
        .replace('+', "-")
        .replace('/', "_")
        .replace('=', "*");

    format!("{}{}{}{}", PREFIX, payload, checksum(key) as char, SUFFIX)
}

/// Reverse [`encrypt_arguments`], given the tick count the token was built with.
///
/// Returns the pairs without the leading `T` entry.
pub fn decrypt_arguments(token: &str, ticks: u32) -> Result<Vec<(String, String)>, CipherError> {
    let key = ticks & 0xFFFF_0000;

    let inner = token
        .strip_prefix(PREFIX)
        .and_then(|t| t.strip_suffix(SUFFIX))
        .ok_or(CipherError::NotEncrypted)?;

    let check_at = inner.len().checked_sub(1).ok_or(CipherError::NotEncrypted)?;
    if !inner.is_char_boundary(check_at) {
        return Err(CipherError::Garbled);
    }

    let (payload, check) = inner.split_at(check_at);
    if check.as_bytes() != [checksum(key)] {
        return Err(CipherError::ChecksumMismatch);
    }

    let standard = payload.replace('-', "+").replace('_', "/").replace('*', "=");
    let mut buffer = STANDARD
        .decode(standard)
        .map_err(|e| CipherError::Encoding(e.to_string()))?;

    if buffer.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::BlockLength);
    }

    let cipher = cipher_for(key);
    for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    while buffer.last() == Some(&0) {
        buffer.pop();
    }

    let plain = String::from_utf8(buffer).map_err(|_| CipherError::Garbled)?;
    let mut pairs = parse_plain(&plain)?;

    match pairs.first() {
        Some((name, value)) if name == "T" && value == &ticks.to_string() => {
            pairs.remove(0);
            Ok(pairs)
        }
        _ => Err(CipherError::Garbled),
    }
}

/// Milliseconds since system start, truncated to 32 bits like the game's own tick count
pub fn tick_count() -> u32 {
    #[cfg(windows)]
    {
        // SAFETY: no preconditions
        unsafe { windows::Win32::System::SystemInformation::GetTickCount() }
    }

    #[cfg(not(windows))]
    {
        std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| s.split_whitespace().next()?.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64 as u32)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as u32)
    }
}

fn render_plain(args: &[(String, String)], ticks: u32) -> String {
    let mut plain = format!(" /T ={}", ticks);
    for (name, value) in args {
        // Single spaces separate entries, so spaces inside values are doubled
        plain.push_str(&format!(" /{} ={}", name, value.replace(' ', "  ")));
    }
    plain
}

fn parse_plain(plain: &str) -> Result<Vec<(String, String)>, CipherError> {
    plain
        .split(" /")
        .skip(1)
        .map(|entry| {
            let (name, value) = entry.split_once(" =").ok_or(CipherError::Garbled)?;
            Ok((name.to_string(), value.replace("  ", " ")))
        })
        .collect()
}

fn cipher_for(key: u32) -> BlowfishLE {
    let key_text = format!("{:08x}", key);
    BlowfishLE::new_from_slice(key_text.as_bytes()).expect("Invalid blowfish key length")
}

fn checksum(key: u32) -> u8 {
    CHECKSUM_TABLE[((key >> 16) & 0xF) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_args() -> Vec<(String, String)> {
        vec![
            ("DEV.TestSID".to_string(), "abcdef0123".to_string()),
            ("SYS.Region".to_string(), "3".to_string()),
            ("language".to_string(), "1".to_string()),
        ]
    }

    #[test]
    fn test_token_shape() {
        let ticks = 0x0012_3456;
        let token = encrypt_arguments(&sample_args(), ticks);

        assert!(token.starts_with("//**sqex0003"));
        assert!(token.ends_with("**//"));
        // Key 0x00120000 selects table index 2
        assert_eq!(token.as_bytes()[token.len() - 5], b'1');
        assert!(!token.contains("abcdef0123"));

        let payload = &token[PREFIX.len()..token.len() - SUFFIX.len() - 1];
        assert!(!payload.contains(['+', '/', '=']));
    }

    #[test]
    fn test_decrypt_recovers_arguments() {
        let ticks = 98_765_432;
        let args = vec![
            ("DEV.TestSID".to_string(), "sid".to_string()),
            ("Extra".to_string(), "two words".to_string()),
        ];

        let token = encrypt_arguments(&args, ticks);
        assert_eq!(decrypt_arguments(&token, ticks).unwrap(), args);
    }

    #[test]
    fn test_decrypt_rejects_foreign_tokens() {
        assert_eq!(
            decrypt_arguments("DEV.TestSID=abc", 1),
            Err(CipherError::NotEncrypted)
        );

        let token = encrypt_arguments(&sample_args(), 0x0001_0000);
        assert_eq!(
            decrypt_arguments(&token, 0x0002_0000),
            Err(CipherError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_render_plain_doubles_spaces() {
        let args = vec![("A".to_string(), "x y".to_string())];
        assert_eq!(render_plain(&args, 7), " /T =7 /A =x  y");
    }

    #[test]
    fn test_tick_count_is_nonzero() {
        assert!(tick_count() > 0);
    }
}
