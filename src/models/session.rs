// Secret material that lives only for the duration of one launch attempt.
//
// Nothing in here implements Serialize: secrets cannot end up in the settings
// file or in a log line by accident. Debug output is redacted.

use serde::Deserialize;
use std::fmt;
use std::io::{self, BufRead};
use std::sync::atomic::{Ordering, compiler_fence};

// Passwords fit without the read buffer reallocating
const LINE_CAPACITY: usize = 256;

/// A string that is wiped from memory when dropped.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Read one line into a new secret, without its line ending.
    ///
    /// The read buffer belongs to the secret from the start and is wiped on drop,
    /// also when the read fails.
    pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Self> {
        let mut secret = Self(String::with_capacity(LINE_CAPACITY));
        reader.read_line(&mut secret.0)?;
        let len = secret.0.trim_end_matches(['\r', '\n']).len();
        secret.0.truncate(len);
        Ok(secret)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn wipe(value: &mut String) {
    // SAFETY: zero bytes are valid UTF-8, so the string stays well-formed.
    unsafe {
        for byte in value.as_bytes_mut() {
            std::ptr::write_volatile(byte, 0);
        }
    }
    compiler_fence(Ordering::SeqCst);
    value.clear();
}

/// Session id returned by a successful login (`sid`)
#[derive(Debug, Clone)]
pub struct SessionTicket {
    sid: Secret,
    /// Highest expansion the account is entitled to, when the server reports it
    pub max_expansion: Option<u32>,
}

impl SessionTicket {
    pub fn new(sid: impl Into<String>, max_expansion: Option<u32>) -> Self {
        Self {
            sid: Secret::new(sid),
            max_expansion,
        }
    }

    pub fn sid(&self) -> &str {
        self.sid.expose()
    }
}

/// The launch ticket the game executable receives as `DEV.TestSID`.
///
/// Issued by the version-check endpoint in exchange for a [`SessionTicket`].
#[derive(Debug, Clone)]
pub struct LaunchTicket(Secret);

impl LaunchTicket {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Secret::new(value))
    }

    pub fn expose(&self) -> &str {
        self.0.expose()
    }
}
