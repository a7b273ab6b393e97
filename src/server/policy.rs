//! Flash cross-domain policy data.
//!
//! Sockets from Flash runtimes open the connection with the sentinel
//! `<policy-file-request/>\0` instead of an HTTP request; the reply is the
//! policy XML terminated by a single NUL byte.

use std::io;
use std::path::Path;

/// Served when no policy file is configured: allow every domain and port.
const DEFAULT_POLICY: &str = "<?xml version=\"1.0\"?>\n<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\" /></cross-domain-policy>\n";

/// Cached cross-domain policy data, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PolicyFile {
    data: Vec<u8>,
}

impl PolicyFile {
    /// Loads policy data from `path`, or the permissive default when no
    /// path is configured.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the configured file cannot be
    /// read.
    pub fn load(path: Option<&Path>) -> io::Result<Self> {
        let data = match path {
            Some(path) => std::fs::read(path)?,
            None => DEFAULT_POLICY.as_bytes().to_vec(),
        };
        Ok(Self { data })
    }

    /// The full wire response: policy data plus the terminating NUL.
    #[must_use]
    pub fn response(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 1);
        out.extend_from_slice(&self.data);
        out.push(0);
        out
    }
}
