//! Authentication handshake carried on connection establishment

use crate::types::Identity;

/// Parameters presented to the push server when opening a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub identity: Identity,
}

impl Handshake {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    /// Append `identityId` and `identityRole` to the push URL query
    pub fn to_url(&self, base: &str) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{}{}identityId={}&identityRole={}",
            base,
            separator,
            urlencoding::encode(&self.identity.id),
            self.identity.role.as_str()
        )
    }
}
