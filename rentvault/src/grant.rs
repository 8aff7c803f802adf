//! Access grants: time-boxed, resource-scoped capabilities minted after a
//! verified payment.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use rand::RngCore;

use crate::timestamp::UnixTimestamp;

/// A capability bound to exactly one resource, valid until `expires_at`.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    /// Opaque, unguessable token.
    pub token: String,
    /// The resource this grant was minted for.
    pub resource_id: String,
    /// Minting time.
    pub issued_at: UnixTimestamp,
    /// Expiry; the grant is invalid from this instant on.
    pub expires_at: UnixTimestamp,
}

/// Mints and validates access grants.
#[derive(Debug, Default)]
pub struct AccessGrantIssuer {
    grants: DashMap<String, AccessGrant>,
}

impl AccessGrantIssuer {
    /// Creates an empty issuer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a grant for `resource_id` valid for `ttl_secs`.
    pub fn mint(&self, resource_id: &str, ttl_secs: u64) -> AccessGrant {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let now = UnixTimestamp::now();
        let grant = AccessGrant {
            token: URL_SAFE_NO_PAD.encode(bytes),
            resource_id: resource_id.to_owned(),
            issued_at: now,
            expires_at: now + ttl_secs,
        };
        self.grants.insert(grant.token.clone(), grant.clone());
        tracing::debug!(resource = %resource_id, ttl_secs, "minted access grant");
        grant
    }

    /// True only if the token exists, is unexpired, and was minted for
    /// exactly `resource_id`. An unknown token is the common "no grant yet"
    /// case and simply returns false.
    #[must_use]
    pub fn validate(&self, token: &str, resource_id: &str) -> bool {
        self.grants
            .get(token)
            .is_some_and(|g| g.resource_id == resource_id && UnixTimestamp::now() < g.expires_at)
    }

    /// Looks up a grant by token.
    #[must_use]
    pub fn grant(&self, token: &str) -> Option<AccessGrant> {
        self.grants.get(token).map(|g| g.clone())
    }

    /// Drops expired grants; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = UnixTimestamp::now();
        let before = self.grants.len();
        self.grants.retain(|_, g| !g.expires_at.is_past(now));
        before - self.grants.len()
    }
}
