//! Deterministic and random variant selection.
//!
//! Variants are walked in the order the experiment service returned them and
//! their `traffic_allocation` values are accumulated into thresholds. The
//! order is part of the contract: reordering the list changes which bucket
//! lands in which variant even though the hash is unchanged.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use experiflow_types::{ExperiflowError, Result, Variant};

use crate::identity::VisitorIdentity;

type HmacSha256 = Hmac<Sha256>;

/// Buckets are integers in `[0, BUCKET_COUNT)`.
pub const BUCKET_COUNT: u32 = 100;

// ---------------------------------------------------------------------------
// Assigner
// ---------------------------------------------------------------------------

/// Maps visitors onto variants using a keyed hash of `(user_id, experiment_id)`.
///
/// Holds nothing but the salt, so one instance is shared by every request.
#[derive(Clone)]
pub struct Assigner {
    salt: String,
}

impl std::fmt::Debug for Assigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assigner").field("salt", &"<redacted>").finish()
    }
}

impl Assigner {
    /// Create an assigner. An empty salt is rejected; there is no built-in default.
    pub fn new(salt: impl Into<String>) -> Result<Self> {
        let salt = salt.into();
        if salt.trim().is_empty() {
            return Err(ExperiflowError::InvalidConfig(
                "assignment salt must be set and non-empty".into(),
            ));
        }
        Ok(Self { salt })
    }

    /// Deterministically pick a variant for `user_id` in `experiment_id`.
    ///
    /// Returns `None` only for an empty variant list. A single variant is
    /// returned without hashing. When the allocations sum to less than 1.0
    /// and the bucket falls past the last threshold, the first variant is
    /// returned.
    pub fn assign_variant<'a>(
        &self,
        user_id: &str,
        experiment_id: &str,
        variants: &'a [Variant],
    ) -> Option<&'a Variant> {
        match variants {
            [] => None,
            [only] => Some(only),
            _ => {
                let bucket = self.bucket(user_id, experiment_id);
                Some(pick_by_threshold(variants, f64::from(bucket)))
            }
        }
    }

    /// The bucket in `[0, 100)` for a user and experiment.
    ///
    /// The first 4 bytes of the hex-encoded HMAC-SHA256 digest are read as an
    /// unsigned integer and reduced modulo 100. If that ever fails a uniform
    /// random bucket is used instead of failing the request.
    pub fn bucket(&self, user_id: &str, experiment_id: &str) -> u32 {
        let digest = self.hex_digest(&format!("{user_id}:{experiment_id}"));
        match digest
            .get(..8)
            .map(|prefix| u64::from_str_radix(prefix, 16))
        {
            Some(Ok(value)) => (value % u64::from(BUCKET_COUNT)) as u32,
            _ => {
                tracing::warn!(
                    experiment = %experiment_id,
                    "Bucket digest unparsable, falling back to random bucket"
                );
                rand::thread_rng().gen_range(0..BUCKET_COUNT)
            }
        }
    }

    /// Derive the identity used for bucketing.
    ///
    /// Priority: an existing cookie value, then a salted hash of
    /// `(client_ip, user_agent)`, then a random anonymous token. Each tier is
    /// used only when the previous tier's input is absent.
    pub fn derive_user_id(
        &self,
        cookie_value: Option<&str>,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> VisitorIdentity {
        if let Some(value) = cookie_value.filter(|v| !v.is_empty()) {
            return VisitorIdentity::Cookie(value.to_string());
        }

        let ip = client_ip.unwrap_or_default();
        let ua = user_agent.unwrap_or_default();
        if !ip.is_empty() || !ua.is_empty() {
            let digest = self.hex_digest(&format!("{ip}:{ua}"));
            let short = digest
                .get(..VisitorIdentity::FINGERPRINT_LEN)
                .unwrap_or(digest.as_str());
            return VisitorIdentity::Fingerprint(short.to_string());
        }

        VisitorIdentity::anonymous()
    }

    fn hex_digest(&self, message: &str) -> String {
        // HMAC accepts keys of any length; `new_from_slice` cannot fail here.
        let mut mac = match HmacSha256::new_from_slice(self.salt.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Random selection
// ---------------------------------------------------------------------------

/// Pick a variant with a fresh random draw.
///
/// Uses the same cumulative-threshold walk as [`Assigner::assign_variant`] but
/// is not repeatable; only for visitors with no stable identity.
pub fn select_random_variant(variants: &[Variant]) -> Option<&Variant> {
    match variants {
        [] => None,
        [only] => Some(only),
        _ => {
            let point = rand::thread_rng().gen::<f64>() * f64::from(BUCKET_COUNT);
            Some(pick_by_threshold(variants, point))
        }
    }
}

/// Walk `variants` in order, returning the first whose cumulative threshold
/// exceeds `point`. Falls back to the first variant. `variants` must be non-empty.
fn pick_by_threshold(variants: &[Variant], point: f64) -> &Variant {
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.traffic_allocation * f64::from(BUCKET_COUNT);
        if point < cumulative {
            return variant;
        }
    }
    &variants[0]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
