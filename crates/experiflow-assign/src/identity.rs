/// The identity a visitor is bucketed under, tagged with the tier it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VisitorIdentity {
    /// A stable id carried in a cookie.
    Cookie(String),
    /// A salted hash of client IP and user agent. Semi-stable: changes when
    /// either input changes.
    Fingerprint(String),
    /// A random token. Never repeats, so the assignment is effectively random.
    Anonymous(String),
}

impl VisitorIdentity {
    /// Hex characters kept from the fingerprint digest.
    pub const FINGERPRINT_LEN: usize = 16;

    pub(crate) fn anonymous() -> Self {
        VisitorIdentity::Anonymous(format!("anon_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            VisitorIdentity::Cookie(id)
            | VisitorIdentity::Fingerprint(id)
            | VisitorIdentity::Anonymous(id) => id,
        }
    }

    /// `true` when the identity will not be reproduced on the next request.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, VisitorIdentity::Anonymous(_))
    }

    /// Short tier name for logs.
    pub fn tier(&self) -> &'static str {
        match self {
            VisitorIdentity::Cookie(_) => "cookie",
            VisitorIdentity::Fingerprint(_) => "fingerprint",
            VisitorIdentity::Anonymous(_) => "anonymous",
        }
    }
}

impl std::fmt::Display for VisitorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
