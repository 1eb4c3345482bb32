//! Domain types for the fleetd control plane
//!
//! Strongly-typed domain values to prevent primitive obsession and improve
//! type safety throughout the codebase.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for a live agent session, assigned by the server at
/// connection time. Distinct from [`HostId`]: a host keeps its identity
/// across reconnects, an agent session does not.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random agent ID
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a persisted host record
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct HostId(Uuid);

impl HostId {
    /// Creates a new random host ID
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Parses a host ID from its canonical string form
    ///
    /// # Errors
    ///
    /// Returns the underlying UUID parse error if `value` is not a UUID.
    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(value).map(Self::new)
    }
}

/// Fully qualified hostname of an agent. Case is preserved as reported by
/// the agent; lookups are case-insensitive.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 253),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct Hostname(String);

/// Monotonic per-hostname configuration version
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct ConfigVersion(u64);

impl ConfigVersion {
    /// The next version in the sequence
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}
