/// Canonical registrable site (eTLD+1 form), as produced by the
/// `SiteCanonicalizer` collaborator.
pub type Site = String;

/// Instant in milliseconds since the Unix epoch. Signed so that instants
/// before a site's randomized epoch origin stay representable.
pub type Timestamp = i64;

/// Index of a privacy epoch relative to a site's randomized origin.
/// Negative for instants before the origin was sampled.
pub type EpochIndex = i64;

pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
