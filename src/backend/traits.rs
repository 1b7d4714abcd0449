use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use url::Url;

use crate::{
    error::AttributionError,
    util::shared_types::{Site, Timestamp},
};

/// Time source collaborator. The engine never reads the wall clock
/// directly, so hosts and tests fully control instants.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Entropy collaborator. `random` must return a float in `[0, 1)`; the
/// engine treats anything else as a fatal invariant violation.
pub trait RandomSource {
    fn random(&mut self) -> f64;
}

/// Seals a finished histogram into the opaque aggregation report blob.
/// The wire encoding is the embedder's concern.
pub trait Encryptor {
    fn seal(&self, histogram: &[u64]) -> anyhow::Result<Vec<u8>>;
}

/// Reduces an input string to a canonical registrable site (eTLD+1).
/// Full public-suffix handling lives in the embedder.
pub trait SiteCanonicalizer {
    fn canonicalize(&self, input: &str) -> anyhow::Result<Site>;
}

/// Canonicalizes through the collaborator, mapping failures to the typed
/// syntax error.
pub fn canonicalize_site<S: SiteCanonicalizer>(
    sites: &S,
    input: &str,
) -> Result<Site, AttributionError> {
    sites
        .canonicalize(input)
        .map_err(|e| AttributionError::InvalidSyntax(format!("{input:?}: {e}")))
}

/// Draws from `rng`, enforcing the half-open unit interval contract.
pub fn draw_unit<R: RandomSource>(
    rng: &mut R,
) -> Result<f64, AttributionError> {
    let value = rng.random();
    if !(0.0..1.0).contains(&value) {
        return Err(AttributionError::InvalidState(format!(
            "rng returned {value}, outside [0, 1)"
        )));
    }
    Ok(value)
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis() as Timestamp
    }
}

/// Production entropy source backed by the thread-local generator.
#[derive(Debug, Default)]
pub struct OsRandomSource {
    rng: rand::rngs::ThreadRng,
}

impl RandomSource for OsRandomSource {
    fn random(&mut self) -> f64 {
        rand::Rng::gen::<f64>(&mut self.rng)
    }
}

/// Debug encryptor: little-endian encoding of the bins, no encryption.
/// Stand-in until the embedder wires a real HPKE report encoder.
#[derive(Debug, Default, Clone)]
pub struct PlainEncryptor;

impl Encryptor for PlainEncryptor {
    fn seal(&self, histogram: &[u64]) -> anyhow::Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(histogram.len() * 8);
        for bin in histogram {
            blob.extend_from_slice(&bin.to_le_bytes());
        }
        Ok(blob)
    }
}

/// Default canonicalizer: extracts and lowercases the host, accepting bare
/// host names as well as full URLs.
#[derive(Debug, Default, Clone)]
pub struct RegistrableSiteCanonicalizer;

impl SiteCanonicalizer for RegistrableSiteCanonicalizer {
    fn canonicalize(&self, input: &str) -> anyhow::Result<Site> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty site"));
        }
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        let url = Url::parse(&with_scheme)
            .with_context(|| format!("cannot parse site {input:?}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("site {input:?} has no host"))?;
        Ok(host.to_ascii_lowercase())
    }
}
