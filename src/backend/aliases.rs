use super::{
    service::AttributionBackend,
    traits::{
        OsRandomSource, PlainEncryptor, RegistrableSiteCanonicalizer,
        SystemClock,
    },
};

/// Production wiring: system clock, thread-local entropy, debug sealing,
/// host-side canonicalization.
pub type DefaultBackend = AttributionBackend<
    SystemClock,
    OsRandomSource,
    PlainEncryptor,
    RegistrableSiteCanonicalizer,
>;
