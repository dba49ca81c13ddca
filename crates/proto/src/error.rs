use std::fmt;

/// Errors returned by the control surface (`update_reals`, `manager_attach`,
/// ...). These are the only errors that ever leave the core: per-packet
/// failures are counted, not propagated.
#[derive(Debug)]
pub enum Error {
    /// A `RealUpdate` referenced a virtual service that does not exist in
    /// the current configuration.
    UnknownVs,
    /// A `RealUpdate` referenced a real that does not exist under its VS.
    UnknownReal,
    /// A `VirtualService` violated an invariant (`pure_l3 => port == 0`,
    /// duplicate identifier, zero reals, ...).
    InvalidConfig(String),
    /// The named manager was not found in the shared backing store.
    UnknownManager(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownVs => write!(f, "unknown virtual service"),
            Self::UnknownReal => write!(f, "unknown real"),
            Self::InvalidConfig(reason) => write!(f, "invalid config: {reason}"),
            Self::UnknownManager(name) => write!(f, "unknown manager: {name}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
