//! Crate root for the load balancer core (spec §1): re-exports the wire
//! DTOs (`proto`) and the data-plane engine (`engine`) as a single public
//! API. No binary target and no config loader live here — the CLI/RPC
//! transport, YAML ingestion, and NIC I/O an embedding process needs are
//! all external collaborators the core only exposes narrow traits for
//! (`engine::io::{PacketSource, PacketSink}`, `engine::Clock`).

pub use proto::config::{
    BalancerConfig, PacketHandlerConfig, Real, RealUpdate, Scheduler, SessionsTimeouts,
    StateConfig, Subnet, VirtualService, VsFlags, WlcParams,
};
pub use proto::error::{Error, Result};
pub use proto::identifiers::{Protocol, RealIdentifier, RelativeRealIdentifier, VsIdentifier};
pub use proto::stats::{
    BalancerInfo, BalancerStats, CommonStats, IcmpStats, L4Stats, NamedRealStats, NamedVsStats,
    RealInfo, RealStats, SessionInfo, VsInfo, VsStats,
};
pub use proto::AddressSet;

pub use engine::clock::{Clock, SystemClock, VirtualClock};
pub use engine::handler::PacketHandler;
pub use engine::io::{MockIo, PacketSink, PacketSource};
pub use engine::manager::{BackingStore, ControlError, Manager};
