pub mod table;

use std::net::IpAddr;

use proto::config::SessionsTimeouts;
use proto::identifiers::Protocol;

/// Flow tuple a session is keyed on (spec §3). For pure-L3 VSes `vs_port`
/// is the packet's destination port even though it isn't part of the VS
/// identity — it still has to be part of the key so flows to different
/// destination ports don't collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub vs_ip: IpAddr,
    pub vs_port: u16,
    pub proto: Protocol,
}

/// Coarse TCP state used only to pick a timeout bucket (spec §4.2):
/// payload inspection beyond the flag byte is not required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    Syn,
    SynAck,
    Established,
    Fin,
}

impl TcpState {
    /// Advance the state given the flags observed on a packet belonging
    /// to this flow. States only move forward towards `Fin`; a SYN seen
    /// after establishment does not regress the state (retransmissions
    /// and simultaneous-open are not distinguished from noise here).
    pub fn advance(self, syn: bool, ack: bool, fin: bool, rst: bool) -> Self {
        if fin || rst {
            return TcpState::Fin;
        }
        match self {
            TcpState::Syn if syn && ack => TcpState::SynAck,
            TcpState::Syn if ack && !syn => TcpState::Established,
            TcpState::SynAck => TcpState::Established,
            other => other,
        }
    }
}

/// Per-flow state: which real it was scheduled to, and enough timing
/// information to both refresh and expire it.
#[derive(Debug, Clone, Copy)]
pub struct SessionEntry {
    pub real_ip: IpAddr,
    pub created_at: u64,
    pub last_seen: u64,
    pub tcp_state: TcpState,
}

impl SessionEntry {
    pub fn new(real_ip: IpAddr, now: u64) -> Self {
        Self {
            real_ip,
            created_at: now,
            last_seen: now,
            tcp_state: TcpState::default(),
        }
    }

    pub fn timeout_secs(&self, proto: Protocol, timeouts: &SessionsTimeouts) -> u32 {
        match proto {
            Protocol::Udp => timeouts.udp,
            Protocol::Tcp => match self.tcp_state {
                TcpState::Syn => timeouts.tcp_syn,
                TcpState::SynAck => timeouts.tcp_synack,
                TcpState::Fin => timeouts.tcp_fin,
                TcpState::Established => timeouts.tcp,
            },
        }
    }

    pub fn is_expired(&self, now: u64, proto: Protocol, timeouts: &SessionsTimeouts) -> bool {
        let timeout = self.timeout_secs(proto, timeouts).max(timeouts.default.min(1));
        now.saturating_sub(self.last_seen) > timeout as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_state_advances_on_synack_then_ack() {
        let s = TcpState::Syn;
        let s = s.advance(true, true, false, false);
        assert_eq!(s, TcpState::SynAck);
        let s = s.advance(false, true, false, false);
        assert_eq!(s, TcpState::Established);
    }

    #[test]
    fn fin_or_rst_always_wins() {
        assert_eq!(
            TcpState::Established.advance(false, true, true, false),
            TcpState::Fin
        );
        assert_eq!(
            TcpState::Established.advance(false, false, false, true),
            TcpState::Fin
        );
    }
}
