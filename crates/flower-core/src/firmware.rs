//! Firmware Channel
//!
//! The engine talks to the NIC only through [`Firmware`]. Each request is
//! synchronous and either accepted or refused with a [`FirmwareCode`].
//!
//! [`LoopbackFirmware`] accepts everything, records what it was sent and
//! can be told to refuse a kind of request. It backs dry runs and tests.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

use flower_common::FirmwareCode;
use tracing::trace;

use crate::action::RssConf;
use crate::flow::{CompiledFlow, FlowMeta};
use crate::tunnel::{IpOffloadList, NeighborNotice, NeighborPayload};

/// Requests the engine sends to the NIC
pub trait Firmware {
    /// Program a flow
    fn install(&mut self, flow: &CompiledFlow) -> Result<(), FirmwareCode>;

    /// Remove a programmed flow
    fn remove(&mut self, flow: &CompiledFlow) -> Result<(), FirmwareCode>;

    /// Program a tunnel neighbor
    fn notify_tunnel_neighbor(&mut self, notice: &NeighborNotice) -> Result<(), FirmwareCode>;

    /// Remove a tunnel neighbor
    fn notify_tunnel_neighbor_remove(&mut self, notice: &NeighborNotice) -> Result<(), FirmwareCode>;

    /// Add or remove a MAC table rule
    fn notify_mac_table(&mut self, mac: [u8; 6], index: u16, remove: bool) -> Result<(), FirmwareCode>;

    /// Add or remove a pre-tunnel rule
    fn notify_pre_tunnel_rule(&mut self, meta: &FlowMeta, index: u16, remove: bool) -> Result<(), FirmwareCode>;

    /// Replace the tunnel endpoint list of one address family
    fn notify_ip_offload(&mut self, list: IpOffloadList<'_>) -> Result<(), FirmwareCode>;

    /// Configure or clear an RSS spread on a port
    fn configure_rss(&mut self, _port: u16, _conf: &RssConf, _remove: bool) -> Result<(), FirmwareCode> {
        Ok(())
    }
}

/// A request as recorded by [`LoopbackFirmware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareMessage {
    /// Flow programmed
    Install {
        /// Flow digest
        hash_key: u32,
        /// Stats context
        host_ctx: u32,
    },
    /// Flow removed
    Remove {
        /// Flow digest
        hash_key: u32,
        /// Stats context
        host_ctx: u32,
    },
    /// Tunnel neighbor programmed
    TunnelNeighbor(NeighborNotice),
    /// Tunnel neighbor removed
    TunnelNeighborRemove(NeighborPayload),
    /// MAC table rule
    MacTable {
        /// Port MAC
        mac: [u8; 6],
        /// MAC table index
        index: u16,
        /// Removal
        remove: bool,
    },
    /// Pre-tunnel rule
    PreTunnelRule {
        /// Stats context of the flow that triggered it
        host_ctx: u32,
        /// MAC table index
        index: u16,
        /// Removal
        remove: bool,
    },
    /// IPv4 tunnel endpoint list
    IpOffloadV4(Vec<Ipv4Addr>),
    /// IPv6 tunnel endpoint list
    IpOffloadV6(Vec<Ipv6Addr>),
    /// RSS spread
    Rss {
        /// Port id
        port: u16,
        /// Queues
        queues: Vec<u16>,
        /// Removal
        remove: bool,
    },
}

/// Kind of a [`FirmwareMessage`], used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Flow install
    Install,
    /// Flow remove
    Remove,
    /// Neighbor add
    TunnelNeighbor,
    /// Neighbor remove
    TunnelNeighborRemove,
    /// MAC table rule
    MacTable,
    /// Pre-tunnel rule
    PreTunnelRule,
    /// Endpoint list
    IpOffload,
    /// RSS
    Rss,
}

impl FirmwareMessage {
    /// Kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            FirmwareMessage::Install { .. } => MessageKind::Install,
            FirmwareMessage::Remove { .. } => MessageKind::Remove,
            FirmwareMessage::TunnelNeighbor(_) => MessageKind::TunnelNeighbor,
            FirmwareMessage::TunnelNeighborRemove(_) => MessageKind::TunnelNeighborRemove,
            FirmwareMessage::MacTable { .. } => MessageKind::MacTable,
            FirmwareMessage::PreTunnelRule { .. } => MessageKind::PreTunnelRule,
            FirmwareMessage::IpOffloadV4(_) | FirmwareMessage::IpOffloadV6(_) => MessageKind::IpOffload,
            FirmwareMessage::Rss { .. } => MessageKind::Rss,
        }
    }
}

/// In-memory firmware
#[derive(Debug, Default)]
pub struct LoopbackFirmware {
    messages: Vec<FirmwareMessage>,
    failures: HashMap<MessageKind, FirmwareCode>,
    installed: HashSet<u32>,
}

impl LoopbackFirmware {
    /// Create a firmware that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every request of `kind` with `code` until cleared
    pub fn fail_on(&mut self, kind: MessageKind, code: FirmwareCode) {
        self.failures.insert(kind, code);
    }

    /// Accept everything again
    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    /// Accepted requests, oldest first
    pub fn messages(&self) -> &[FirmwareMessage] {
        &self.messages
    }

    /// Take the accepted requests
    pub fn take_messages(&mut self) -> Vec<FirmwareMessage> {
        std::mem::take(&mut self.messages)
    }

    /// Number of accepted requests of `kind`
    pub fn count(&self, kind: MessageKind) -> usize {
        self.messages.iter().filter(|m| m.kind() == kind).count()
    }

    /// Digests of the flows currently programmed
    pub fn installed(&self) -> &HashSet<u32> {
        &self.installed
    }

    fn submit(&mut self, msg: FirmwareMessage) -> Result<(), FirmwareCode> {
        if let Some(&code) = self.failures.get(&msg.kind()) {
            trace!(kind = ?msg.kind(), %code, "loopback refused request");
            return Err(code);
        }
        trace!(kind = ?msg.kind(), "loopback accepted request");
        self.messages.push(msg);
        Ok(())
    }
}

impl Firmware for LoopbackFirmware {
    fn install(&mut self, flow: &CompiledFlow) -> Result<(), FirmwareCode> {
        self.submit(FirmwareMessage::Install {
            hash_key: flow.hash_key,
            host_ctx: flow.meta.host_ctx_id,
        })?;
        self.installed.insert(flow.hash_key);
        Ok(())
    }

    fn remove(&mut self, flow: &CompiledFlow) -> Result<(), FirmwareCode> {
        self.submit(FirmwareMessage::Remove {
            hash_key: flow.hash_key,
            host_ctx: flow.meta.host_ctx_id,
        })?;
        self.installed.remove(&flow.hash_key);
        Ok(())
    }

    fn notify_tunnel_neighbor(&mut self, notice: &NeighborNotice) -> Result<(), FirmwareCode> {
        self.submit(FirmwareMessage::TunnelNeighbor(*notice))
    }

    fn notify_tunnel_neighbor_remove(&mut self, notice: &NeighborNotice) -> Result<(), FirmwareCode> {
        self.submit(FirmwareMessage::TunnelNeighborRemove(notice.payload))
    }

    fn notify_mac_table(&mut self, mac: [u8; 6], index: u16, remove: bool) -> Result<(), FirmwareCode> {
        self.submit(FirmwareMessage::MacTable { mac, index, remove })
    }

    fn notify_pre_tunnel_rule(&mut self, meta: &FlowMeta, index: u16, remove: bool) -> Result<(), FirmwareCode> {
        self.submit(FirmwareMessage::PreTunnelRule {
            host_ctx: meta.host_ctx_id,
            index,
            remove,
        })
    }

    fn notify_ip_offload(&mut self, list: IpOffloadList<'_>) -> Result<(), FirmwareCode> {
        self.submit(match list {
            IpOffloadList::V4(addrs) => FirmwareMessage::IpOffloadV4(addrs.to_vec()),
            IpOffloadList::V6(addrs) => FirmwareMessage::IpOffloadV6(addrs.to_vec()),
        })
    }

    fn configure_rss(&mut self, port: u16, conf: &RssConf, remove: bool) -> Result<(), FirmwareCode> {
        self.submit(FirmwareMessage::Rss {
            port,
            queues: conf.queues.clone(),
            remove,
        })
    }
}
