//! Match Items
//!
//! Typed protocol headers a flow rule matches on. Every header carries an
//! optional spec, mask and range-end ("last") value.
//!
//! # Design
//!
//! - Each header type declares the mask bits the hardware can match
//!   (`SUPPORTED`) and the mask applied when the caller gives none
//!   (`DEFAULT_MASK`)
//! - Items are validated field-wise before any layout is computed
//! - Ranges are not offloadable: `last` must equal `spec` under the mask

use flower_common::{FlowerError, FlowerResult};

/// Bitwise operations over one header field
trait Field: Copy {
    fn and(self, other: Self) -> Self;
    fn and_not(self, other: Self) -> Self;
    fn is_zero(self) -> bool;
}

macro_rules! int_field {
    ($($ty:ty),*) => {
        $(
            impl Field for $ty {
                #[inline(always)]
                fn and(self, other: Self) -> Self {
                    self & other
                }
                #[inline(always)]
                fn and_not(self, other: Self) -> Self {
                    self & !other
                }
                #[inline(always)]
                fn is_zero(self) -> bool {
                    self == 0
                }
            }
        )*
    };
}

int_field!(u8, u16, u32);

impl<const N: usize> Field for [u8; N] {
    fn and(self, other: Self) -> Self {
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = self[i] & other[i];
        }
        out
    }

    fn and_not(self, other: Self) -> Self {
        let mut out = [0u8; N];
        for i in 0..N {
            out[i] = self[i] & !other[i];
        }
        out
    }

    fn is_zero(self) -> bool {
        self.iter().all(|&b| b == 0)
    }
}

/// A matchable protocol header
pub trait Header: Copy + Default + PartialEq + std::fmt::Debug {
    /// Mask bits the hardware can match
    const SUPPORTED: Self;
    /// Mask used when the caller supplies none
    const DEFAULT_MASK: Self;
    /// Header name used in errors
    const NAME: &'static str;

    /// Field-wise AND
    fn and(&self, other: &Self) -> Self;
    /// Bits set in `self` but not in `other`
    fn and_not(&self, other: &Self) -> Self;
    /// Check whether every field is zero
    fn is_zero(&self) -> bool;
}

macro_rules! header {
    (
        $(#[$meta:meta])*
        $name:ident ($label:literal) {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $ty:ty = ($supported:expr, $default:expr)
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl Header for $name {
            const SUPPORTED: Self = Self { $($field: $supported,)* };
            const DEFAULT_MASK: Self = Self { $($field: $default,)* };
            const NAME: &'static str = $label;

            fn and(&self, other: &Self) -> Self {
                Self { $($field: Field::and(self.$field, other.$field),)* }
            }

            fn and_not(&self, other: &Self) -> Self {
                Self { $($field: Field::and_not(self.$field, other.$field),)* }
            }

            fn is_zero(&self) -> bool {
                true $(&& Field::is_zero(self.$field))*
            }
        }
    };
}

header! {
    /// Ethernet header
    EthSpec("eth") {
        /// Destination MAC
        dst: [u8; 6] = ([0xff; 6], [0xff; 6]),
        /// Source MAC
        src: [u8; 6] = ([0xff; 6], [0xff; 6]),
        /// Ethertype
        ether_type: u16 = (0xffff, 0),
    }
}

header! {
    /// 802.1Q tag
    VlanSpec("vlan") {
        /// Tag control information (PCP, DEI, VID)
        tci: u16 = (0xefff, 0x0fff),
        /// Encapsulated ethertype
        inner_type: u16 = (0xffff, 0),
    }
}

header! {
    /// IPv4 header
    Ipv4Spec("ipv4") {
        /// Type of service
        tos: u8 = (0xff, 0),
        /// Flags and fragment offset; not matchable
        fragment_offset: u16 = (0, 0),
        /// Time to live
        ttl: u8 = (0xff, 0),
        /// Next protocol
        proto: u8 = (0xff, 0),
        /// Source address
        src: [u8; 4] = ([0xff; 4], [0xff; 4]),
        /// Destination address
        dst: [u8; 4] = ([0xff; 4], [0xff; 4]),
    }
}

header! {
    /// IPv6 header
    Ipv6Spec("ipv6") {
        /// Version, traffic class and flow label
        vtc_flow: u32 = (0x0fff_ffff, 0),
        /// Next header
        proto: u8 = (0xff, 0),
        /// Hop limit
        hop_limits: u8 = (0xff, 0),
        /// Source address
        src: [u8; 16] = ([0xff; 16], [0xff; 16]),
        /// Destination address
        dst: [u8; 16] = ([0xff; 16], [0xff; 16]),
    }
}

header! {
    /// TCP header
    TcpSpec("tcp") {
        /// Source port
        src_port: u16 = (0xffff, 0xffff),
        /// Destination port
        dst_port: u16 = (0xffff, 0xffff),
        /// FIN, SYN, RST, PSH and URG flags
        flags: u8 = (0x2f, 0),
    }
}

header! {
    /// UDP header
    UdpSpec("udp") {
        /// Source port
        src_port: u16 = (0xffff, 0xffff),
        /// Destination port
        dst_port: u16 = (0xffff, 0xffff),
    }
}

header! {
    /// SCTP header
    SctpSpec("sctp") {
        /// Source port
        src_port: u16 = (0xffff, 0xffff),
        /// Destination port
        dst_port: u16 = (0xffff, 0xffff),
    }
}

header! {
    /// VXLAN header
    VxlanSpec("vxlan") {
        /// 24-bit network identifier
        vni: u32 = (0x00ff_ffff, 0x00ff_ffff),
    }
}

header! {
    /// Geneve header
    GeneveSpec("geneve") {
        /// 24-bit network identifier
        vni: u32 = (0x00ff_ffff, 0x00ff_ffff),
    }
}

header! {
    /// GRE header
    GreSpec("gre") {
        /// Checksum present, reserved, version
        c_rsvd0_ver: u16 = (0xa000, 0),
        /// Encapsulated protocol
        protocol: u16 = (0xffff, 0xffff),
    }
}

header! {
    /// GRE key extension
    GreKeySpec("gre_key") {
        /// Key value
        key: u32 = (0xffff_ffff, 0xffff_ffff),
    }
}

/// TCP flag bits as they appear on the wire
pub mod tcp_flags {
    /// FIN
    pub const FIN: u8 = 0x01;
    /// SYN
    pub const SYN: u8 = 0x02;
    /// RST
    pub const RST: u8 = 0x04;
    /// PSH
    pub const PSH: u8 = 0x08;
    /// URG
    pub const URG: u8 = 0x20;
}

/// Transparent Ethernet Bridging, the only protocol carried over GRE
pub const ETH_P_TEB: u16 = 0x6558;

/// Spec, mask and range-end of one header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match<T: Header> {
    /// Values to match; `None` matches any header of this type
    pub spec: Option<T>,
    /// Bits of `spec` that are significant
    pub mask: Option<T>,
    /// Upper end of a range
    pub last: Option<T>,
}

impl<T: Header> Default for Match<T> {
    fn default() -> Self {
        Self::any()
    }
}

impl<T: Header> Match<T> {
    /// Match any header of this type
    pub const fn any() -> Self {
        Self {
            spec: None,
            mask: None,
            last: None,
        }
    }

    /// Match `spec` under the default mask
    pub const fn new(spec: T) -> Self {
        Self {
            spec: Some(spec),
            mask: None,
            last: None,
        }
    }

    /// Set an explicit mask
    pub fn with_mask(mut self, mask: T) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Set a range end
    pub fn with_last(mut self, last: T) -> Self {
        self.last = Some(last);
        self
    }

    /// Mask in effect
    pub fn effective_mask(&self) -> T {
        self.mask.unwrap_or(T::DEFAULT_MASK)
    }

    /// `(spec & mask, mask)`, or `None` when nothing is matched
    pub fn values(&self) -> Option<(T, T)> {
        let mask = self.effective_mask();
        self.spec.map(|spec| (spec.and(&mask), mask))
    }

    /// Reject malformed or unsupported matches
    pub fn check(&self) -> FlowerResult<()> {
        let Some(spec) = self.spec else {
            if self.mask.is_some() || self.last.is_some() {
                return Err(FlowerError::invalid(format!("{}: mask or last without spec", T::NAME)));
            }
            return Ok(());
        };

        let mask = self.effective_mask();
        if !mask.and_not(&T::SUPPORTED).is_zero() {
            return Err(FlowerError::invalid(format!("{}: unsupported mask bits", T::NAME)));
        }

        if let Some(last) = self.last {
            if spec.and(&mask) != last.and(&mask) {
                return Err(FlowerError::invalid(format!("{}: ranges are not supported", T::NAME)));
            }
        }
        Ok(())
    }
}

/// One match item of a flow rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    /// Traffic arriving on a representor port
    PortId(u16),
    /// Ethernet
    Eth(Match<EthSpec>),
    /// VLAN tag
    Vlan(Match<VlanSpec>),
    /// IPv4
    Ipv4(Match<Ipv4Spec>),
    /// IPv6
    Ipv6(Match<Ipv6Spec>),
    /// TCP
    Tcp(Match<TcpSpec>),
    /// UDP
    Udp(Match<UdpSpec>),
    /// SCTP
    Sctp(Match<SctpSpec>),
    /// VXLAN
    Vxlan(Match<VxlanSpec>),
    /// Geneve
    Geneve(Match<GeneveSpec>),
    /// GRE
    Gre(Match<GreSpec>),
    /// GRE key
    GreKey(Match<GreKeySpec>),
}

/// Item type without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ItemKind {
    PortId,
    Eth,
    Vlan,
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    Sctp,
    Vxlan,
    Geneve,
    Gre,
    GreKey,
}

impl ItemKind {
    /// Item types a rule may start with
    pub const START: &'static [ItemKind] = &[ItemKind::Eth, ItemKind::Ipv4, ItemKind::Ipv6];

    /// Item types allowed to follow this one
    pub fn next(self) -> &'static [ItemKind] {
        use ItemKind::*;
        match self {
            PortId => &[],
            Eth => &[Vlan, Ipv4, Ipv6],
            Vlan => &[Ipv4, Ipv6],
            Ipv4 | Ipv6 => &[Tcp, Udp, Sctp, Gre],
            Udp => &[Vxlan, Geneve],
            Vxlan | Geneve => &[Eth],
            Gre => &[GreKey],
            GreKey => &[Eth],
            Tcp | Sctp => &[],
        }
    }

    /// Check whether this item opens a tunnel header
    pub fn is_tunnel(self) -> bool {
        matches!(self, ItemKind::Vxlan | ItemKind::Geneve | ItemKind::Gre)
    }

    /// Check whether this is a transport item
    pub fn is_l4(self) -> bool {
        matches!(self, ItemKind::Tcp | ItemKind::Udp | ItemKind::Sctp)
    }
}

impl Item {
    /// Item type
    pub fn kind(&self) -> ItemKind {
        match self {
            Item::PortId(_) => ItemKind::PortId,
            Item::Eth(_) => ItemKind::Eth,
            Item::Vlan(_) => ItemKind::Vlan,
            Item::Ipv4(_) => ItemKind::Ipv4,
            Item::Ipv6(_) => ItemKind::Ipv6,
            Item::Tcp(_) => ItemKind::Tcp,
            Item::Udp(_) => ItemKind::Udp,
            Item::Sctp(_) => ItemKind::Sctp,
            Item::Vxlan(_) => ItemKind::Vxlan,
            Item::Geneve(_) => ItemKind::Geneve,
            Item::Gre(_) => ItemKind::Gre,
            Item::GreKey(_) => ItemKind::GreKey,
        }
    }

    /// Validate the item's spec, mask and last
    pub fn check(&self) -> FlowerResult<()> {
        match self {
            Item::PortId(_) => Ok(()),
            Item::Eth(m) => m.check(),
            Item::Vlan(m) => m.check(),
            Item::Ipv4(m) => m.check(),
            Item::Ipv6(m) => m.check(),
            Item::Tcp(m) => m.check(),
            Item::Udp(m) => m.check(),
            Item::Sctp(m) => m.check(),
            Item::Vxlan(m) => m.check(),
            Item::Geneve(m) => m.check(),
            Item::Gre(m) => m.check(),
            Item::GreKey(m) => m.check(),
        }
    }
}
