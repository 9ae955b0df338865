use std::fmt;
use std::io;
use std::net::{AddrParseError, Ipv4Addr};
use std::ops::{BitAnd, Index};
use std::str::FromStr;

/// 6-byte hardware address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct LinkAddress(pub [u8; 6]);

impl LinkAddress {
    pub const NULL: LinkAddress = LinkAddress([0; 6]);
    pub const BROADCAST: LinkAddress = LinkAddress([0xFF; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for LinkAddress {
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 4-byte IPv4 address.
///
/// Besides equality it supports subnet masking and a `rank`, the number of set
/// bits, which the router uses to pick the most specific route.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NetworkAddress(pub [u8; 4]);

impl NetworkAddress {
    /// All-zero, meaning "let the router pick the source address".
    pub const UNSPECIFIED: NetworkAddress = NetworkAddress([0; 4]);
    pub const BROADCAST: NetworkAddress = NetworkAddress([0xFF; 4]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
    pub fn mask(self, mask: NetworkAddress) -> NetworkAddress {
        self & mask
    }
    pub fn rank(&self) -> u32 {
        u32::from_be_bytes(self.0).count_ones()
    }
    pub const fn octets(&self) -> [u8; 4] {
        self.0
    }
}

impl BitAnd for NetworkAddress {
    type Output = NetworkAddress;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self((u32::from_be_bytes(self.0) & u32::from_be_bytes(rhs.0)).to_be_bytes())
    }
}

impl Index<usize> for NetworkAddress {
    type Output = u8;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<[u8; 4]> for NetworkAddress {
    fn from(value: [u8; 4]) -> Self {
        Self(value)
    }
}

impl From<Ipv4Addr> for NetworkAddress {
    fn from(value: Ipv4Addr) -> Self {
        Self(value.octets())
    }
}

impl From<NetworkAddress> for Ipv4Addr {
    fn from(value: NetworkAddress) -> Self {
        Ipv4Addr::from(value.0)
    }
}

impl FromStr for NetworkAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Self::from)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Ipv4Addr::from(*self), f)
    }
}

impl fmt::Debug for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub trait ToNetworkAddress {
    fn to_addr(&self) -> io::Result<NetworkAddress>;
}
impl ToNetworkAddress for NetworkAddress {
    fn to_addr(&self) -> io::Result<NetworkAddress> {
        Ok(*self)
    }
}
impl ToNetworkAddress for Ipv4Addr {
    fn to_addr(&self) -> io::Result<NetworkAddress> {
        Ok((*self).into())
    }
}
impl ToNetworkAddress for [u8; 4] {
    fn to_addr(&self) -> io::Result<NetworkAddress> {
        Ok((*self).into())
    }
}
impl ToNetworkAddress for &str {
    fn to_addr(&self) -> io::Result<NetworkAddress> {
        self.parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")))
    }
}
impl ToNetworkAddress for String {
    fn to_addr(&self) -> io::Result<NetworkAddress> {
        self.as_str().to_addr()
    }
}
