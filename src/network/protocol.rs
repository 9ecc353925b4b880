//! Ember protocol message handling
//!
//! Wire constants, message types, and the payload codec. Decoding never
//! panics: every decoder returns a [`CodecError`] which the dispatcher maps
//! to a `reject` reply, keeping malformed payloads from taking the
//! connection down with them.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: i32 = 80003;
/// Peers below this protocol version are rejected and banned.
pub const MIN_PEER_PROTO_VERSION: i32 = 60001;
/// Ping messages carry a nonce from this version on.
pub const BIP0031_VERSION: i32 = 60000;
/// addr entries carry timestamps from this version on.
pub const CADDR_TIME_VERSION: i32 = 31402;
/// Peers at or above this version must not send filter* without NODE_BLOOM.
pub const NO_BLOOM_VERSION: i32 = 70011;
/// sendheaders is understood from this version on.
pub const SENDHEADERS_VERSION: i32 = 70012;
/// sendcmpct is understood from this version on.
pub const SENDCMPCT_VERSION: i32 = 70014;
/// Extension handshake (port exchange for expedited relay) minimum version.
pub const EXPEDITED_VERSION: i32 = 80002;

/// Service bit: full chain served.
pub const NODE_NETWORK: u64 = 1;
/// Service bit: bloom-filtered connections served.
pub const NODE_BLOOM: u64 = 1 << 2;
/// Service bit: thin block relay supported.
pub const NODE_XTHIN: u64 = 1 << 4;

/// Envelope layout.
pub const MESSAGE_START_SIZE: usize = 4;
pub const COMMAND_SIZE: usize = 12;
pub const HEADER_SIZE: usize = MESSAGE_START_SIZE + COMMAND_SIZE + 4 + 4;
/// Hard cap on a single framed message.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;

/// Inventory list cap for `inv` and `getdata`.
pub const MAX_INV_SZ: usize = 50_000;
/// Header batch cap for `headers`.
pub const MAX_HEADERS_RESULTS: usize = 2_000;
/// Address batch cap for `addr`.
pub const MAX_ADDR_TO_RELAY: usize = 1_000;
/// Block inv cap per `getblocks` walk.
pub const MAX_GETBLOCKS_RESULTS: usize = 500;
/// Inventory entries drained per send tick.
pub const MAX_INV_TO_SEND: usize = 1_000;
/// Block hashes announced via headers rather than falling back to inv.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;
/// Longest accepted user agent.
pub const MAX_SUBVERSION_LENGTH: usize = 256;
/// Longest accepted reject reason.
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;
/// Largest script element; bounds `filteradd` payloads.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Largest accepted bloom filter, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Most hash functions a peer may ask a bloom filter to run.
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;
/// Floor for the advertised thin-block bloom filter size.
pub const SMALLEST_MAX_BLOOM_FILTER_SIZE: u32 = 36_000;

/// Seconds between keepalive pings.
pub const PING_INTERVAL: u64 = 120;
/// Average seconds between trickled own-address broadcasts.
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL: u64 = 24 * 60 * 60;
/// Average seconds between relayed-address broadcasts.
pub const AVG_ADDRESS_BROADCAST_INTERVAL: u64 = 30;

/// Reject codes carried in `reject` messages.
pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;

pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const ADDR: &str = "addr";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const NOTFOUND: &str = "notfound";
    pub const GETBLOCKS: &str = "getblocks";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const TX: &str = "tx";
    pub const BLOCK: &str = "block";
    pub const MERKLEBLOCK: &str = "merkleblock";
    pub const GETADDR: &str = "getaddr";
    pub const MEMPOOL: &str = "mempool";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SENDHEADERS: &str = "sendheaders";
    pub const SENDCMPCT: &str = "sendcmpct";
    pub const FILTERLOAD: &str = "filterload";
    pub const FILTERADD: &str = "filteradd";
    pub const FILTERCLEAR: &str = "filterclear";
    pub const FILTERSIZEXTHIN: &str = "filtersizexthin";
    pub const REJECT: &str = "reject";
    pub const XVERSION: &str = "xversion";
    pub const XVERACK: &str = "xverack";
}

/// 32-byte hash (double-SHA256 family). Displayed in the conventional
/// reversed hex order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Deterministic test helper: a hash with one distinguishing byte.
    pub fn from_byte(b: u8) -> Self {
        let mut h = [0u8; 32];
        h[0] = b;
        Hash256(h)
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rev = self.0;
        rev.reverse();
        write!(f, "{}", hex::encode(rev))
    }
}

impl std::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Double SHA-256, the consensus hash.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash256(out)
}

/// Payload decoding failure. Converted to a `reject` at the dispatcher
/// boundary, never an unwind.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of payload")]
    UnexpectedEnd,
    #[error("length {got} exceeds cap {cap}")]
    OversizedLength { got: u64, cap: u64 },
    #[error("non-canonical compact size")]
    NonCanonical,
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Bounds-checked little-endian reader over a payload slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_hash(&mut self) -> Result<Hash256, CodecError> {
        let b = self.take(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(Hash256(arr))
    }

    /// Bitcoin compact-size integer, canonical encoding required.
    pub fn read_compact_size(&mut self) -> Result<u64, CodecError> {
        let tag = self.read_u8()?;
        let value = match tag {
            0..=0xfc => tag as u64,
            0xfd => {
                let v = self.read_u16()? as u64;
                if v < 0xfd {
                    return Err(CodecError::NonCanonical);
                }
                v
            }
            0xfe => {
                let v = self.read_u32()? as u64;
                if v <= u16::MAX as u64 {
                    return Err(CodecError::NonCanonical);
                }
                v
            }
            0xff => {
                let v = self.read_u64()?;
                if v <= u32::MAX as u64 {
                    return Err(CodecError::NonCanonical);
                }
                v
            }
        };
        Ok(value)
    }

    /// Read a compact-size count of items with a known minimum encoded size,
    /// bounding the allocation by what the payload could actually hold.
    pub fn read_count(&mut self, min_elem_size: usize) -> Result<usize, CodecError> {
        let count = self.read_compact_size()?;
        let cap = (self.remaining() / min_elem_size.max(1)) as u64;
        if count > cap {
            return Err(CodecError::OversizedLength { got: count, cap });
        }
        Ok(count as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_compact_size()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::OversizedLength {
                got: len,
                cap: self.remaining() as u64,
            });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Length-limited string, the LIMITED_STRING of the wire format.
    pub fn read_var_string(&mut self, max_len: usize) -> Result<String, CodecError> {
        let len = self.read_compact_size()?;
        if len > max_len as u64 {
            return Err(CodecError::OversizedLength {
                got: len,
                cap: max_len as u64,
            });
        }
        if len > self.remaining() as u64 {
            return Err(CodecError::UnexpectedEnd);
        }
        let raw = self.take(len as usize)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidField("non-utf8 string"))
    }
}

/// Little-endian writer; the encode side never fails.
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u16_be(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn put_hash(&mut self, h: &Hash256) {
        self.buf.put_slice(&h.0);
    }

    pub fn put_compact_size(&mut self, v: u64) {
        match v {
            0..=0xfc => self.buf.put_u8(v as u8),
            0xfd..=0xffff => {
                self.buf.put_u8(0xfd);
                self.buf.put_u16_le(v as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.buf.put_u8(0xfe);
                self.buf.put_u32_le(v as u32);
            }
            _ => {
                self.buf.put_u8(0xff);
                self.buf.put_u64_le(v);
            }
        }
    }

    pub fn put_var_bytes(&mut self, data: &[u8]) {
        self.put_compact_size(data.len() as u64);
        self.buf.put_slice(data);
    }

    pub fn put_var_string(&mut self, s: &str) {
        self.put_var_bytes(s.as_bytes());
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Inventory vector kinds. `FilteredBlock` and `ThinBlock` are block-class:
/// they are served from block storage and count against block serving rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
    FilteredBlock,
    ThinBlock,
}

impl InvKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(InvKind::Tx),
            2 => Some(InvKind::Block),
            3 => Some(InvKind::FilteredBlock),
            4 => Some(InvKind::ThinBlock),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
            InvKind::FilteredBlock => 3,
            InvKind::ThinBlock => 4,
        }
    }

    pub fn is_block_class(self) -> bool {
        matches!(
            self,
            InvKind::Block | InvKind::FilteredBlock | InvKind::ThinBlock
        )
    }
}

/// A single inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    pub fn tx(hash: Hash256) -> Self {
        Inv {
            kind: InvKind::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Inv {
            kind: InvKind::Block,
            hash,
        }
    }

    fn decode(r: &mut Reader) -> Result<(u32, Hash256), CodecError> {
        Ok((r.read_u32()?, r.read_hash()?))
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.kind.to_u32());
        w.put_hash(&self.hash);
    }
}

/// Raw inventory entry as decoded from the wire; the kind is unvalidated so
/// handlers can score unknown kinds instead of the codec rejecting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInv {
    pub kind: u32,
    pub hash: Hash256,
}

impl RawInv {
    pub fn known(&self) -> Option<Inv> {
        InvKind::from_u32(self.kind).map(|kind| Inv {
            kind,
            hash: self.hash,
        })
    }
}

/// Network address as gossiped in `addr` messages and the version handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddress {
    /// Last-seen time; absent (zero) inside version messages.
    pub time: u32,
    pub services: u64,
    /// IPv6, with v4 mapped into ::ffff:a.b.c.d.
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket_addr(addr: std::net::SocketAddr, services: u64, time: u32) -> Self {
        let ip = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            std::net::IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            time,
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(&self) -> std::net::SocketAddr {
        let v6 = std::net::Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => std::net::IpAddr::V4(v4),
            None => std::net::IpAddr::V6(v6),
        };
        std::net::SocketAddr::new(ip, self.port)
    }

    /// Whether this is an IPv4 address in the mapped v6 wire form.
    pub fn is_ipv4(&self) -> bool {
        std::net::Ipv6Addr::from(self.ip).to_ipv4_mapped().is_some()
    }

    /// Whether the address is publicly routable: not unspecified, loopback,
    /// link-local or RFC1918 space, and carries a nonzero port.
    pub fn is_routable(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        match self.to_socket_addr().ip() {
            std::net::IpAddr::V4(ip) => {
                !(ip.is_private()
                    || ip.is_loopback()
                    || ip.is_link_local()
                    || ip.is_unspecified()
                    || ip.is_broadcast())
            }
            std::net::IpAddr::V6(ip) => {
                let seg = ip.segments();
                !(ip.is_loopback()
                    || ip.is_unspecified()
                    || (seg[0] & 0xff00) == 0xfd00
                    || (seg[0] & 0xffc0) == 0xfe80)
            }
        }
    }

    /// Stable key for known-address filters.
    pub fn key(&self) -> Vec<u8> {
        let mut k = Vec::with_capacity(18);
        k.extend_from_slice(&self.ip);
        k.extend_from_slice(&self.port.to_be_bytes());
        k
    }

    fn decode(r: &mut Reader, with_time: bool) -> Result<Self, CodecError> {
        let time = if with_time { r.read_u32()? } else { 0 };
        let services = r.read_u64()?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(r.take_ip()?);
        // port is big-endian on the wire, a protocol fossil
        let port = r.read_u16_be()?;
        Ok(Self {
            time,
            services,
            ip,
            port,
        })
    }

    fn encode(&self, w: &mut Writer, with_time: bool) {
        if with_time {
            w.put_u32(self.time);
        }
        w.put_u64(self.services);
        w.put_slice(&self.ip);
        w.put_u16_be(self.port);
    }
}

impl<'a> Reader<'a> {
    fn take_ip(&mut self) -> Result<&'a [u8], CodecError> {
        self.take(16)
    }
}

/// Consensus block header, 80 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut w = Writer::new();
        self.encode(&mut w);
        double_sha256(&w.freeze())
    }

    pub fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.read_i32()?,
            prev_block: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }

    pub fn encode(&self, w: &mut Writer) {
        w.put_i32(self.version);
        w.put_hash(&self.prev_block);
        w.put_hash(&self.merkle_root);
        w.put_u32(self.time);
        w.put_u32(self.bits);
        w.put_u32(self.nonce);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

/// Transaction in consensus serialization. The peer layer never interprets
/// scripts; it only needs stable hashing and bloom matching over the parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let mut w = Writer::new();
        self.encode(&mut w);
        double_sha256(&w.freeze())
    }

    pub fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let version = r.read_i32()?;
        let n_in = r.read_count(41)?;
        let mut inputs = Vec::with_capacity(n_in);
        for _ in 0..n_in {
            let txid = r.read_hash()?;
            let index = r.read_u32()?;
            let script_sig = r.read_var_bytes()?;
            let sequence = r.read_u32()?;
            inputs.push(TxIn {
                prev_out: OutPoint { txid, index },
                script_sig,
                sequence,
            });
        }
        let n_out = r.read_count(9)?;
        let mut outputs = Vec::with_capacity(n_out);
        for _ in 0..n_out {
            let value = r.read_i64()?;
            let script_pubkey = r.read_var_bytes()?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = r.read_u32()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn encode(&self, w: &mut Writer) {
        w.put_i32(self.version);
        w.put_compact_size(self.inputs.len() as u64);
        for input in &self.inputs {
            w.put_hash(&input.prev_out.txid);
            w.put_u32(input.prev_out.index);
            w.put_var_bytes(&input.script_sig);
            w.put_u32(input.sequence);
        }
        w.put_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            w.put_i64(output.value);
            w.put_var_bytes(&output.script_pubkey);
        }
        w.put_u32(self.lock_time);
    }
}

/// Full block: header plus transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(r)?;
        let n_tx = r.read_count(10)?;
        let mut txs = Vec::with_capacity(n_tx);
        for _ in 0..n_tx {
            txs.push(Transaction::decode(r)?);
        }
        Ok(Self { header, txs })
    }

    pub fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.put_compact_size(self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(w);
        }
    }
}

/// Geometric back-off sample of recent chain hashes used to agree on a fork
/// point with a peer. An empty locator asks for the stop hash alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockLocator {
    pub have: Vec<Hash256>,
}

impl BlockLocator {
    pub fn is_null(&self) -> bool {
        self.have.is_empty()
    }

    fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        // leading client-version field, kept on the wire for compatibility
        let _version = r.read_u32()?;
        let count = r.read_count(32)?;
        let mut have = Vec::with_capacity(count);
        for _ in 0..count {
            have.push(r.read_hash()?);
        }
        Ok(Self { have })
    }

    fn encode(&self, w: &mut Writer) {
        w.put_u32(PROTOCOL_VERSION as u32);
        w.put_compact_size(self.have.len() as u64);
        for h in &self.have {
            w.put_hash(h);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Present for block/tx rejections.
    pub hash: Option<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadMessage {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Addr(Vec<NetAddress>),
    Inv(Vec<RawInv>),
    GetData(Vec<RawInv>),
    NotFound(Vec<Inv>),
    GetBlocks {
        locator: BlockLocator,
        hash_stop: Hash256,
    },
    GetHeaders {
        locator: BlockLocator,
        hash_stop: Hash256,
    },
    Headers(Vec<BlockHeader>),
    Tx(Transaction),
    Block(Block),
    /// Filtered block: header, total tx count, matched hashes and flag bits,
    /// as served to bloom-filtering peers.
    MerkleBlock {
        header: BlockHeader,
        total_txs: u32,
        matched: Vec<Hash256>,
        flags: Vec<u8>,
    },
    GetAddr,
    Mempool,
    /// Nonce absent only for pre-BIP31 peers.
    Ping(Option<u64>),
    /// Nonce absent when the peer sent a short payload.
    Pong(Option<u64>),
    SendHeaders,
    SendCmpct {
        high_bandwidth: bool,
        version: u64,
    },
    FilterLoad(FilterLoadMessage),
    FilterAdd {
        data: Vec<u8>,
    },
    FilterClear,
    FilterSizeXthin(u32),
    Reject(RejectMessage),
    /// Extension handshake: carries our listening port for expedited relay.
    XVersion {
        listen_port: u16,
    },
    XVerack,
    /// Unknown command, ignored for forward compatibility.
    Unknown {
        command: String,
    },
}

impl Message {
    /// Wire command for this message.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => commands::VERSION,
            Message::Verack => commands::VERACK,
            Message::Addr(_) => commands::ADDR,
            Message::Inv(_) => commands::INV,
            Message::GetData(_) => commands::GETDATA,
            Message::NotFound(_) => commands::NOTFOUND,
            Message::GetBlocks { .. } => commands::GETBLOCKS,
            Message::GetHeaders { .. } => commands::GETHEADERS,
            Message::Headers(_) => commands::HEADERS,
            Message::Tx(_) => commands::TX,
            Message::Block(_) => commands::BLOCK,
            Message::MerkleBlock { .. } => commands::MERKLEBLOCK,
            Message::GetAddr => commands::GETADDR,
            Message::Mempool => commands::MEMPOOL,
            Message::Ping(_) => commands::PING,
            Message::Pong(_) => commands::PONG,
            Message::SendHeaders => commands::SENDHEADERS,
            Message::SendCmpct { .. } => commands::SENDCMPCT,
            Message::FilterLoad(_) => commands::FILTERLOAD,
            Message::FilterAdd { .. } => commands::FILTERADD,
            Message::FilterClear => commands::FILTERCLEAR,
            Message::FilterSizeXthin(_) => commands::FILTERSIZEXTHIN,
            Message::Reject(_) => commands::REJECT,
            Message::XVersion { .. } => commands::XVERSION,
            Message::XVerack => commands::XVERACK,
            Message::Unknown { command } => command,
        }
    }

    /// Encode the payload body (without the envelope).
    pub fn encode_payload(&self) -> Bytes {
        let mut w = Writer::new();
        match self {
            Message::Version(v) => {
                w.put_i32(v.version);
                w.put_u64(v.services);
                w.put_i64(v.timestamp);
                v.addr_recv.encode(&mut w, false);
                v.addr_from.encode(&mut w, false);
                w.put_u64(v.nonce);
                w.put_var_string(&v.user_agent);
                w.put_i32(v.start_height);
                w.put_bool(v.relay);
            }
            Message::Verack
            | Message::GetAddr
            | Message::Mempool
            | Message::SendHeaders
            | Message::FilterClear
            | Message::XVerack
            | Message::Unknown { .. } => {}
            Message::Addr(addrs) => {
                w.put_compact_size(addrs.len() as u64);
                for a in addrs {
                    a.encode(&mut w, true);
                }
            }
            Message::Inv(invs) | Message::GetData(invs) => {
                w.put_compact_size(invs.len() as u64);
                for inv in invs {
                    w.put_u32(inv.kind);
                    w.put_hash(&inv.hash);
                }
            }
            Message::NotFound(invs) => {
                w.put_compact_size(invs.len() as u64);
                for inv in invs {
                    inv.encode(&mut w);
                }
            }
            Message::GetBlocks { locator, hash_stop }
            | Message::GetHeaders { locator, hash_stop } => {
                locator.encode(&mut w);
                w.put_hash(hash_stop);
            }
            Message::Headers(headers) => {
                w.put_compact_size(headers.len() as u64);
                for h in headers {
                    h.encode(&mut w);
                    // trailing tx count, always zero for bare headers
                    w.put_compact_size(0);
                }
            }
            Message::Tx(tx) => tx.encode(&mut w),
            Message::Block(block) => block.encode(&mut w),
            Message::MerkleBlock {
                header,
                total_txs,
                matched,
                flags,
            } => {
                header.encode(&mut w);
                w.put_u32(*total_txs);
                w.put_compact_size(matched.len() as u64);
                for h in matched {
                    w.put_hash(h);
                }
                w.put_var_bytes(flags);
            }
            Message::Ping(nonce) | Message::Pong(nonce) => {
                if let Some(n) = nonce {
                    w.put_u64(*n);
                }
            }
            Message::SendCmpct {
                high_bandwidth,
                version,
            } => {
                w.put_bool(*high_bandwidth);
                w.put_u64(*version);
            }
            Message::FilterLoad(f) => {
                w.put_var_bytes(&f.data);
                w.put_u32(f.hash_funcs);
                w.put_u32(f.tweak);
                w.put_u8(f.flags);
            }
            Message::FilterAdd { data } => {
                w.put_var_bytes(data);
            }
            Message::FilterSizeXthin(size) => {
                w.put_u32(*size);
            }
            Message::Reject(r) => {
                w.put_var_string(&r.message);
                w.put_u8(r.code);
                w.put_var_string(&r.reason);
                if let Some(hash) = &r.hash {
                    w.put_hash(hash);
                }
            }
            Message::XVersion { listen_port } => {
                w.put_u16(*listen_port);
            }
        }
        w.freeze()
    }

    /// Envelope size on the wire: header plus payload.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.encode_payload().len()
    }

    /// Decode a payload for the given command. Unknown commands decode to
    /// [`Message::Unknown`] so the dispatcher can skip them.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, CodecError> {
        let mut r = Reader::new(payload);
        let msg = match command {
            commands::VERSION => {
                let version = r.read_i32()?;
                let services = r.read_u64()?;
                let timestamp = r.read_i64()?;
                let addr_recv = NetAddress::decode(&mut r, false)?;
                // Trailing fields are optional for very old peers.
                let addr_from = if r.remaining() > 0 {
                    NetAddress::decode(&mut r, false)?
                } else {
                    NetAddress {
                        time: 0,
                        services: 0,
                        ip: [0u8; 16],
                        port: 0,
                    }
                };
                let nonce = if r.remaining() > 0 { r.read_u64()? } else { 0 };
                let user_agent = if r.remaining() > 0 {
                    r.read_var_string(MAX_SUBVERSION_LENGTH)?
                } else {
                    String::new()
                };
                let start_height = if r.remaining() > 0 { r.read_i32()? } else { 0 };
                let relay = if r.remaining() > 0 {
                    r.read_bool()?
                } else {
                    true
                };
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            commands::VERACK => Message::Verack,
            commands::ADDR => {
                let count = r.read_count(30)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(NetAddress::decode(&mut r, true)?);
                }
                Message::Addr(addrs)
            }
            commands::INV | commands::GETDATA => {
                let count = r.read_count(36)?;
                let mut invs = Vec::with_capacity(count);
                for _ in 0..count {
                    let (kind, hash) = Inv::decode(&mut r)?;
                    invs.push(RawInv { kind, hash });
                }
                if command == commands::INV {
                    Message::Inv(invs)
                } else {
                    Message::GetData(invs)
                }
            }
            commands::NOTFOUND => {
                let count = r.read_count(36)?;
                let mut invs = Vec::with_capacity(count);
                for _ in 0..count {
                    let (kind, hash) = Inv::decode(&mut r)?;
                    let kind =
                        InvKind::from_u32(kind).ok_or(CodecError::InvalidField("inv kind"))?;
                    invs.push(Inv { kind, hash });
                }
                Message::NotFound(invs)
            }
            commands::GETBLOCKS => Message::GetBlocks {
                locator: BlockLocator::decode(&mut r)?,
                hash_stop: r.read_hash()?,
            },
            commands::GETHEADERS => Message::GetHeaders {
                locator: BlockLocator::decode(&mut r)?,
                hash_stop: r.read_hash()?,
            },
            commands::HEADERS => {
                let count = r.read_count(81)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::decode(&mut r)?);
                    // tx count trailer; always present, assumed zero
                    r.read_compact_size()?;
                }
                Message::Headers(headers)
            }
            commands::TX => Message::Tx(Transaction::decode(&mut r)?),
            commands::BLOCK => Message::Block(Block::decode(&mut r)?),
            commands::MERKLEBLOCK => {
                let header = BlockHeader::decode(&mut r)?;
                let total_txs = r.read_u32()?;
                let count = r.read_count(32)?;
                let mut matched = Vec::with_capacity(count);
                for _ in 0..count {
                    matched.push(r.read_hash()?);
                }
                let flags = r.read_var_bytes()?;
                Message::MerkleBlock {
                    header,
                    total_txs,
                    matched,
                    flags,
                }
            }
            commands::GETADDR => Message::GetAddr,
            commands::MEMPOOL => Message::Mempool,
            commands::PING => {
                let nonce = if r.remaining() >= 8 {
                    Some(r.read_u64()?)
                } else {
                    None
                };
                Message::Ping(nonce)
            }
            commands::PONG => {
                let nonce = if r.remaining() >= 8 {
                    Some(r.read_u64()?)
                } else {
                    None
                };
                Message::Pong(nonce)
            }
            commands::SENDHEADERS => Message::SendHeaders,
            commands::SENDCMPCT => Message::SendCmpct {
                high_bandwidth: r.read_bool()?,
                version: r.read_u64()?,
            },
            commands::FILTERLOAD => {
                // Oversize is a handler decision (misbehavior), not a codec
                // error, so the only bound here is the payload itself.
                let data = r.read_var_bytes()?;
                Message::FilterLoad(FilterLoadMessage {
                    data,
                    hash_funcs: r.read_u32()?,
                    tweak: r.read_u32()?,
                    flags: r.read_u8()?,
                })
            }
            commands::FILTERADD => Message::FilterAdd {
                data: r.read_var_bytes()?,
            },
            commands::FILTERCLEAR => Message::FilterClear,
            commands::FILTERSIZEXTHIN => Message::FilterSizeXthin(r.read_u32()?),
            commands::REJECT => {
                let message = r.read_var_string(COMMAND_SIZE)?;
                let code = r.read_u8()?;
                let reason = r.read_var_string(MAX_REJECT_MESSAGE_LENGTH)?;
                let hash = if r.remaining() >= 32 {
                    Some(r.read_hash()?)
                } else {
                    None
                };
                Message::Reject(RejectMessage {
                    message,
                    code,
                    reason,
                    hash,
                })
            }
            commands::XVERSION => Message::XVersion {
                listen_port: r.read_u16()?,
            },
            commands::XVERACK => Message::XVerack,
            other => Message::Unknown {
                command: other.to_string(),
            },
        };
        Ok(msg)
    }
}

/// Framed message header: magic, zero-padded command, length, checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::UnexpectedEnd);
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&buf[4..16]);
        let length = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&buf[20..24]);
        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..16].copy_from_slice(&self.command);
        out[16..20].copy_from_slice(&self.length.to_le_bytes());
        out[20..24].copy_from_slice(&self.checksum);
        out
    }

    /// Command with the zero padding stripped. Lossy: garbage bytes become
    /// replacement characters and are sanitized before logging.
    pub fn command_str(&self) -> String {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        String::from_utf8_lossy(&self.command[..end]).into_owned()
    }

    /// Structural validity: sane length and zero padding after the command.
    pub fn is_valid(&self) -> bool {
        if self.length as usize > MAX_PROTOCOL_MESSAGE_LENGTH {
            return false;
        }
        let mut seen_zero = false;
        for &b in &self.command {
            if seen_zero {
                if b != 0 {
                    return false;
                }
            } else if b == 0 {
                seen_zero = true;
            } else if !(b.is_ascii_lowercase() || b.is_ascii_digit()) {
                return false;
            }
        }
        true
    }
}

/// A framed message as handed in by the transport layer.
#[derive(Debug, Clone)]
pub struct NetMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
    /// Receive timestamp, microseconds.
    pub received_at: u64,
}

impl NetMessage {
    pub fn checksum_ok(&self) -> bool {
        payload_checksum(&self.payload) == self.header.checksum
    }

    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// First four bytes of the double-SHA256 of the payload.
pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash.0[0], hash.0[1], hash.0[2], hash.0[3]]
}

/// Frame a message for the wire.
pub fn build_envelope(magic: [u8; 4], msg: &Message) -> Bytes {
    let payload = msg.encode_payload();
    let mut command = [0u8; COMMAND_SIZE];
    let name = msg.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    let header = MessageHeader {
        magic,
        command,
        length: payload.len() as u32,
        checksum: payload_checksum(&payload),
    };
    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    out.put_slice(&header.encode());
    out.put_slice(&payload);
    out.freeze()
}

/// Frame a message as a [`NetMessage`], as the transport would deliver it.
/// Used by the dispatcher tests and loopback paths.
pub fn frame_message(magic: [u8; 4], msg: &Message, received_at: u64) -> NetMessage {
    let payload = msg.encode_payload();
    let mut command = [0u8; COMMAND_SIZE];
    let name = msg.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    NetMessage {
        header: MessageHeader {
            magic,
            command,
            length: payload.len() as u32,
            checksum: payload_checksum(&payload),
        },
        payload,
        received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let payload = msg.encode_payload();
        let decoded = Message::decode(msg.command(), &payload).expect("decode");
        assert_eq!(msg, decoded);
    }

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_out: OutPoint {
                    txid: Hash256::from_byte(9),
                    index: 1,
                },
                script_sig: vec![0x51],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut {
                value: 50_000,
                script_pubkey: vec![0x76, 0xa9, 0x14],
            }],
            lock_time: 0,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: Hash256::from_byte(1),
            merkle_root: Hash256::from_byte(2),
            time: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
        }
    }

    #[test]
    fn test_version_roundtrip() {
        roundtrip(Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK | NODE_BLOOM,
            timestamp: 1_700_000_000,
            addr_recv: NetAddress::from_socket_addr("8.8.8.8:8343".parse().unwrap(), 1, 0),
            addr_from: NetAddress::from_socket_addr("9.9.9.9:8343".parse().unwrap(), 1, 0),
            nonce: 0xABCD_EF01_2345_6789,
            user_agent: "/Ember:0.4.0/".into(),
            start_height: 812_000,
            relay: true,
        }));
    }

    #[test]
    fn test_truncated_version_still_decodes() {
        // Only the required prefix: version, services, timestamp, addr_recv.
        let mut w = Writer::new();
        w.put_i32(70001);
        w.put_u64(1);
        w.put_i64(1_700_000_000);
        NetAddress::from_socket_addr("8.8.8.8:8343".parse().unwrap(), 1, 0).encode(&mut w, false);
        let msg = Message::decode(commands::VERSION, &w.freeze()).unwrap();
        match msg {
            Message::Version(v) => {
                assert_eq!(v.version, 70001);
                assert_eq!(v.nonce, 0);
                assert!(v.relay);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inv_headers_addr_roundtrip() {
        roundtrip(Message::Inv(vec![
            RawInv {
                kind: 2,
                hash: Hash256::from_byte(7),
            },
            RawInv {
                kind: 1,
                hash: Hash256::from_byte(8),
            },
        ]));
        roundtrip(Message::Headers(vec![sample_header()]));
        roundtrip(Message::Addr(vec![NetAddress::from_socket_addr(
            "1.2.3.4:8343".parse().unwrap(),
            NODE_NETWORK,
            1_700_000_000,
        )]));
    }

    #[test]
    fn test_block_tx_roundtrip() {
        roundtrip(Message::Tx(sample_tx()));
        roundtrip(Message::Block(Block {
            header: sample_header(),
            txs: vec![sample_tx()],
        }));
    }

    #[test]
    fn test_control_messages_roundtrip() {
        roundtrip(Message::Ping(Some(7)));
        roundtrip(Message::Pong(Some(7)));
        roundtrip(Message::Ping(None));
        roundtrip(Message::SendHeaders);
        roundtrip(Message::SendCmpct {
            high_bandwidth: false,
            version: 1,
        });
        roundtrip(Message::FilterSizeXthin(100_000));
        roundtrip(Message::XVersion { listen_port: 8343 });
        roundtrip(Message::GetHeaders {
            locator: BlockLocator {
                have: vec![Hash256::from_byte(3)],
            },
            hash_stop: Hash256::ZERO,
        });
        roundtrip(Message::Reject(RejectMessage {
            message: "block".into(),
            code: REJECT_INVALID,
            reason: "bad-header".into(),
            hash: Some(Hash256::from_byte(4)),
        }));
    }

    #[test]
    fn test_unknown_command_is_tolerated() {
        let msg = Message::decode("frobnicate", &[1, 2, 3]).unwrap();
        assert!(matches!(msg, Message::Unknown { command } if command == "frobnicate"));
    }

    #[test]
    fn test_short_payload_is_an_error_not_a_panic() {
        assert_eq!(
            Message::decode(commands::SENDCMPCT, &[1]),
            Err(CodecError::UnexpectedEnd)
        );
        assert!(Message::decode(commands::HEADERS, &[0xfd]).is_err());
    }

    #[test]
    fn test_inv_count_cannot_exceed_payload() {
        // Claims 50k entries but carries none.
        let mut w = Writer::new();
        w.put_compact_size(50_000);
        let err = Message::decode(commands::INV, &w.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::OversizedLength { .. }));
    }

    #[test]
    fn test_non_canonical_compact_size_rejected() {
        // 0xfd prefix encoding a value that fits a single byte.
        let payload = [0xfd, 0x01, 0x00];
        let mut r = Reader::new(&payload);
        assert_eq!(r.read_compact_size(), Err(CodecError::NonCanonical));
    }

    #[test]
    fn test_envelope_checksum() {
        let msg = Message::Ping(Some(99));
        let magic = crate::config::Network::Main.magic();
        let framed = frame_message(magic, &msg, 0);
        assert!(framed.checksum_ok());
        assert_eq!(framed.header.command_str(), "ping");
        assert!(framed.header.is_valid());

        let wire = build_envelope(magic, &msg);
        assert_eq!(wire.len(), HEADER_SIZE + framed.payload.len());
        assert_eq!(msg.wire_size(), wire.len());
    }

    #[test]
    fn test_header_hash_is_stable() {
        let h = sample_header();
        assert_eq!(h.hash(), h.hash());
        let mut other = h;
        other.nonce += 1;
        assert_ne!(h.hash(), other.hash());
    }

    #[test]
    fn test_routability() {
        let local = NetAddress::from_socket_addr("192.168.1.4:8343".parse().unwrap(), 1, 0);
        assert!(!local.is_routable());
        let public = NetAddress::from_socket_addr("45.33.20.159:8343".parse().unwrap(), 1, 0);
        assert!(public.is_routable());
        let no_port = NetAddress {
            port: 0,
            ..public
        };
        assert!(!no_port.is_routable());

        let v6 = NetAddress::from_socket_addr("[2606:4700::1111]:8343".parse().unwrap(), 1, 0);
        assert!(public.is_ipv4());
        assert!(!v6.is_ipv4());
    }
}
