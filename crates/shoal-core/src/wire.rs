//! shoal wire format — on-wire types for the stream-sync protocol.
//!
//! These types ARE the protocol. Message codes, field order, and the
//! optionality encoding are all part of the wire format; changing anything
//! here is a breaking change.
//!
//! Every protocol message is a length-delimited record framed by the
//! transport: one message code byte (out of band, next to the frame) and a
//! payload with fixed field order. Integers are big-endian. Strings carry a
//! u16 length prefix, byte fields a u32 length prefix, and optional fields
//! one presence byte. Bitvector payloads are raw little-endian bit-packed
//! bytes as produced by [`crate::bitvector::BitVector::bytes`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::stream::{Range, Stream};

/// Size of a chunk address. Addresses are the BLAKE3 hash of chunk content.
pub const HASH_SIZE: usize = 32;

/// A content address.
pub type Address = [u8; HASH_SIZE];

// ── Message codes ─────────────────────────────────────────────────────────────

/// Wire codes, contiguous from 0. Stable ordering.
pub mod code {
    pub const SUBSCRIBE: u8 = 0;
    pub const SUBSCRIBE_ERROR: u8 = 1;
    pub const UNSUBSCRIBE: u8 = 2;
    pub const QUIT: u8 = 3;
    pub const REQUEST_SUBSCRIPTION: u8 = 4;
    pub const OFFERED_HASHES: u8 = 5;
    pub const WANTED_HASHES: u8 = 6;
    pub const CHUNK_DELIVERY: u8 = 7;
    pub const TAKEOVER_PROOF: u8 = 8;
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Request a stream (section) from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeMsg {
    pub stream: Stream,
    /// Historical range to backfill. `None` for a purely live subscription.
    pub history: Option<Range>,
    /// Outbox band the server should deliver on.
    pub priority: u8,
}

/// Reported back when the remote could not construct the requested server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeErrorMsg {
    pub error: String,
}

/// Remove the matching server on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeMsg {
    pub stream: Stream,
}

/// Remove the matching client on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuitMsg {
    pub stream: Stream,
}

/// Ask the peer to subscribe to us: the recipient calls its own `Subscribe`
/// back toward the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSubscriptionMsg {
    pub stream: Stream,
    pub history: Option<Range>,
    pub priority: u8,
}

/// Offer to hand over a stream section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedHashesMsg {
    pub stream: Stream,
    pub from: u64,
    pub to: u64,
    /// Packed array of 32-byte addresses. `len % HASH_SIZE == 0`.
    pub hashes: Bytes,
    pub handover: Option<HandoverProof>,
}

impl OfferedHashesMsg {
    /// Number of offered hashes.
    pub fn count(&self) -> usize {
        self.hashes.len() / HASH_SIZE
    }
}

impl std::fmt::Display for OfferedHashesMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stream '{}' [{}-{}) ({})",
            self.stream,
            self.from,
            self.to,
            self.count()
        )
    }
}

/// Signal which offered hashes the downstream peer wants, and propose the
/// next request window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedHashesMsg {
    pub stream: Stream,
    /// One bit per offered hash; LSB of byte 0 is index 0.
    pub want: Bytes,
    pub from: u64,
    pub to: u64,
}

impl std::fmt::Display for WantedHashesMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stream '{}', want {:02x?}, next [{}-{})",
            self.stream, &self.want[..], self.from, self.to
        )
    }
}

/// A chunk payload for an address the peer asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDeliveryMsg {
    pub addr: Address,
    pub data: Bytes,
}

/// Statement that the upstream peer hands over a stream section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handover {
    pub stream: Stream,
    /// Index range `[start, end)` of the handed-over hashes.
    pub start: u64,
    pub end: u64,
    /// Aggregate over the hashes of the section.
    pub root: Address,
}

/// Signed handover. An empty `sig` is permitted; verification is pluggable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverProof {
    pub sig: Bytes,
    pub handover: Handover,
}

/// Statement that the downstream peer took over (stored all data of) a
/// handed-over section. Same shape as [`Handover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Takeover {
    pub stream: Stream,
    pub start: u64,
    pub end: u64,
    pub root: Address,
}

/// Signed takeover, sent by the downstream peer after a batch is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverProof {
    pub sig: Bytes,
    pub takeover: Takeover,
}

/// `TakeoverProofMsg` is the protocol message carrying a [`TakeoverProof`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverProofMsg {
    pub proof: TakeoverProof,
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Subscribe(SubscribeMsg),
    SubscribeError(SubscribeErrorMsg),
    Unsubscribe(UnsubscribeMsg),
    Quit(QuitMsg),
    RequestSubscription(RequestSubscriptionMsg),
    OfferedHashes(OfferedHashesMsg),
    WantedHashes(WantedHashesMsg),
    ChunkDelivery(ChunkDeliveryMsg),
    TakeoverProof(TakeoverProofMsg),
}

impl Message {
    /// The wire code for this message.
    pub fn code(&self) -> u8 {
        match self {
            Message::Subscribe(_) => code::SUBSCRIBE,
            Message::SubscribeError(_) => code::SUBSCRIBE_ERROR,
            Message::Unsubscribe(_) => code::UNSUBSCRIBE,
            Message::Quit(_) => code::QUIT,
            Message::RequestSubscription(_) => code::REQUEST_SUBSCRIPTION,
            Message::OfferedHashes(_) => code::OFFERED_HASHES,
            Message::WantedHashes(_) => code::WANTED_HASHES,
            Message::ChunkDelivery(_) => code::CHUNK_DELIVERY,
            Message::TakeoverProof(_) => code::TAKEOVER_PROOF,
        }
    }

    /// Encode the message payload (code travels next to the frame).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Subscribe(m) => {
                put_stream(&mut buf, &m.stream);
                put_opt_range(&mut buf, m.history);
                buf.put_u8(m.priority);
            }
            Message::SubscribeError(m) => {
                put_string(&mut buf, &m.error);
            }
            Message::Unsubscribe(m) => {
                put_stream(&mut buf, &m.stream);
            }
            Message::Quit(m) => {
                put_stream(&mut buf, &m.stream);
            }
            Message::RequestSubscription(m) => {
                put_stream(&mut buf, &m.stream);
                put_opt_range(&mut buf, m.history);
                buf.put_u8(m.priority);
            }
            Message::OfferedHashes(m) => {
                put_stream(&mut buf, &m.stream);
                buf.put_u64(m.from);
                buf.put_u64(m.to);
                put_bytes(&mut buf, &m.hashes);
                match &m.handover {
                    Some(proof) => {
                        buf.put_u8(1);
                        put_handover_proof(&mut buf, proof);
                    }
                    None => buf.put_u8(0),
                }
            }
            Message::WantedHashes(m) => {
                put_stream(&mut buf, &m.stream);
                put_bytes(&mut buf, &m.want);
                buf.put_u64(m.from);
                buf.put_u64(m.to);
            }
            Message::ChunkDelivery(m) => {
                buf.put_slice(&m.addr);
                put_bytes(&mut buf, &m.data);
            }
            Message::TakeoverProof(m) => {
                put_bytes(&mut buf, &m.proof.sig);
                put_stream(&mut buf, &m.proof.takeover.stream);
                buf.put_u64(m.proof.takeover.start);
                buf.put_u64(m.proof.takeover.end);
                buf.put_slice(&m.proof.takeover.root);
            }
        }
        buf.freeze()
    }

    /// Decode a message payload for the given wire code.
    pub fn decode(code: u8, payload: &[u8]) -> Result<Message, WireError> {
        let mut buf = payload;
        let msg = match code {
            code::SUBSCRIBE => Message::Subscribe(SubscribeMsg {
                stream: get_stream(&mut buf)?,
                history: get_opt_range(&mut buf)?,
                priority: get_u8(&mut buf)?,
            }),
            code::SUBSCRIBE_ERROR => Message::SubscribeError(SubscribeErrorMsg {
                error: get_string(&mut buf)?,
            }),
            code::UNSUBSCRIBE => Message::Unsubscribe(UnsubscribeMsg {
                stream: get_stream(&mut buf)?,
            }),
            code::QUIT => Message::Quit(QuitMsg {
                stream: get_stream(&mut buf)?,
            }),
            code::REQUEST_SUBSCRIPTION => Message::RequestSubscription(RequestSubscriptionMsg {
                stream: get_stream(&mut buf)?,
                history: get_opt_range(&mut buf)?,
                priority: get_u8(&mut buf)?,
            }),
            code::OFFERED_HASHES => {
                let stream = get_stream(&mut buf)?;
                let from = get_u64(&mut buf)?;
                let to = get_u64(&mut buf)?;
                let hashes = get_bytes(&mut buf)?;
                if hashes.len() % HASH_SIZE != 0 {
                    return Err(WireError::UnalignedHashes(hashes.len()));
                }
                let handover = match get_u8(&mut buf)? {
                    0 => None,
                    1 => Some(get_handover_proof(&mut buf)?),
                    other => return Err(WireError::BadPresenceByte(other)),
                };
                Message::OfferedHashes(OfferedHashesMsg {
                    stream,
                    from,
                    to,
                    hashes,
                    handover,
                })
            }
            code::WANTED_HASHES => Message::WantedHashes(WantedHashesMsg {
                stream: get_stream(&mut buf)?,
                want: get_bytes(&mut buf)?,
                from: get_u64(&mut buf)?,
                to: get_u64(&mut buf)?,
            }),
            code::CHUNK_DELIVERY => Message::ChunkDelivery(ChunkDeliveryMsg {
                addr: get_addr(&mut buf)?,
                data: get_bytes(&mut buf)?,
            }),
            code::TAKEOVER_PROOF => {
                let sig = get_bytes(&mut buf)?;
                let stream = get_stream(&mut buf)?;
                let start = get_u64(&mut buf)?;
                let end = get_u64(&mut buf)?;
                let root = get_addr(&mut buf)?;
                Message::TakeoverProof(TakeoverProofMsg {
                    proof: TakeoverProof {
                        sig,
                        takeover: Takeover {
                            stream,
                            start,
                            end,
                            root,
                        },
                    },
                })
            }
            other => return Err(WireError::UnknownCode(other)),
        };
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes(buf.len()));
        }
        Ok(msg)
    }
}

// ── Field codecs ──────────────────────────────────────────────────────────────

fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn get_bytes(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let b = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(b)
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_addr(buf: &mut &[u8]) -> Result<Address, WireError> {
    if buf.remaining() < HASH_SIZE {
        return Err(WireError::Truncated);
    }
    let mut addr = [0u8; HASH_SIZE];
    addr.copy_from_slice(&buf[..HASH_SIZE]);
    buf.advance(HASH_SIZE);
    Ok(addr)
}

fn put_stream(buf: &mut BytesMut, s: &Stream) {
    put_string(buf, &s.name);
    put_string(buf, &s.key);
    buf.put_u8(s.live as u8);
}

fn get_stream(buf: &mut &[u8]) -> Result<Stream, WireError> {
    let name = get_string(buf)?;
    let key = get_string(buf)?;
    let live = match get_u8(buf)? {
        0 => false,
        1 => true,
        other => return Err(WireError::BadPresenceByte(other)),
    };
    Ok(Stream { name, key, live })
}

fn put_opt_range(buf: &mut BytesMut, r: Option<Range>) {
    match r {
        Some(r) => {
            buf.put_u8(1);
            buf.put_u64(r.from);
            buf.put_u64(r.to);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_range(buf: &mut &[u8]) -> Result<Option<Range>, WireError> {
    match get_u8(buf)? {
        0 => Ok(None),
        1 => {
            let from = get_u64(buf)?;
            let to = get_u64(buf)?;
            Ok(Some(Range { from, to }))
        }
        other => Err(WireError::BadPresenceByte(other)),
    }
}

fn put_handover_proof(buf: &mut BytesMut, p: &HandoverProof) {
    put_bytes(buf, &p.sig);
    put_stream(buf, &p.handover.stream);
    buf.put_u64(p.handover.start);
    buf.put_u64(p.handover.end);
    buf.put_slice(&p.handover.root);
}

fn get_handover_proof(buf: &mut &[u8]) -> Result<HandoverProof, WireError> {
    let sig = get_bytes(buf)?;
    let stream = get_stream(buf)?;
    let start = get_u64(buf)?;
    let end = get_u64(buf)?;
    let root = get_addr(buf)?;
    Ok(HandoverProof {
        sig,
        handover: Handover {
            stream,
            start,
            end,
            root,
        },
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown message code: {0}")]
    UnknownCode(u8),

    #[error("truncated message body")]
    Truncated,

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    #[error("hash payload of {0} bytes is not a multiple of {HASH_SIZE}")]
    UnalignedHashes(usize),

    #[error("bad presence byte: {0:#04x}")]
    BadPresenceByte(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
