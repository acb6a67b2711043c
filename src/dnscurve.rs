//! DNSCurve codec: recognises encrypted queries, opens them, and seals the
//! upstream reply back into the envelope the client used.

use std::sync::{Mutex, PoisonError};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::base32;
use crate::cache::{CacheError, CacheStats, SecretCache};
use crate::crypto::{self, HALF_NONCE_LEN, SecretKey, SharedSecret, TAG_LEN};
use crate::error::RelayError;
use crate::proto_utils::{self, HEADER_LEN, QCLASS_IN, QTYPE_TXT};

pub const QUERY_MAGIC: &[u8; 8] = b"Q6fnvWj8";
pub const REPLY_MAGIC: &[u8; 8] = b"R6fnvWJ8";

/// Smallest packet that can be DNSCurve in either format.
const MIN_CURVE_LEN: usize = 68;
/// magic(8) + public key(32) + client nonce(12)
const STREAMLINED_HEADER_LEN: usize = 52;
/// magic(8) + full nonce(24) + tag(16)
const STREAMLINED_REPLY_OVERHEAD: usize = 48;

/// Label carrying `x1a` followed by the 51-symbol public key.
const KEY_LABEL_LEN: u8 = 54;
const MAX_BOX_LABEL_LEN: u8 = 50;
const MAX_ENCODED_BOX: usize = 4096;

/// Question type/class, answer pointer to offset 12, TXT, IN, TTL 0.
const TXT_ANSWER_PREAMBLE: [u8; 14] = [
    0x00, 0x10, 0x00, 0x01, 0xc0, 0x0c, 0x00, 0x10, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
];

/// 查询报文格式 / Envelope a query arrived in; the reply goes back in the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    Plain,
    Streamlined,
    TxtRecursionSet,
    TxtRecursionUnset,
}

impl PacketFormat {
    #[inline]
    pub fn is_txt(self) -> bool {
        matches!(self, Self::TxtRecursionSet | Self::TxtRecursionUnset)
    }
}

/// Client key as received, or the shared secret once it has been resolved.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Public([u8; 32]),
    Shared(SharedSecret),
}

/// Where a shared secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Packet,
    Cached,
    Derived,
}

/// 单个事务的解析状态 / Per-transaction view of the query being relayed.
#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub format: PacketFormat,
    /// Id the client expects to see in the reply (outer id for TXT).
    pub client_txid: u16,
    /// Id of the embedded query for TXT format.
    pub inner_txid: u16,
    /// Id of the last query sent upstream.
    pub upstream_txid: Option<u16>,
    key: Option<KeyMaterial>,
    nonce: [u8; HALF_NONCE_LEN],
    /// Original question name bytes, echoed back in TXT replies.
    qname: Vec<u8>,
}

impl DnsPacket {
    fn plain(txid: u16) -> Self {
        Self {
            format: PacketFormat::Plain,
            client_txid: txid,
            inner_txid: 0,
            upstream_txid: None,
            key: None,
            nonce: [0u8; HALF_NONCE_LEN],
            qname: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn client_nonce(&self) -> &[u8; HALF_NONCE_LEN] {
        &self.nonce
    }

    /// Id shown in logs for the query side of the transaction.
    pub fn external_txid(&self) -> u16 {
        if self.format.is_txt() {
            self.inner_txid
        } else {
            self.client_txid
        }
    }

    /// Stamps a fresh random id on the outgoing query, never repeating the
    /// previous upstream id.
    pub fn assign_upstream_txid(&mut self, buffer: &mut [u8]) -> u16 {
        let mut rng = rand::thread_rng();
        let txid = loop {
            let candidate: u16 = rng.r#gen();
            if Some(candidate) != self.upstream_txid {
                break candidate;
            }
        };
        proto_utils::write_txid(buffer, txid);
        self.upstream_txid = Some(txid);
        txid
    }
}

/// Pieces of a TXT-format query name.
#[derive(Debug, PartialEq, Eq)]
struct TxtQueryName {
    /// nonce(12) || tag || ciphertext
    boxed: Vec<u8>,
    public_key: [u8; 32],
    /// Offset of the zone labels within the name.
    zone: usize,
}

/// `<box labels>.x1a<key>.<zone>` in wire form.
fn parse_query_name(name: &[u8]) -> Option<TxtQueryName> {
    let mut encoded = Vec::with_capacity(256);
    let mut i = 0;
    loop {
        let len = *name.get(i)?;
        if len == KEY_LABEL_LEN {
            break;
        }
        if len == 0 || len > MAX_BOX_LABEL_LEN {
            return None;
        }
        let label = name.get(i + 1..i + 1 + len as usize)?;
        if encoded.len() + label.len() > MAX_ENCODED_BOX {
            return None;
        }
        encoded.extend_from_slice(label);
        i += len as usize + 1;
    }

    let boxed = base32::decode(&encoded)?;

    let key_label = name.get(i + 1..i + 1 + KEY_LABEL_LEN as usize)?;
    if !key_label[..3].eq_ignore_ascii_case(b"x1a") {
        return None;
    }
    let public_key = base32::decode_key(&key_label[3..])?;

    Some(TxtQueryName {
        boxed,
        public_key,
        zone: i + 1 + KEY_LABEL_LEN as usize,
    })
}

pub struct DnsCurve {
    secret: SecretKey,
    cache: Mutex<SecretCache>,
}

impl DnsCurve {
    pub fn new(secret: SecretKey, buckets: usize, capacity: usize) -> Result<Self, CacheError> {
        let cache = SecretCache::new(buckets, capacity)?;
        info!(
            target = "dnscurve",
            capacity, buckets, "able to store shared secrets"
        );
        Ok(Self {
            secret,
            cache: Mutex::new(cache),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.secret.public_key()
    }

    /// Resolves `key` to a shared secret in place. A cache miss derives the
    /// secret and inserts it while still holding the lock.
    pub fn shared_secret(&self, key: &mut KeyMaterial) -> (SharedSecret, SecretSource) {
        let public = match key {
            KeyMaterial::Shared(shared) => return (shared.clone(), SecretSource::Packet),
            KeyMaterial::Public(public) => *public,
        };

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let (shared, source) = match cache.get(&public) {
            Some(value) => (SharedSecret::from_bytes(*value), SecretSource::Cached),
            None => {
                let shared = crypto::derive_shared_secret(&public, &self.secret);
                cache.set(&public, shared.as_bytes());
                (shared, SecretSource::Derived)
            }
        };
        drop(cache);

        debug!(target = "dnscurve", ?source, "shared secret resolved");
        *key = KeyMaterial::Shared(shared.clone());
        (shared, source)
    }

    /// Classifies a client query and, when it is DNSCurve, replaces `buffer`
    /// with the embedded plain query.
    ///
    /// Only shape violations that make the packet unusable as a query are
    /// errors; anything that merely fails to be DNSCurve is relayed as plain.
    pub fn analyze_query(&self, buffer: &mut Vec<u8>) -> Result<DnsPacket, RelayError> {
        let txid = proto_utils::read_txid(buffer)
            .filter(|_| buffer.len() >= HEADER_LEN)
            .ok_or(RelayError::Malformed("query shorter than a DNS header"))?;
        let plain = DnsPacket::plain(txid);

        if buffer.len() < MIN_CURVE_LEN {
            debug!(target = "dnscurve", len = buffer.len(), "too small for DNSCurve, plain DNS");
            return Ok(plain);
        }

        if buffer.starts_with(QUERY_MAGIC) {
            return self.analyze_streamlined(buffer, plain);
        }

        if !proto_utils::is_plain_query(buffer) {
            return Err(RelayError::Malformed("not a query"));
        }
        if !proto_utils::is_single_question(buffer) {
            return Ok(plain);
        }

        let Some((name, pos)) = proto_utils::get_name(buffer, HEADER_LEN) else {
            return Ok(plain);
        };
        if proto_utils::question_tail(buffer, pos) != Some((QTYPE_TXT, QCLASS_IN)) {
            debug!(target = "dnscurve", "not a TXT query, plain DNS");
            return Ok(plain);
        }
        self.analyze_txt(buffer, &name, pos, plain)
    }

    fn analyze_streamlined(
        &self,
        buffer: &mut Vec<u8>,
        plain: DnsPacket,
    ) -> Result<DnsPacket, RelayError> {
        let mut public = [0u8; 32];
        public.copy_from_slice(&buffer[8..40]);
        let mut nonce = [0u8; HALF_NONCE_LEN];
        nonce.copy_from_slice(&buffer[40..STREAMLINED_HEADER_LEN]);

        let mut key = KeyMaterial::Public(public);
        let (shared, _) = self.shared_secret(&mut key);
        let full = crypto::full_nonce(&nonce, &[0u8; HALF_NONCE_LEN]);
        let inner = match crypto::open(&shared, &full, &buffer[STREAMLINED_HEADER_LEN..]) {
            Ok(inner) => inner,
            Err(err) => {
                warn!(target = "dnscurve", error = %err, "streamlined query did not open, relaying as plain DNS");
                return Ok(plain);
            }
        };

        let client_txid = proto_utils::read_txid(&inner)
            .filter(|_| inner.len() >= HEADER_LEN)
            .ok_or(RelayError::Malformed("streamlined inner packet too small"))?;
        *buffer = inner;

        info!(target = "dnscurve", len = buffer.len(), "streamlined DNSCurve query received");
        Ok(DnsPacket {
            format: PacketFormat::Streamlined,
            client_txid,
            key: Some(key),
            nonce,
            ..plain
        })
    }

    fn analyze_txt(
        &self,
        buffer: &mut Vec<u8>,
        name: &[u8],
        pos: usize,
        plain: DnsPacket,
    ) -> Result<DnsPacket, RelayError> {
        let Some(parsed) = parse_query_name(name) else {
            debug!(target = "dnscurve", "no client public key in query name, plain DNS");
            return Ok(plain);
        };
        if parsed.boxed.len() < HALF_NONCE_LEN + TAG_LEN {
            return Ok(plain);
        }
        debug!(
            target = "dnscurve",
            zone_offset = parsed.zone,
            boxed = parsed.boxed.len(),
            "TXT query name parsed"
        );

        let mut nonce = [0u8; HALF_NONCE_LEN];
        nonce.copy_from_slice(&parsed.boxed[..HALF_NONCE_LEN]);
        let mut key = KeyMaterial::Public(parsed.public_key);
        let (shared, _) = self.shared_secret(&mut key);
        let full = crypto::full_nonce(&nonce, &[0u8; HALF_NONCE_LEN]);
        let inner = match crypto::open(&shared, &full, &parsed.boxed[HALF_NONCE_LEN..]) {
            Ok(inner) => inner,
            Err(err) => {
                warn!(target = "dnscurve", error = %err, "TXT query did not open, relaying as plain DNS");
                return Ok(plain);
            }
        };

        let inner_txid = proto_utils::read_txid(&inner)
            .filter(|_| inner.len() >= HEADER_LEN)
            .ok_or(RelayError::Malformed("TXT inner packet too small"))?;

        // the reply header answers the outer query, so its RD bit decides the flags
        let format = if proto_utils::recursion_desired(buffer) {
            PacketFormat::TxtRecursionSet
        } else {
            PacketFormat::TxtRecursionUnset
        };
        let qname = buffer[HEADER_LEN..pos].to_vec();
        *buffer = inner;

        info!(target = "dnscurve", len = buffer.len(), ?format, "TXT DNSCurve query received");
        Ok(DnsPacket {
            format,
            inner_txid,
            key: Some(key),
            nonce,
            qname,
            ..plain
        })
    }

    /// Checks an upstream reply against the query that was sent and puts the
    /// client-visible id back.
    pub fn analyze_reply(&self, packet: &DnsPacket, buffer: &mut [u8]) -> Result<(), RelayError> {
        if buffer.len() < HEADER_LEN {
            return Err(RelayError::Malformed("reply shorter than a DNS header"));
        }
        let got = u16::from_be_bytes([buffer[0], buffer[1]]);
        let expected = packet.upstream_txid.ok_or(RelayError::Malformed("no query was forwarded"))?;
        if got != expected {
            return Err(RelayError::TxidMismatch { expected, got });
        }
        proto_utils::write_txid(buffer, packet.external_txid());
        Ok(())
    }

    /// Wraps the (already analysed) reply in `buffer` in the query's envelope.
    /// The result must fit in `max_len` bytes.
    pub fn build_reply(
        &self,
        packet: &mut DnsPacket,
        buffer: &mut Vec<u8>,
        max_len: usize,
    ) -> Result<(), RelayError> {
        match packet.format {
            PacketFormat::Plain => {
                debug!(target = "dnscurve", "reply in regular format");
                Ok(())
            }
            PacketFormat::Streamlined => self.reply_streamlined(packet, buffer, max_len),
            PacketFormat::TxtRecursionSet | PacketFormat::TxtRecursionUnset => {
                self.reply_txt(packet, buffer, max_len)
            }
        }
    }

    fn seal_reply(
        &self,
        packet: &mut DnsPacket,
        plaintext: &[u8],
    ) -> Result<([u8; HALF_NONCE_LEN], Vec<u8>), RelayError> {
        let key = packet
            .key
            .as_mut()
            .ok_or(RelayError::Malformed("DNSCurve packet without a client key"))?;
        let (shared, _) = self.shared_secret(key);
        let server = crypto::server_nonce();
        let sealed = crypto::seal(&shared, &crypto::full_nonce(&packet.nonce, &server), plaintext)?;
        Ok((server, sealed))
    }

    fn reply_streamlined(
        &self,
        packet: &mut DnsPacket,
        buffer: &mut Vec<u8>,
        max_len: usize,
    ) -> Result<(), RelayError> {
        if buffer.len() + STREAMLINED_REPLY_OVERHEAD > max_len {
            return Err(RelayError::ResourceExhausted("streamlined reply exceeds buffer"));
        }
        let (server, sealed) = self.seal_reply(packet, buffer)?;

        let mut out = Vec::with_capacity(STREAMLINED_REPLY_OVERHEAD + buffer.len());
        out.extend_from_slice(REPLY_MAGIC);
        out.extend_from_slice(&packet.nonce);
        out.extend_from_slice(&server);
        out.extend_from_slice(&sealed);
        *buffer = out;

        info!(target = "dnscurve", len = buffer.len(), "streamlined reply sealed");
        Ok(())
    }

    fn reply_txt(
        &self,
        packet: &mut DnsPacket,
        buffer: &mut Vec<u8>,
        max_len: usize,
    ) -> Result<(), RelayError> {
        let got = proto_utils::read_txid(buffer).ok_or(RelayError::Malformed("empty reply"))?;
        if got != packet.inner_txid {
            return Err(RelayError::TxidMismatch {
                expected: packet.inner_txid,
                got,
            });
        }

        let (server, sealed) = self.seal_reply(packet, buffer)?;
        let payload_len = HALF_NONCE_LEN + sealed.len();
        // one length byte per 255-byte character-string
        let rdata_len = payload_len + payload_len.div_ceil(255);
        let rdata_len_field = u16::try_from(rdata_len)
            .map_err(|_| RelayError::ResourceExhausted("TXT rdata exceeds 16 bits"))?;
        let total = HEADER_LEN + packet.qname.len() + TXT_ANSWER_PREAMBLE.len() + 2 + rdata_len;
        if total > max_len {
            return Err(RelayError::ResourceExhausted("TXT reply exceeds buffer"));
        }

        let flags = match packet.format {
            PacketFormat::TxtRecursionSet => 0x85,
            _ => 0x84,
        };
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&packet.client_txid.to_be_bytes());
        out.extend_from_slice(&[flags, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&packet.qname);
        out.extend_from_slice(&TXT_ANSWER_PREAMBLE);
        out.extend_from_slice(&rdata_len_field.to_be_bytes());

        let payload = server.iter().chain(sealed.iter()).copied().collect::<Vec<u8>>();
        for chunk in payload.chunks(255) {
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
        debug_assert_eq!(out.len(), total);
        *buffer = out;

        info!(target = "dnscurve", len = buffer.len(), "TXT reply sealed");
        Ok(())
    }

    #[cfg(test)]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).stats()
    }

    /// Logs the cache occupancy and drops every shared secret.
    pub fn flush_cache(&self) -> CacheStats {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = cache.stats();
        info!(
            target = "dnscurve",
            used = stats.used,
            capacity = stats.capacity,
            chains = ?stats.chain_lengths,
            "flushing shared secret cache"
        );
        cache.clear();
        stats
    }
}
