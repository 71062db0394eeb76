//! NTPv4 packet codec.
//!
//! The 48-byte header of RFC 5905 plus the optional symmetric-key MAC
//! (key id and SHA-256 digest over key material and header).

use crate::clock::{Ns, NS_PER_SEC};
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};

pub const HEADER_LEN: usize = 48;
pub const DIGEST_LEN: usize = 32;
pub const MAC_LEN: usize = 4 + DIGEST_LEN;

pub const VERSION: u8 = 4;

pub const MODE_SYMMETRIC_ACTIVE: u8 = 1;
pub const MODE_SYMMETRIC_PASSIVE: u8 = 2;
pub const MODE_CLIENT: u8 = 3;
pub const MODE_SERVER: u8 = 4;

pub const LEAP_NORMAL: u8 = 0;
pub const LEAP_INSERT: u8 = 1;
pub const LEAP_DELETE: u8 = 2;
pub const LEAP_UNSYNC: u8 = 3;

/// Seconds between the NTP era 0 epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// 64-bit NTP timestamp: 32-bit seconds since 1900, 32-bit fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub const ZERO: NtpTimestamp = NtpTimestamp(0);

    pub fn from_unix_ns(ns: Ns) -> Self {
        let secs = ns.div_euclid(NS_PER_SEC) + NTP_UNIX_OFFSET;
        let frac_ns = ns.rem_euclid(NS_PER_SEC) as u128;
        let frac = (frac_ns << 32) / NS_PER_SEC as u128;
        NtpTimestamp(((secs as u64) << 32) | frac as u64)
    }

    pub fn to_unix_ns(self) -> Ns {
        let secs = (self.0 >> 32) as i64 - NTP_UNIX_OFFSET;
        let frac = self.0 & 0xffff_ffff;
        let ns = ((frac as u128 * NS_PER_SEC as u128) >> 32) as i64;
        secs * NS_PER_SEC + ns
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// NTP short format (16.16 fixed point seconds).
fn encode_short(seconds: f64) -> u32 {
    (seconds.max(0.0) * 65536.0).min(u32::MAX as f64) as u32
}

fn decode_short(value: u32) -> f64 {
    value as f64 / 65536.0
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NtpPacket {
    pub leap: u8,
    pub version: u8,
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub reference_id: u32,
    pub reference_ts: NtpTimestamp,
    pub origin_ts: NtpTimestamp,
    pub receive_ts: NtpTimestamp,
    pub transmit_ts: NtpTimestamp,
    /// Key id of a trailing MAC, if one was present on the wire.
    pub mac_key_id: Option<u32>,
}

impl NtpPacket {
    pub fn parse(buf: &[u8]) -> Result<NtpPacket> {
        if buf.len() < HEADER_LEN {
            return Err(anyhow!("packet too short: {} bytes", buf.len()));
        }
        let version = (buf[0] >> 3) & 0x7;
        if !(3..=4).contains(&version) {
            return Err(anyhow!("unsupported NTP version {}", version));
        }
        let mac_key_id = if buf.len() == HEADER_LEN + MAC_LEN {
            Some(BigEndian::read_u32(&buf[HEADER_LEN..HEADER_LEN + 4]))
        } else if buf.len() != HEADER_LEN {
            return Err(anyhow!("unexpected packet length {}", buf.len()));
        } else {
            None
        };
        Ok(NtpPacket {
            leap: buf[0] >> 6,
            version,
            mode: buf[0] & 0x7,
            stratum: buf[1],
            poll: buf[2] as i8,
            precision: buf[3] as i8,
            root_delay: decode_short(BigEndian::read_u32(&buf[4..8])),
            root_dispersion: decode_short(BigEndian::read_u32(&buf[8..12])),
            reference_id: BigEndian::read_u32(&buf[12..16]),
            reference_ts: NtpTimestamp(BigEndian::read_u64(&buf[16..24])),
            origin_ts: NtpTimestamp(BigEndian::read_u64(&buf[24..32])),
            receive_ts: NtpTimestamp(BigEndian::read_u64(&buf[32..40])),
            transmit_ts: NtpTimestamp(BigEndian::read_u64(&buf[40..48])),
            mac_key_id,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = (self.leap << 6) | ((self.version & 0x7) << 3) | (self.mode & 0x7);
        buf[1] = self.stratum;
        buf[2] = self.poll as u8;
        buf[3] = self.precision as u8;
        BigEndian::write_u32(&mut buf[4..8], encode_short(self.root_delay));
        BigEndian::write_u32(&mut buf[8..12], encode_short(self.root_dispersion));
        BigEndian::write_u32(&mut buf[12..16], self.reference_id);
        BigEndian::write_u64(&mut buf[16..24], self.reference_ts.0);
        BigEndian::write_u64(&mut buf[24..32], self.origin_ts.0);
        BigEndian::write_u64(&mut buf[32..40], self.receive_ts.0);
        BigEndian::write_u64(&mut buf[40..48], self.transmit_ts.0);
        buf
    }

    /// Encode and append a symmetric-key MAC.
    pub fn encode_with_mac(&self, key_id: u32, key: &[u8]) -> Vec<u8> {
        let mut buf = self.encode();
        let digest = mac_digest(key, &buf);
        let mut id = [0u8; 4];
        BigEndian::write_u32(&mut id, key_id);
        buf.extend_from_slice(&id);
        buf.extend_from_slice(&digest);
        buf
    }
}

fn mac_digest(key: &[u8], header: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(&header[..HEADER_LEN]);
    hasher.finalize().into()
}

/// Check the MAC on a raw packet against the given key material.
pub fn verify_mac(buf: &[u8], key: &[u8]) -> bool {
    if buf.len() != HEADER_LEN + MAC_LEN {
        return false;
    }
    let expected = mac_digest(key, buf);
    buf[HEADER_LEN + 4..] == expected
}
