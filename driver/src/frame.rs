//! ASCII command framing, reply prefixes, the addsum checksum, and the CBW
//! block the device uses to request image fragments during SPL.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::UsbTransport;

/// The four 4-byte ASCII reply prefixes the device ever sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// Success.
    Okay,
    /// Success, with a payload still to come (e.g. after `download:`).
    Data,
    /// Busy — retry. Only expected during partition verification.
    Info,
    /// Protocol error.
    Fail,
}

impl Prefix {
    pub const fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Prefix::Okay => b"OKAY",
            Prefix::Data => b"DATA",
            Prefix::Info => b"INFO",
            Prefix::Fail => b"FAIL",
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"OKAY" => Some(Prefix::Okay),
            b"DATA" => Some(Prefix::Data),
            b"INFO" => Some(Prefix::Info),
            b"FAIL" => Some(Prefix::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(std::str::from_utf8(self.as_bytes()).unwrap())
    }
}

/// Write `cmd` on bulk-OUT, read up to `read_len` bytes from bulk-IN, and
/// fail unless the reply is at least 4 bytes and starts with `expected`.
/// Returns the raw reply so callers can parse a trailing payload.
pub fn send_cmd(
    transport: &mut dyn UsbTransport,
    cmd: &[u8],
    expected: Prefix,
    timeout: Duration,
    read_len: usize,
) -> Result<Vec<u8>> {
    transport.bulk_write(cmd, timeout)?;
    let reply = transport.bulk_read(read_len, timeout)?;
    if reply.len() < 4 {
        return Err(Error::protocol(format!(
            "reply too short ({} bytes) to command {:?}",
            reply.len(),
            String::from_utf8_lossy(cmd)
        )));
    }
    let prefix = Prefix::parse(&reply[0..4])
        .ok_or_else(|| Error::protocol(format!("unrecognized reply prefix {:?}", String::from_utf8_lossy(&reply[0..4]))))?;
    if prefix != expected {
        return Err(Error::protocol(format!(
            "expected {} but got {} for command {:?}",
            expected,
            prefix,
            String::from_utf8_lossy(cmd)
        )));
    }
    Ok(reply)
}

/// 32-bit sum-of-little-endian-u32 checksum over a buffer, zero-padding a
/// trailing fragment shorter than 4 bytes. Used both for ADNL's in-flight
/// verification and the legacy protocol's AMLC/AMLS transfers — they're the
/// same algorithm.
pub fn addsum(buf: &[u8]) -> u32 {
    let mut sum: u64 = 0;
    let mut offset = 0;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let word: u32 = if remaining >= 4 {
            u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
        } else if remaining == 3 {
            let mut tmp = [0u8; 4];
            tmp[..3].copy_from_slice(&buf[offset..offset + 3]);
            u32::from_le_bytes(tmp) & 0x00ff_ffff
        } else if remaining == 2 {
            u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as u32
        } else {
            buf[offset] as u32
        };
        sum = (sum + word as u64) % (u32::MAX as u64 + 1);
        offset += 4;
    }
    sum as u32
}

/// 32-byte request block the device sends during SPL to pull the next
/// fragment of the TPL image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cbw {
    pub seq: u32,
    pub size: u32,
    pub offset: u32,
    pub need_checksum: bool,
    pub end: bool,
}

impl Cbw {
    /// Parse a CBW out of a reply buffer, relative to byte 0 (i.e. the
    /// caller passes the whole `getvar:cbw` reply, prefix included).
    pub fn parse(msg: &[u8]) -> Result<Self> {
        if msg.len() < 22 {
            return Err(Error::protocol(format!("CBW reply too short ({} bytes)", msg.len())));
        }
        if &msg[4..8] != b"AMLC" {
            return Err(Error::protocol("CBW missing AMLC magic"));
        }
        let seq = u32::from_le_bytes(msg[8..12].try_into().unwrap());
        let size = u32::from_le_bytes(msg[12..16].try_into().unwrap());
        let offset = u32::from_le_bytes(msg[16..20].try_into().unwrap());
        let need_checksum = msg[20] == 0;
        let end = msg[21] != 0;
        Ok(Self { seq, size, offset, need_checksum, end })
    }

    /// Encode a CBW the way the device would. Used by tests to exercise
    /// `parse` round-trip and to build mock replies.
    #[cfg(any(test, feature = "test-util"))]
    pub fn to_bytes(self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..4].copy_from_slice(Prefix::Data.as_bytes());
        buf[4..8].copy_from_slice(b"AMLC");
        buf[8..12].copy_from_slice(&self.seq.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.offset.to_le_bytes());
        buf[20] = if self.need_checksum { 0 } else { 1 };
        buf[21] = if self.end { 1 } else { 0 };
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addsum_is_zero_extension_invariant() {
        let buf = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut padded = buf.clone();
        padded.push(0);
        assert_eq!(addsum(&buf), addsum(&padded));
    }

    #[test]
    fn addsum_is_additive_over_aligned_prefix() {
        let b1 = vec![1u8, 0, 0, 0, 2, 0, 0, 0];
        let b2 = vec![3u8, 0, 0, 0];
        let mut combined = b1.clone();
        combined.extend_from_slice(&b2);
        let expected = (addsum(&b1) as u64 + addsum(&b2) as u64) % (u32::MAX as u64 + 1);
        assert_eq!(addsum(&combined) as u64, expected);
    }

    #[test]
    fn addsum_masks_three_byte_tail() {
        let buf = [0xffu8, 0xff, 0xff];
        assert_eq!(addsum(&buf), 0x00ff_ffff);
    }

    #[test]
    fn addsum_masks_two_byte_tail() {
        let buf = [0x34u8, 0x12];
        assert_eq!(addsum(&buf), 0x1234);
    }

    #[test]
    fn addsum_masks_one_byte_tail() {
        let buf = [0x7fu8];
        assert_eq!(addsum(&buf), 0x7f);
    }

    #[test]
    fn cbw_round_trips() {
        let cbw = Cbw {
            seq: 3,
            size: 0x4000,
            offset: 0x1000,
            need_checksum: true,
            end: false,
        };
        let bytes = cbw.to_bytes();
        assert_eq!(Cbw::parse(&bytes).unwrap(), cbw);
    }

    #[test]
    fn cbw_rejects_bad_magic() {
        let mut bytes = Cbw {
            seq: 0,
            size: 0,
            offset: 0,
            need_checksum: false,
            end: true,
        }
        .to_bytes();
        bytes[4..8].copy_from_slice(b"XXXX");
        assert!(Cbw::parse(&bytes).is_err());
    }

    struct ScriptedTransport {
        replies: Vec<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl UsbTransport for ScriptedTransport {
        fn control_out(&mut self, _: u8, _: u16, _: u16, _: &[u8]) -> Result<usize> {
            unimplemented!()
        }
        fn control_in(&mut self, _: u8, _: u16, _: u16, _: usize) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn bulk_write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            self.sent.push(data.to_vec());
            Ok(data.len())
        }
        fn bulk_read(&mut self, _len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            Ok(self.replies.remove(0))
        }
        fn location(&self) -> crate::transport::DeviceLocation {
            unimplemented!()
        }
        fn reacquire(&mut self, _id: crate::config::UsbId, _last_address: u8) -> Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn send_cmd_dispatches_on_prefix() {
        for prefix in [Prefix::Okay, Prefix::Data, Prefix::Info, Prefix::Fail] {
            let mut transport = ScriptedTransport {
                replies: vec![prefix.as_bytes().to_vec()],
                sent: vec![],
            };
            let result = send_cmd(&mut transport, b"getvar:identify", prefix, Duration::from_millis(100), 512);
            assert!(result.is_ok());
        }
    }

    #[test]
    fn send_cmd_rejects_mismatched_prefix() {
        let mut transport = ScriptedTransport {
            replies: vec![Prefix::Fail.as_bytes().to_vec()],
            sent: vec![],
        };
        let err = send_cmd(&mut transport, b"getvar:identify", Prefix::Okay, Duration::from_millis(100), 512).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("OKAY"), "{msg}");
        assert!(msg.contains("FAIL"), "{msg}");
    }

    #[test]
    fn send_cmd_rejects_short_reply() {
        let mut transport = ScriptedTransport {
            replies: vec![vec![b'O', b'K']],
            sent: vec![],
        };
        assert!(send_cmd(&mut transport, b"x", Prefix::Okay, Duration::from_millis(100), 512).is_err());
    }
}
