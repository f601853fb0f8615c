//! Boot stage identification and chip-info queries (`getvar:identify`,
//! `getvar:getchipinfo-N`).

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{send_cmd, Prefix};
use crate::transport::UsbTransport;

/// Boot stage a device can be observed in. Monotone within a session: only
/// `ROM -> SPL -> TPL` is a legal sequence of transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Rom,
    Spl,
    Tpl,
}

impl Stage {
    /// Wire code the device reports in the `identify` reply.
    pub const fn wire_code(self) -> u8 {
        match self {
            Stage::Rom => 0,
            Stage::Spl => 8,
            Stage::Tpl => 16,
        }
    }

    /// Human-readable name matching Amlogic's own terminology for the
    /// stage, as opposed to the enum variant name.
    pub const fn display_name(self) -> &'static str {
        match self {
            Stage::Rom => "BootROM",
            Stage::Spl => "BL2",
            Stage::Tpl => "U-Boot",
        }
    }

    fn from_wire_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Stage::Rom),
            8 => Ok(Stage::Spl),
            16 => Ok(Stage::Tpl),
            other => Err(Error::protocol(format!("unrecognized stage wire code {other:#x}"))),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// SoC family ID read from chip-info page 1, offset `0x04`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SocFamily {
    A1,
    C1,
    Sc2,
    C2,
    T5,
    T5d,
    T7,
    S4,
}

impl SocFamily {
    fn from_wire(code: u32) -> Result<Self> {
        match code {
            0x2c => Ok(SocFamily::A1),
            0x30 => Ok(SocFamily::C1),
            0x32 => Ok(SocFamily::Sc2),
            0x33 => Ok(SocFamily::C2),
            0x34 => Ok(SocFamily::T5),
            0x35 => Ok(SocFamily::T5d),
            0x36 => Ok(SocFamily::T7),
            0x37 => Ok(SocFamily::S4),
            other => Err(Error::programmer(format!("unrecognized SoC family id {other:#x}"))),
        }
    }

    /// Secure-boot bit inside the chip-info FEAT word for this family.
    /// Families with no known mask (SC2, T7, S4) fail loudly rather than
    /// silently reporting "not secure".
    fn secureboot_mask(self) -> Result<u32> {
        match self {
            SocFamily::A1 | SocFamily::C1 | SocFamily::C2 => Ok(0x01),
            SocFamily::T5 | SocFamily::T5d => Ok(0x10),
            other => Err(Error::programmer(format!("no secure-boot mask known for SoC family {other:?}"))),
        }
    }
}

/// Send `getvar:identify` and classify the reply's protocol id and stage.
///
/// Byte 4 (post-prefix byte 0) must be `0x05` for ADNL; `0x03` marks the
/// legacy "Optimus" protocol, at which point session dispatch diverges and
/// this function is the wrong one to call.
pub fn identify(transport: &mut dyn UsbTransport, config: &Config) -> Result<Stage> {
    let reply = send_cmd(transport, b"getvar:identify", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    if reply.len() < 8 {
        return Err(Error::protocol("identify reply too short"));
    }
    if reply[4] != 0x05 {
        return Err(Error::protocol(format!(
            "identify reply reports protocol id {:#x}, expected ADNL (0x05)",
            reply[4]
        )));
    }
    Stage::from_wire_code(reply[7])
}

/// Read `nbytes` of chip-info page `page` starting at `offset`.
///
/// Valid only while the device is in ROM or SPL; confirmed by re-querying
/// `identify` first, matching the order the original tooling checks stage
/// and page bounds before issuing the `getchipinfo` request.
pub fn chip_info(transport: &mut dyn UsbTransport, config: &Config, page: u8, offset: usize, nbytes: usize) -> Result<Vec<u8>> {
    let stage = identify(transport, config)?;
    if stage != Stage::Rom && stage != Stage::Spl {
        return Err(Error::programmer(format!("chipinfo-{page} can't be queried from stage {stage}")));
    }
    if page > 7 {
        return Err(Error::programmer(format!("chipinfo page {page} is out of range [0, 7]")));
    }
    if offset + nbytes > 64 {
        return Err(Error::programmer("chipinfo access out of bounds of the 64-byte page"));
    }
    let cmd = format!("getvar:getchipinfo-{page}");
    let reply = send_cmd(transport, cmd.as_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    let payload = &reply[4..];
    if offset + nbytes > payload.len() {
        return Err(Error::protocol("chipinfo reply shorter than expected"));
    }
    Ok(payload[offset..offset + nbytes].to_vec())
}

/// SoC family from chip-info page 1.
pub fn soc_family(transport: &mut dyn UsbTransport, config: &Config) -> Result<SocFamily> {
    let bytes = chip_info(transport, config, 1, 0x04, 4)?;
    SocFamily::from_wire(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// 32-bit FEAT flag word from chip-info page 1.
pub fn feat_word(transport: &mut dyn UsbTransport, config: &Config) -> Result<u32> {
    let bytes = chip_info(transport, config, 1, 0x24, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Whether secure boot is enabled on this device. Valid only in ROM.
pub fn secureboot_enabled(transport: &mut dyn UsbTransport, config: &Config) -> Result<bool> {
    let stage = identify(transport, config)?;
    if stage != Stage::Rom {
        return Err(Error::programmer(format!("secureboot query requires stage ROM, device is in {stage}")));
    }
    let feat = feat_word(transport, config)?;
    let family = soc_family(transport, config)?;
    let mask = family.secureboot_mask()?;
    tracing::info!(target: "adnl::stage", ?family, feat = format!("{feat:#x}"), mask = format!("{mask:#x}"), "secure-boot status");
    Ok(feat & mask != 0)
}

impl std::fmt::Debug for SocFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SocFamily::A1 => "A1",
            SocFamily::C1 => "C1",
            SocFamily::Sc2 => "SC2",
            SocFamily::C2 => "C2",
            SocFamily::T5 => "T5",
            SocFamily::T5d => "T5D",
            SocFamily::T7 => "T7",
            SocFamily::S4 => "S4",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    struct ScriptedTransport {
        replies: Vec<Vec<u8>>,
    }

    impl UsbTransport for ScriptedTransport {
        fn control_out(&mut self, _: u8, _: u16, _: u16, _: &[u8]) -> Result<usize> {
            unimplemented!()
        }
        fn control_in(&mut self, _: u8, _: u16, _: u16, _: usize) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn bulk_write(&mut self, _data: &[u8], _timeout: StdDuration) -> Result<usize> {
            Ok(0)
        }
        fn bulk_read(&mut self, _len: usize, _timeout: StdDuration) -> Result<Vec<u8>> {
            Ok(self.replies.remove(0))
        }
        fn location(&self) -> crate::transport::DeviceLocation {
            unimplemented!()
        }
        fn reacquire(&mut self, _id: crate::config::UsbId, _last_address: u8) -> Result<()> {
            unimplemented!()
        }
    }

    fn identify_reply(stage: Stage) -> Vec<u8> {
        let mut reply = vec![0u8; 12];
        reply[0..4].copy_from_slice(b"OKAY");
        reply[4] = 0x05;
        reply[7] = stage.wire_code();
        reply
    }

    #[test]
    fn identify_maps_wire_codes() {
        for stage in [Stage::Rom, Stage::Spl, Stage::Tpl] {
            let mut transport = ScriptedTransport { replies: vec![identify_reply(stage)] };
            assert_eq!(identify(&mut transport, &Config::default()).unwrap(), stage);
        }
    }

    #[test]
    fn identify_rejects_non_adnl_protocol() {
        let mut reply = identify_reply(Stage::Rom);
        reply[4] = 0x03;
        let mut transport = ScriptedTransport { replies: vec![reply] };
        assert!(identify(&mut transport, &Config::default()).is_err());
    }

    #[test]
    fn chip_info_rejects_page_out_of_range() {
        let mut transport = ScriptedTransport { replies: vec![identify_reply(Stage::Rom)] };
        let err = chip_info(&mut transport, &Config::default(), 8, 0, 1).unwrap_err();
        assert!(matches!(err, Error::Programmer(_)));
    }

    #[test]
    fn secureboot_mask_unknown_family_is_programmer_error() {
        assert!(SocFamily::Sc2.secureboot_mask().is_err());
        assert!(SocFamily::T7.secureboot_mask().is_err());
        assert!(SocFamily::S4.secureboot_mask().is_err());
    }

    #[test]
    fn secureboot_detects_set_bit_for_t5() {
        let mut page1 = [0u8; 64];
        page1[0x04..0x08].copy_from_slice(&0x34u32.to_le_bytes());
        page1[0x24..0x28].copy_from_slice(&0x10u32.to_le_bytes());

        let mut chipinfo_reply = vec![0u8; 4 + 64];
        chipinfo_reply[0..4].copy_from_slice(b"OKAY");
        chipinfo_reply[4..].copy_from_slice(&page1);

        let mut transport = ScriptedTransport {
            replies: vec![
                identify_reply(Stage::Rom),
                identify_reply(Stage::Rom),
                chipinfo_reply.clone(),
                identify_reply(Stage::Rom),
                chipinfo_reply,
            ],
        };
        assert!(secureboot_enabled(&mut transport, &Config::default()).unwrap());
    }
}
