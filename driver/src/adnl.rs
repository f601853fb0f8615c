//! The ADNL burn session: ROM bring-up, BL2 download, and TPL partition
//! burning, run in sequence over VID:PID `1b8e:c004`.

use std::thread::sleep;

use crate::config::Config;
use crate::container::{partition_records, ImageContainer, PartitionRecord};
use crate::error::{Error, Result};
use crate::frame::{addsum, send_cmd, Cbw, Prefix};
use crate::stage::{identify, Stage};
use crate::transport::UsbTransport;

const BURNSTEPS_ROM_DDR: u32 = 0xC004_0000;
const BURNSTEPS_ROM_REREAD: u32 = 0xC004_0001;
const BURNSTEPS_ROM_BOOT: u32 = 0xC004_0002;
const BURNSTEPS_SPL: u32 = 0xC004_0003;
const BURNSTEPS_TPL_1: u32 = 0xC004_1030;
const BURNSTEPS_TPL_2: u32 = 0xC004_1031;
const BURNSTEPS_TPL_3: u32 = 0xC004_1032;

/// Send a two-frame `setvar:<name>` / 4-byte-LE-argument transaction: the
/// textual command returns `DATA`, the argument returns `OKAY`.
fn send_burnsteps(transport: &mut dyn UsbTransport, config: &Config, value: u32) -> Result<()> {
    send_cmd(transport, b"setvar:burnsteps", Prefix::Data, config.bulk_timeout, config.bulk_read_buffer)?;
    send_cmd(transport, &value.to_le_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    Ok(())
}

/// Parse the NUL-terminated decimal/hex integer trailing the 4-byte prefix
/// of a `getvar:downloadsize` reply.
fn parse_download_size(reply: &[u8]) -> Result<u32> {
    let payload = &reply[4..];
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let text = std::str::from_utf8(&payload[..end])
        .map_err(|_| Error::protocol("downloadsize reply is not valid UTF-8"))?
        .trim();
    let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse::<u32>()
    };
    value.map_err(|_| Error::protocol(format!("unparseable downloadsize {text:?}")))
}

/// Phase 1: load the DDR-init / BL2 image while the device is in ROM.
///
/// The chipinfo probes in step 1 read data the host never uses; the closed
/// ROM requires them anyway on some SoCs and refuses to proceed without
/// them, so they run even though their replies are discarded.
pub fn rom_phase(transport: &mut dyn UsbTransport, config: &Config, container: &dyn ImageContainer, secure_boot: bool) -> Result<()> {
    send_cmd(transport, b"getvar:serialno", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    for page in [1u8, 0, 1, 2, 3] {
        let cmd = format!("getvar:getchipinfo-{page}");
        send_cmd(transport, cmd.as_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    }

    send_burnsteps(transport, config, BURNSTEPS_ROM_DDR)?;

    send_cmd(transport, b"getvar:getchipinfo-1", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    send_burnsteps(transport, config, BURNSTEPS_ROM_REREAD)?;

    let size_reply = send_cmd(transport, b"getvar:downloadsize", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    let bl2_size = parse_download_size(&size_reply)?;

    let sub_type = if secure_boot { "DDR_ENC" } else { "DDR" };
    let mut item = container.item_get("USB", sub_type)?;
    item.seek(0)?;
    let data = item.read(bl2_size as usize)?;
    if data.len() != bl2_size as usize {
        return Err(Error::image(format!("USB/{sub_type} is shorter than the requested download size {bl2_size}")));
    }

    let cmd = format!("download:{bl2_size:08x}");
    send_cmd(transport, cmd.as_bytes(), Prefix::Data, config.bulk_timeout, config.bulk_read_buffer)?;
    send_cmd(transport, &data, Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;

    send_burnsteps(transport, config, BURNSTEPS_ROM_BOOT)?;
    send_cmd(transport, b"boot", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    Ok(())
}

/// Phase 2: serve BL2's requests for fragments of the U-Boot image over a
/// loop of CBW pulls, until it reports `end`.
pub fn spl_phase(transport: &mut dyn UsbTransport, config: &Config, container: &dyn ImageContainer, secure_boot: bool) -> Result<()> {
    let stage = identify(transport, config)?;
    if stage != Stage::Spl {
        return Err(Error::protocol(format!("expected stage SPL to start BL2 download, device reports {stage}")));
    }
    send_burnsteps(transport, config, BURNSTEPS_SPL)?;

    let sub_type = if secure_boot { "UBOOT_ENC" } else { "UBOOT" };
    let mut item = container.item_get("USB", sub_type)?;

    loop {
        let reply = send_cmd(transport, b"getvar:cbw", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
        let cbw = Cbw::parse(&reply)?;
        if cbw.end {
            return Ok(());
        }

        item.seek(cbw.offset as u64)?;
        let window = item.read(cbw.size as usize)?;
        if window.len() != cbw.size as usize {
            return Err(Error::image(format!("USB/{sub_type} is shorter than CBW window at offset {}", cbw.offset)));
        }

        for chunk in window.chunks(config.bulk_chunk_size) {
            let header = format!("download:{:08x}", chunk.len());
            send_cmd(transport, header.as_bytes(), Prefix::Data, config.bulk_timeout, config.bulk_read_buffer)?;
            send_cmd(transport, chunk, Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
        }

        let sum = addsum(&window);
        send_cmd(transport, b"setvar:checksum", Prefix::Data, config.bulk_timeout, config.bulk_read_buffer)?;
        send_cmd(transport, &sum.to_le_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    }
}

/// Phase 3: after U-Boot re-enumerates the device, burn every `PARTITION`
/// item in `container` and optionally reboot.
pub fn tpl_phase(
    transport: &mut dyn UsbTransport,
    config: &Config,
    container: &dyn ImageContainer,
    erase_code: u32,
    reset: bool,
) -> Result<()> {
    let stage = identify(transport, config)?;
    if stage != Stage::Tpl {
        return Err(Error::protocol(format!("expected stage TPL after reacquire, device reports {stage}")));
    }

    let step1 = format!("oem setvar burnsteps {BURNSTEPS_TPL_1:#x}");
    send_cmd(transport, step1.as_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    let step2 = format!("oem setvar burnsteps {BURNSTEPS_TPL_2:#x}");
    send_cmd(transport, step2.as_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    let disk_initial = format!("oem disk_initial {erase_code}");
    send_cmd(transport, disk_initial.as_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    let step3 = format!("oem setvar burnsteps {BURNSTEPS_TPL_3:#x}");
    send_cmd(transport, step3.as_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;

    for record in partition_records(container)? {
        burn_partition(transport, config, container, &record)?;
    }

    if reset {
        send_cmd(transport, b"reboot", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    }
    Ok(())
}

/// Upload and verify a single partition.
fn burn_partition(transport: &mut dyn UsbTransport, config: &Config, container: &dyn ImageContainer, record: &PartitionRecord) -> Result<()> {
    let name = record.name.as_str();
    let mut part = container.item_get("PARTITION", name)?;

    let mwrite_cmd = format!("oem mwrite 0x{:x} normal store {name}", record.size);
    send_cmd(transport, mwrite_cmd.as_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;

    loop {
        transport.bulk_write(b"mwrite:verify=addsum", config.bulk_timeout)?;
        let reply = transport.bulk_read(config.bulk_read_buffer, config.bulk_timeout)?;
        if reply.len() >= 4 && &reply[0..4] == b"OKAY" {
            break;
        }
        let (x, y) = parse_dataout(&reply, name)?;

        part.seek(y)?;
        let buf = part.read(x as usize)?;
        if buf.len() != x as usize {
            return Err(Error::image(format!("PARTITION/{name} is shorter than requested range at offset {y}")));
        }
        for chunk in buf.chunks(config.bulk_chunk_size) {
            transport.bulk_write(chunk, config.bulk_timeout)?;
        }
        let sum = addsum(&buf);
        send_cmd(transport, &sum.to_le_bytes(), Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
    }

    let verify_cmd = format!("oem verify {}", record.verify_hash);
    transport.bulk_write(verify_cmd.as_bytes(), config.bulk_timeout)?;
    loop {
        let reply = transport.bulk_read(config.bulk_read_buffer, config.bulk_timeout)?;
        if reply.len() < 4 {
            return Err(Error::Verification {
                partition: name.to_string(),
                detail: "verify reply too short".to_string(),
            });
        }
        match &reply[0..4] {
            b"OKAY" => return Ok(()),
            b"INFO" => {
                sleep(config.poll_interval);
                continue;
            }
            _ => {
                return Err(Error::Verification {
                    partition: name.to_string(),
                    detail: String::from_utf8_lossy(&reply).into_owned(),
                })
            }
        }
    }
}

/// Parse a `DATAOUT<X>:<Y>` reply, where `X` and `Y` are hex strings with no
/// fixed width.
fn parse_dataout(reply: &[u8], partition: &str) -> Result<(u32, u64)> {
    if reply.len() < 7 || &reply[0..7] != b"DATAOUT" {
        return Err(Error::protocol(format!(
            "unexpected reply to mwrite:verify for partition {partition}: {:?}",
            String::from_utf8_lossy(reply)
        )));
    }
    let text = std::str::from_utf8(&reply[7..]).map_err(|_| Error::protocol("DATAOUT reply is not valid UTF-8"))?;
    let (x, y) = text
        .split_once(':')
        .ok_or_else(|| Error::protocol(format!("malformed DATAOUT reply {text:?}")))?;
    let x = u32::from_str_radix(x.trim_start_matches("0x"), 16).map_err(|_| Error::protocol(format!("bad DATAOUT length {x:?}")))?;
    let y = u64::from_str_radix(y.trim_start_matches("0x"), 16).map_err(|_| Error::protocol(format!("bad DATAOUT offset {y:?}")))?;
    Ok((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    struct FakeItem {
        main_type: String,
        sub_type: String,
        data: Vec<u8>,
        pos: usize,
    }

    impl crate::container::Item for FakeItem {
        fn main_type(&self) -> &str {
            &self.main_type
        }
        fn sub_type(&self) -> &str {
            &self.sub_type
        }
        fn size(&self) -> u64 {
            self.data.len() as u64
        }
        fn seek(&mut self, offset: u64) -> Result<()> {
            self.pos = offset as usize;
            Ok(())
        }
        fn read(&mut self, len: usize) -> Result<Vec<u8>> {
            let end = (self.pos + len).min(self.data.len());
            let out = self.data[self.pos..end].to_vec();
            self.pos = end;
            Ok(out)
        }
    }

    struct FakeContainer {
        items: RefCell<Vec<FakeItem>>,
    }

    impl ImageContainer for FakeContainer {
        fn items(&self) -> Vec<Box<dyn crate::container::Item + '_>> {
            Vec::new()
        }
        fn item_get(&self, main_type: &str, sub_type: &str) -> Result<Box<dyn crate::container::Item + '_>> {
            let idx = self
                .items
                .borrow()
                .iter()
                .position(|i| i.main_type == main_type && i.sub_type == sub_type)
                .ok_or_else(|| Error::image(format!("no item {main_type}/{sub_type}")))?;
            let item = self.items.borrow_mut().remove(idx);
            Ok(Box::new(item))
        }
    }

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
        fn bulk_write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
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

    fn okay(payload: &[u8]) -> Vec<u8> {
        let mut v = b"OKAY".to_vec();
        v.extend_from_slice(payload);
        v
    }

    fn data_reply() -> Vec<u8> {
        b"DATA".to_vec()
    }

    #[test]
    fn parse_download_size_accepts_decimal_and_hex() {
        let decimal = okay(b"12345\0");
        assert_eq!(parse_download_size(&decimal).unwrap(), 12345);
        let hex = okay(b"0x3039\0garbage");
        assert_eq!(parse_download_size(&hex).unwrap(), 0x3039);
    }

    #[test]
    fn parse_dataout_reads_hex_pair() {
        let reply = b"DATAOUT4000:1000".to_vec();
        let (x, y) = parse_dataout(&reply, "boot").unwrap();
        assert_eq!(x, 0x4000);
        assert_eq!(y, 0x1000);
    }

    #[test]
    fn parse_dataout_rejects_unknown_reply() {
        assert!(parse_dataout(b"FAIL", "boot").is_err());
    }

    #[test]
    fn rom_phase_sends_exact_download_size() {
        let ddr = vec![0xAAu8; 100];
        let container = FakeContainer {
            items: RefCell::new(vec![FakeItem {
                main_type: "USB".to_string(),
                sub_type: "DDR".to_string(),
                data: ddr,
                pos: 0,
            }]),
        };
        let mut replies = vec![okay(b"")]; // serialno
        for _ in 0..5 {
            replies.push(okay(&[0u8; 64])); // chipinfo probes
        }
        replies.push(data_reply()); // burnsteps cmd frame
        replies.push(okay(b"")); // burnsteps arg frame
        replies.push(okay(&[0u8; 64])); // re-read chipinfo
        replies.push(data_reply()); // burnsteps cmd frame
        replies.push(okay(b"")); // burnsteps arg frame
        replies.push(okay(b"64\0")); // downloadsize -> 64, less than ddr.len()
        replies.push(data_reply()); // download: header
        replies.push(okay(b"")); // download payload ack
        replies.push(data_reply()); // burnsteps cmd frame
        replies.push(okay(b"")); // burnsteps arg frame
        replies.push(okay(b"")); // boot

        let mut transport = ScriptedTransport { replies };
        rom_phase(&mut transport, &Config::default(), &container, false).unwrap();
    }
}
