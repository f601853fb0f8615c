//! Top-level entry point: discovers the device, determines which protocol
//! it speaks, and drives the matching session through to completion.

use std::thread::sleep;

use crate::adnl;
use crate::config::Config;
use crate::container::{partition_records, ImageContainer, PartitionRecord};
use crate::error::{Error, Result};
use crate::frame::{send_cmd, Prefix};
use crate::legacy;
use crate::stage::{self, Stage};
use crate::transport::{RusbTransport, UsbTransport};

/// Which wire protocol a discovered device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Adnl,
    Legacy,
}

/// Run a full boot-and-burn session against the first matching device found
/// on the bus.
///
/// `erase_code` is passed verbatim to `oem disk_initial`; `reset` controls
/// whether the device is rebooted once every partition has been written and
/// verified.
pub fn do_adnl_burn(config: &Config, reset: bool, erase_code: u32, container: &dyn ImageContainer) -> Result<()> {
    let (mut transport, protocol) = discover(config)?;
    run(transport.as_mut(), config, protocol, reset, erase_code, container)
}

fn discover(config: &Config) -> Result<(Box<dyn UsbTransport>, Protocol)> {
    match RusbTransport::open(config.adnl_id, *config) {
        Ok(transport) => return Ok((Box::new(transport), Protocol::Adnl)),
        Err(adnl_err) => match RusbTransport::open(config.legacy_id, *config) {
            Ok(transport) => Ok((Box::new(transport), Protocol::Legacy)),
            Err(_) => Err(adnl_err),
        },
    }
}

/// Drive a session over an already-acquired transport. Split out from
/// [`do_adnl_burn`] so tests can substitute a scripted transport instead of
/// opening a real bus.
pub fn run(
    transport: &mut dyn UsbTransport,
    config: &Config,
    protocol: Protocol,
    reset: bool,
    erase_code: u32,
    container: &dyn ImageContainer,
) -> Result<()> {
    match protocol {
        Protocol::Adnl => run_adnl(transport, config, reset, erase_code, container),
        Protocol::Legacy => run_legacy(transport, config, reset, erase_code, container),
    }
}

fn run_adnl(transport: &mut dyn UsbTransport, config: &Config, reset: bool, erase_code: u32, container: &dyn ImageContainer) -> Result<()> {
    let origin = transport.location();

    match stage::identify(transport, config)? {
        Stage::Tpl => {
            tracing::info!(target: "adnl::orchestrator", "[ANDL] device already in TPL, rebooting to BootROM");
            send_cmd(transport, b"reboot-romusb", Prefix::Okay, config.bulk_timeout, config.bulk_read_buffer)?;
            transport.reacquire(config.adnl_id, origin.address)?;
        }
        Stage::Spl => {
            return Err(Error::protocol("device reports stage SPL at session start, expected ROM or TPL"));
        }
        Stage::Rom => {}
    }

    let secure_boot = stage::secureboot_enabled(transport, config)?;
    tracing::info!(target: "adnl::orchestrator", "[ANDL] secure boot: {secure_boot}");

    adnl::rom_phase(transport, config, container, secure_boot)?;
    adnl::spl_phase(transport, config, container, secure_boot)?;

    let last_address = transport.location().address;
    transport.reacquire(config.adnl_id, last_address)?;

    adnl::tpl_phase(transport, config, container, erase_code, reset)?;
    tracing::info!(target: "adnl::orchestrator", "[ANDL] burn complete");
    Ok(())
}

/// Drive the legacy protocol's bring-up and burn sequence. Framing differs
/// from ADNL (control transfers trigger the text commands U-Boot still
/// understands, rather than bulk-OUT), but the console vocabulary and the
/// AMLC data-request handshake are the same protocol underneath.
fn run_legacy(transport: &mut dyn UsbTransport, config: &Config, reset: bool, erase_code: u32, container: &dyn ImageContainer) -> Result<()> {
    legacy::identify_host(transport)?;

    let secure_boot = false; // legacy session has no ROM-stage chipinfo query to consult
    feed_amlc(transport, config, container, secure_boot)?;

    let step1 = format!("oem setvar burnsteps {:#x}", 0xC004_1030u32);
    legacy_send_text(transport, config, &step1)?;
    let step2 = format!("oem setvar burnsteps {:#x}", 0xC004_1031u32);
    legacy_send_text(transport, config, &step2)?;
    let disk_initial = format!("oem disk_initial {erase_code}");
    legacy_send_text(transport, config, &disk_initial)?;
    let step3 = format!("oem setvar burnsteps {:#x}", 0xC004_1032u32);
    legacy_send_text(transport, config, &step3)?;

    for record in partition_records(container)? {
        legacy_burn_partition(transport, config, container, &record)?;
    }

    if reset {
        legacy::bulk_cmd(transport, config, "reboot", false)?;
    }
    tracing::info!(target: "adnl::orchestrator", "[ANDL] legacy burn complete");
    Ok(())
}

/// Feed BL2/DDR-init data to the device through repeated `GET_AMLC`
/// requests until it reports a zero-length request, mirroring ADNL's CBW
/// loop but triggered by a control transfer each round.
fn feed_amlc(transport: &mut dyn UsbTransport, config: &Config, container: &dyn ImageContainer, secure_boot: bool) -> Result<()> {
    let sub_type = if secure_boot { "DDR_ENC" } else { "DDR" };
    let mut item = container.item_get("USB", sub_type)?;
    let mut seq: u8 = 0;
    loop {
        let (length, offset) = legacy::get_boot_amlc(transport, config)?;
        if length == 0 {
            return Ok(());
        }
        item.seek(offset as u64)?;
        let chunk = item.read(length as usize)?;
        if chunk.len() != length as usize {
            return Err(Error::image(format!("USB/{sub_type} is shorter than requested AMLC range at offset {offset}")));
        }
        legacy::write_amlc_data(transport, config, seq, offset, &chunk)?;
        seq = seq.wrapping_add(1);
    }
}

fn legacy_send_text(transport: &mut dyn UsbTransport, config: &Config, cmd: &str) -> Result<Vec<u8>> {
    legacy::bulk_cmd(transport, config, cmd, true)?.ok_or_else(|| Error::protocol("BULKCMD: expected a status reply"))
}

fn legacy_burn_partition(transport: &mut dyn UsbTransport, config: &Config, container: &dyn ImageContainer, record: &PartitionRecord) -> Result<()> {
    let name = record.name.as_str();
    let mut part = container.item_get("PARTITION", name)?;

    let mwrite_cmd = format!("oem mwrite 0x{:x} normal store {name}", record.size);
    legacy_send_text(transport, config, &mwrite_cmd)?;

    loop {
        let reply = legacy_send_text(transport, config, "mwrite:verify=addsum")?;
        if reply.len() >= 4 && &reply[0..4] == b"OKAY" {
            break;
        }
        if reply.len() < 7 || &reply[0..7] != b"DATAOUT" {
            return Err(Error::protocol(format!(
                "unexpected reply to mwrite:verify for partition {name}: {:?}",
                String::from_utf8_lossy(&reply)
            )));
        }
        let text = std::str::from_utf8(&reply[7..]).map_err(|_| Error::protocol("DATAOUT reply is not valid UTF-8"))?;
        let (x, y) = text.split_once(':').ok_or_else(|| Error::protocol(format!("malformed DATAOUT reply {text:?}")))?;
        let x = u32::from_str_radix(x.trim_start_matches("0x"), 16).map_err(|_| Error::protocol(format!("bad DATAOUT length {x:?}")))?;
        let y = u64::from_str_radix(y.trim_start_matches("0x"), 16).map_err(|_| Error::protocol(format!("bad DATAOUT offset {y:?}")))?;

        part.seek(y)?;
        let buf = part.read(x as usize)?;
        if buf.len() != x as usize {
            return Err(Error::image(format!("PARTITION/{name} is shorter than requested range at offset {y}")));
        }
        for chunk in buf.chunks(config.bulk_chunk_size) {
            transport.bulk_write(chunk, config.bulk_timeout)?;
        }
        let sum = crate::frame::addsum(&buf);
        transport.bulk_write(&sum.to_le_bytes(), config.bulk_timeout)?;
    }

    let verify_cmd = format!("oem verify {}", record.verify_hash);
    legacy::bulk_cmd(transport, config, &verify_cmd, false)?;
    loop {
        let reply = legacy::bulk_cmd_stat(transport, config)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ScriptedTransport {
        replies: Vec<Vec<u8>>,
    }

    impl UsbTransport for ScriptedTransport {
        fn control_out(&mut self, _: u8, _: u16, _: u16, _: &[u8]) -> Result<usize> {
            Ok(0)
        }
        fn control_in(&mut self, _: u8, _: u16, _: u16, _: usize) -> Result<Vec<u8>> {
            Ok(self.replies.remove(0))
        }
        fn bulk_write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            Ok(data.len())
        }
        fn bulk_read(&mut self, _len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            Ok(self.replies.remove(0))
        }
        fn location(&self) -> crate::transport::DeviceLocation {
            crate::transport::DeviceLocation { bus: 1, port: Some(1), address: 5 }
        }
        fn reacquire(&mut self, _id: crate::config::UsbId, _last_address: u8) -> Result<()> {
            unimplemented!()
        }
    }

    struct EmptyContainer;
    impl ImageContainer for EmptyContainer {
        fn items(&self) -> Vec<Box<dyn crate::container::Item + '_>> {
            Vec::new()
        }
        fn item_get(&self, main_type: &str, sub_type: &str) -> Result<Box<dyn crate::container::Item + '_>> {
            Err(Error::image(format!("no item {main_type}/{sub_type}")))
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
    fn rejects_spl_at_session_start() {
        let mut transport = ScriptedTransport { replies: vec![identify_reply(Stage::Spl)] };
        let config = Config::default();
        let err = run_adnl(&mut transport, &config, false, 0, &EmptyContainer).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
