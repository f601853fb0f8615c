//! The legacy "Optimus" ROM/TPL session, used with devices enumerating as
//! VID:PID `1b8e:c003`. Unlike ADNL, every operation is a vendor control
//! transfer (`0x40` OUT / `0xc0` IN) addressed to the device, with bulk used
//! only for the payload of memory and AMLC transfers.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::addsum;
use crate::transport::UsbTransport;

const REQ_WRITE_MEM: u8 = 0x01;
const REQ_READ_MEM: u8 = 0x02;
const REQ_MODIFY_MEM: u8 = 0x04;
const REQ_RUN_IN_ADDR: u8 = 0x05;
const REQ_WR_LARGE_MEM: u8 = 0x11;
const REQ_RD_LARGE_MEM: u8 = 0x12;
const REQ_IDENTIFY_HOST: u8 = 0x20;
const REQ_TPL_CMD: u8 = 0x30;
const REQ_TPL_STAT: u8 = 0x31;
const REQ_WRITE_MEDIA: u8 = 0x32;
const REQ_READ_MEDIA: u8 = 0x33;
const REQ_BULKCMD: u8 = 0x34;
const REQ_PASSWORD: u8 = 0x35;
const REQ_NOP: u8 = 0x36;
const REQ_GET_AMLC: u8 = 0x50;
const REQ_WRITE_AMLC: u8 = 0x60;

const FLAG_KEEP_POWER_ON: u32 = 0x10;

const AMLC_AMLS_BLOCK_LENGTH: usize = 0x200;
const AMLC_MAX_BLOCK_LENGTH: usize = 0x4000;
const AMLC_MAX_TRANSFER_LENGTH: usize = 65536;

const MAX_LARGE_BLOCK_COUNT: usize = 65535;

const WRITE_MEDIA_CHECKSUM_ALG_ADDSUM: u16 = 0x00ef;

/// Opcode selecting a [`modify_memory`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOp {
    Write,
    And,
    Or,
    Nand,
    WriteBits,
    Copy,
    CopyMaskAnd,
    Memcpy,
}

impl ModifyOp {
    const fn wire_code(self) -> u16 {
        match self {
            ModifyOp::Write => 0,
            ModifyOp::And => 1,
            ModifyOp::Or => 2,
            ModifyOp::Nand => 3,
            ModifyOp::WriteBits => 4,
            ModifyOp::Copy => 5,
            ModifyOp::CopyMaskAnd => 6,
            ModifyOp::Memcpy => 7,
        }
    }
}

/// Write up to 64 bytes starting at `address`.
pub fn write_simple_memory(transport: &mut dyn UsbTransport, address: u32, data: &[u8]) -> Result<()> {
    if data.len() > 64 {
        return Err(Error::programmer("write_simple_memory: maximum size is 64 bytes"));
    }
    transport.control_out(REQ_WRITE_MEM, (address >> 16) as u16, (address & 0xffff) as u16, data)?;
    Ok(())
}

/// Write `data` in chunks of up to 64 bytes.
pub fn write_memory(transport: &mut dyn UsbTransport, address: u32, data: &[u8]) -> Result<()> {
    for (i, chunk) in data.chunks(64).enumerate() {
        write_simple_memory(transport, address + (i * 64) as u32, chunk)?;
    }
    Ok(())
}

/// Read up to 64 bytes starting at `address`.
pub fn read_simple_memory(transport: &mut dyn UsbTransport, address: u32, length: usize) -> Result<Vec<u8>> {
    if length > 64 {
        return Err(Error::programmer("read_simple_memory: maximum size is 64 bytes"));
    }
    Ok(transport.control_in(REQ_READ_MEM, (address >> 16) as u16, (address & 0xffff) as u16, length)?)
}

/// Read `length` bytes in chunks of up to 64 bytes, concatenating them in
/// order. The vendor tooling this is modeled on drops every chunk but the
/// last due to a misused return value; this builds the buffer with
/// `extend_from_slice` instead.
pub fn read_memory(transport: &mut dyn UsbTransport, address: u32, length: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(length);
    let mut offset = 0usize;
    while offset < length {
        let chunk_len = (length - offset).min(64);
        let chunk = read_simple_memory(transport, address + offset as u32, chunk_len)?;
        data.extend_from_slice(&chunk);
        offset += chunk_len;
    }
    Ok(data)
}

/// `MODIFY_MEM`: a 16-byte `(address1, data, mask, address2)` control
/// payload whose interpretation depends on `opcode`.
fn modify_memory(transport: &mut dyn UsbTransport, opcode: ModifyOp, address1: u32, data: u32, mask: u32, address2: u32) -> Result<()> {
    let mut payload = [0u8; 16];
    payload[0..4].copy_from_slice(&address1.to_le_bytes());
    payload[4..8].copy_from_slice(&data.to_le_bytes());
    payload[8..12].copy_from_slice(&mask.to_le_bytes());
    payload[12..16].copy_from_slice(&address2.to_le_bytes());
    transport.control_out(REQ_MODIFY_MEM, opcode.wire_code(), 0, &payload)?;
    Ok(())
}

pub fn read_reg(transport: &mut dyn UsbTransport, address: u32) -> Result<u32> {
    let bytes = read_simple_memory(transport, address, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| Error::protocol("read_reg: short reply"))?))
}

pub fn write_reg(transport: &mut dyn UsbTransport, address: u32, value: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::Write, address, value, 0, 0)
}

pub fn mask_reg_and(transport: &mut dyn UsbTransport, address: u32, mask: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::And, address, 0, mask, 0)
}

pub fn mask_reg_or(transport: &mut dyn UsbTransport, address: u32, mask: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::Or, address, 0, mask, 0)
}

pub fn mask_reg_nand(transport: &mut dyn UsbTransport, address: u32, mask: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::Nand, address, 0, mask, 0)
}

pub fn write_reg_bits(transport: &mut dyn UsbTransport, address: u32, mask: u32, value: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::WriteBits, address, value, mask, 0)
}

pub fn copy_reg(transport: &mut dyn UsbTransport, source: u32, dest: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::Copy, dest, 0, 0, source)
}

pub fn copy_reg_mask_and(transport: &mut dyn UsbTransport, source: u32, dest: u32, mask: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::CopyMaskAnd, dest, 0, mask, source)
}

pub fn memcpy(transport: &mut dyn UsbTransport, dest: u32, src: u32, words: u32) -> Result<()> {
    modify_memory(transport, ModifyOp::Memcpy, src, words, 0, dest)
}

/// `RUN_IN_ADDR`: jump to `address`, optionally keeping power rails on.
pub fn run(transport: &mut dyn UsbTransport, address: u32, keep_power: bool) -> Result<()> {
    let flagged = if keep_power { address | FLAG_KEEP_POWER_ON } else { address };
    transport.control_out(REQ_RUN_IN_ADDR, (address >> 16) as u16, (address & 0xffff) as u16, &flagged.to_le_bytes())?;
    Ok(())
}

/// One `WR_LARGE_MEM` super-transfer: a control header naming the target
/// address and total length, followed by `data.len() / block_length` bulk
/// chunks of exactly `block_length` bytes. `data.len()` must be a multiple
/// of `block_length`.
fn write_large_memory_block(transport: &mut dyn UsbTransport, config: &Config, address: u32, data: &[u8], block_length: usize) -> Result<()> {
    if data.len() % block_length != 0 {
        return Err(Error::protocol("write_large_memory: data length is not a multiple of block length"));
    }
    let block_count = data.len() / block_length;
    let mut ctrl = [0u8; 16];
    ctrl[0..4].copy_from_slice(&address.to_le_bytes());
    ctrl[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    transport.control_out(REQ_WR_LARGE_MEM, block_length as u16, block_count as u16, &ctrl)?;
    for chunk in data.chunks(block_length) {
        transport.bulk_write(chunk, config.bulk_timeout)?;
    }
    Ok(())
}

/// Write `data` for large transfers, splitting it across as many
/// `WR_LARGE_MEM` super-transfers as needed to respect the
/// `blockCount <= MAX_LARGE_BLOCK_COUNT` cap per control header.
pub fn write_large_memory(transport: &mut dyn UsbTransport, config: &Config, address: u32, data: &[u8], block_length: usize) -> Result<()> {
    let super_transfer_len = MAX_LARGE_BLOCK_COUNT * block_length;
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + super_transfer_len).min(data.len());
        write_large_memory_block(transport, config, address + offset as u32, &data[offset..end], block_length)?;
        offset = end;
    }
    Ok(())
}

/// One `RD_LARGE_MEM` super-transfer.
fn read_large_memory_block(transport: &mut dyn UsbTransport, config: &Config, address: u32, length: usize, block_length: usize) -> Result<Vec<u8>> {
    if length % block_length != 0 {
        return Err(Error::protocol("read_large_memory: length is not a multiple of block length"));
    }
    let block_count = length / block_length;
    let mut ctrl = [0u8; 16];
    ctrl[0..4].copy_from_slice(&address.to_le_bytes());
    ctrl[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    transport.control_out(REQ_RD_LARGE_MEM, block_length as u16, block_count as u16, &ctrl)?;
    let mut data = Vec::with_capacity(length);
    for _ in 0..block_count {
        let chunk = transport.bulk_read(block_length, config.bulk_timeout)?;
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// Read `length` bytes for large transfers, splitting the request across as
/// many `RD_LARGE_MEM` super-transfers as the `MAX_LARGE_BLOCK_COUNT` cap
/// requires.
pub fn read_large_memory(transport: &mut dyn UsbTransport, config: &Config, address: u32, length: usize, block_length: usize) -> Result<Vec<u8>> {
    let super_transfer_len = MAX_LARGE_BLOCK_COUNT * block_length;
    let mut data = Vec::with_capacity(length);
    let mut offset = 0;
    while offset < length {
        let read_len = (length - offset).min(super_transfer_len);
        let chunk = read_large_memory_block(transport, config, address + offset as u32, read_len, block_length)?;
        data.extend_from_slice(&chunk);
        offset += read_len;
    }
    Ok(data)
}

/// `IDENTIFY_HOST`: the 8-byte ASCII protocol identifier.
pub fn identify_host(transport: &mut dyn UsbTransport) -> Result<String> {
    let bytes = transport.control_in(REQ_IDENTIFY_HOST, 0, 0, 8)?;
    String::from_utf8(bytes).map_err(|e| Error::protocol(format!("identify_host reply is not ASCII: {e}")))
}

fn nul_terminate(command: &str, limit: usize) -> Result<Vec<u8>> {
    let mut bytes = command.as_bytes().to_vec();
    bytes.push(0);
    if bytes.len() >= limit {
        return Err(Error::programmer(format!("command must be shorter than {} characters", limit - 1)));
    }
    Ok(bytes)
}

/// `TPL_CMD`: send a NUL-terminated command string, under 128 characters.
pub fn tpl_command(transport: &mut dyn UsbTransport, subcode: u16, command: &str) -> Result<()> {
    let payload = nul_terminate(command, 128)?;
    transport.control_out(REQ_TPL_CMD, 0, subcode, &payload)?;
    Ok(())
}

/// `TPL_STAT`: read back a fixed 64-byte status buffer.
pub fn tpl_stat(transport: &mut dyn UsbTransport) -> Result<Vec<u8>> {
    Ok(transport.control_in(REQ_TPL_STAT, 0, 0, 0x40)?)
}

/// `PASSWORD`: send an authentication token.
pub fn send_password(transport: &mut dyn UsbTransport, password: &[u8]) -> Result<()> {
    transport.control_out(REQ_PASSWORD, 0, 0, password)?;
    Ok(())
}

/// `NOP`: no-op, used to probe whether the device is alive.
pub fn nop(transport: &mut dyn UsbTransport) -> Result<()> {
    transport.control_out(REQ_NOP, 0, 0, &[])?;
    Ok(())
}

/// `GET_AMLC`: read one BL2 data request, returning `(length, offset)` of
/// the fragment BL2 wants, and acknowledge it.
pub fn get_boot_amlc(transport: &mut dyn UsbTransport, config: &Config) -> Result<(u32, u32)> {
    transport.control_out(REQ_GET_AMLC, AMLC_AMLS_BLOCK_LENGTH as u16, 0, &[])?;
    let data = transport.bulk_read(AMLC_AMLS_BLOCK_LENGTH, config.amlc_ack_timeout)?;
    if data.len() < 16 || &data[0..4] != b"AMLC" {
        return Err(Error::protocol("GET_AMLC reply missing AMLC tag"));
    }
    let length = u32::from_le_bytes(data[8..12].try_into().unwrap());
    let offset = u32::from_le_bytes(data[12..16].try_into().unwrap());

    let mut ack = [0u8; 16];
    ack[0..4].copy_from_slice(b"OKAY");
    transport.bulk_write(&ack, config.amlc_ack_timeout)?;
    Ok((length, offset))
}

/// One `WRITE_AMLC` request: a control header naming the block offset and
/// write length, then the block streamed over bulk-OUT in chunks of up to
/// `AMLC_MAX_BLOCK_LENGTH`, acknowledged by a 16-byte `OKAY` on bulk-IN.
fn write_amlc_data_block(transport: &mut dyn UsbTransport, config: &Config, offset: u32, data: &[u8]) -> Result<()> {
    let write_length = data.len() as u32;
    transport.control_out(REQ_WRITE_AMLC, (offset as usize / AMLC_AMLS_BLOCK_LENGTH) as u16, write_length.wrapping_sub(1) as u16, &[])?;
    for chunk in data.chunks(AMLC_MAX_BLOCK_LENGTH) {
        transport.bulk_write(chunk, config.bulk_timeout)?;
    }
    let ack = transport.bulk_read(16, config.amlc_ack_timeout)?;
    if ack.len() < 4 || &ack[0..4] != b"OKAY" {
        return Err(Error::protocol("WRITE_AMLC ack missing OKAY"));
    }
    Ok(())
}

/// Write `data` as a sequence of `WRITE_AMLC` requests, then synthesize and
/// send the trailing AMLS block whose checksum covers the whole transfer.
///
/// The checksum reuses [`addsum`] rather than the vendor tooling's own
/// one-byte-tail arithmetic, which indexes into a raw integer instead of the
/// source buffer and panics on any payload with a one-byte final word.
pub fn write_amlc_data(transport: &mut dyn UsbTransport, config: &Config, seq: u8, amlc_offset: u32, data: &[u8]) -> Result<()> {
    for (i, chunk) in data.chunks(AMLC_MAX_TRANSFER_LENGTH).enumerate() {
        let offset = (i * AMLC_MAX_TRANSFER_LENGTH) as u32;
        write_amlc_data_block(transport, config, offset, chunk)?;
    }

    let checksum = addsum(data);
    let mut amls = [0u8; AMLC_AMLS_BLOCK_LENGTH];
    amls[0..4].copy_from_slice(b"AMLS");
    amls[4] = seq;
    amls[8..12].copy_from_slice(&checksum.to_le_bytes());
    if data.len() > 16 {
        let tail_len = (data.len() - 16).min(AMLC_AMLS_BLOCK_LENGTH - 16);
        amls[16..16 + tail_len].copy_from_slice(&data[16..16 + tail_len]);
    }
    write_amlc_data_block(transport, config, amlc_offset, &amls)
}

/// `READ_MEDIA`: read `size` bytes from wherever the preceding U-Boot
/// command pointed the read head.
pub fn read_media(transport: &mut dyn UsbTransport, config: &Config, size: u32) -> Result<Vec<u8>> {
    const BLOCK_LENGTH: u32 = 0x1000;
    let blocks = size.div_ceil(BLOCK_LENGTH);
    let mut ctrl = [0u8; 16];
    ctrl[4..8].copy_from_slice(&size.to_le_bytes());
    transport.control_out(REQ_READ_MEDIA, size as u16, blocks as u16, &ctrl)?;
    Ok(transport.bulk_read(size as usize, config.bulk_timeout)?)
}

/// `WRITE_MEDIA`: write `data` wherever the preceding U-Boot command pointed
/// the write head, checksummed with addsum. Returns whether the full
/// payload was accepted by the bulk layer.
pub fn write_media(transport: &mut dyn UsbTransport, config: &Config, data: &[u8], ack_len: u16, seq: u32, retry_times: u32) -> Result<bool> {
    let checksum = addsum(data);
    let mut ctrl = [0u8; 0x20];
    ctrl[0..4].copy_from_slice(&retry_times.to_le_bytes());
    ctrl[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    ctrl[8..12].copy_from_slice(&seq.to_le_bytes());
    ctrl[12..16].copy_from_slice(&checksum.to_le_bytes());
    ctrl[16..18].copy_from_slice(&WRITE_MEDIA_CHECKSUM_ALG_ADDSUM.to_le_bytes());
    ctrl[18..20].copy_from_slice(&ack_len.to_le_bytes());
    transport.control_out(REQ_WRITE_MEDIA, 1, 0xffff, &ctrl)?;
    let written = transport.bulk_write(data, config.bulk_timeout)?;
    Ok(written == data.len())
}

/// `BULKCMD`: run a U-Boot textual command, optionally reading back the
/// 512-byte status reply.
pub fn bulk_cmd(transport: &mut dyn UsbTransport, config: &Config, command: &str, read_status: bool) -> Result<Option<Vec<u8>>> {
    let payload = nul_terminate(command, 128)?;
    transport.control_out(REQ_BULKCMD, 0, 2, &payload)?;
    if read_status {
        Ok(Some(bulk_cmd_stat(transport, config)?))
    } else {
        Ok(None)
    }
}

/// Read a `BULKCMD` status reply without issuing a new command.
pub fn bulk_cmd_stat(transport: &mut dyn UsbTransport, config: &Config) -> Result<Vec<u8>> {
    Ok(transport.bulk_read(512, config.bulk_timeout)?)
}
