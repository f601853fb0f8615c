//! USB transport: device discovery, endpoint acquisition, and the raw
//! control/bulk primitives every session is built on.
//!
//! Sessions never touch `rusb` directly — they go through the
//! [`UsbTransport`] trait, which is how the test suite swaps in a scripted
//! mock instead of a real bus.

use std::thread::sleep;
use std::time::Duration;

use rusb::{Context, Direction, UsbContext};

use crate::config::{Config, UsbId};
use crate::error::{Error, Result};

/// Where a device sits on the bus, kept around so it can be found again
/// after it re-enumerates across a stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLocation {
    pub bus: u8,
    /// `None` when the backend doesn't expose port topology; `reacquire`
    /// falls back to matching by VID/PID alone in that case.
    pub port: Option<u8>,
    pub address: u8,
}

/// The operations a session needs from the bus. Implemented for real
/// hardware by [`RusbTransport`]; implemented by a scripted mock in tests.
pub trait UsbTransport {
    fn control_out(&mut self, b_request: u8, w_value: u16, w_index: u16, data: &[u8]) -> Result<usize>;
    fn control_in(&mut self, b_request: u8, w_value: u16, w_index: u16, len: usize) -> Result<Vec<u8>>;
    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;
    fn bulk_read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;
    /// Current `(bus, port, address)` of the handle this transport owns.
    fn location(&self) -> DeviceLocation;
    /// Block until a device matching `id` appears on the bus with an
    /// address different from `last_address`, then reopen it in place.
    /// Uncancellable by design — see the driver's concurrency model.
    fn reacquire(&mut self, id: UsbId, last_address: u8) -> Result<()>;
}

struct Endpoints {
    interface: u8,
    bulk_in: u8,
    bulk_out: u8,
}

/// Real USB transport backed by `rusb`.
pub struct RusbTransport {
    context: Context,
    handle: rusb::DeviceHandle<Context>,
    endpoints: Endpoints,
    location: DeviceLocation,
    config: Config,
}

impl RusbTransport {
    /// Open the first device matching `id`, claim interface 0 alt 0, and
    /// cache its bulk endpoint pair and bus location.
    pub fn open(id: UsbId, config: Config) -> Result<Self> {
        let context = Context::new()?;
        let device = find_device(&context, id)
            .ok_or_else(|| Error::protocol(format!("no device matching {:04x}:{:04x}", id.vendor, id.product)))?;
        let (handle, endpoints, location) = open_and_claim(device)?;
        Ok(Self {
            context,
            handle,
            endpoints,
            location,
            config,
        })
    }

    fn reopen_at(&mut self, device: rusb::Device<Context>) -> Result<()> {
        let (handle, endpoints, location) = open_and_claim(device)?;
        self.handle = handle;
        self.endpoints = endpoints;
        self.location = location;
        Ok(())
    }
}

fn find_device(context: &Context, id: UsbId) -> Option<rusb::Device<Context>> {
    context.devices().ok()?.iter().find(|device| {
        device
            .device_descriptor()
            .map(|desc| desc.vendor_id() == id.vendor && desc.product_id() == id.product)
            .unwrap_or(false)
    })
}

fn open_and_claim(device: rusb::Device<Context>) -> Result<(rusb::DeviceHandle<Context>, Endpoints, DeviceLocation)> {
    let bus = device.bus_number();
    let port = device.port_number();
    let handle = device.open()?;
    handle.set_active_configuration(1).or_else(|err| match err {
        // Some devices arrive already configured; that's fine.
        rusb::Error::Busy => Ok(()),
        other => Err(other),
    })?;
    let interface_number: u8 = 0;
    handle.claim_interface(interface_number)?;

    let config_desc = device.active_config_descriptor()?;
    let interface = config_desc
        .interfaces()
        .find(|i| i.number() == interface_number)
        .ok_or_else(|| Error::protocol("interface 0 not found"))?;
    let descriptor = interface
        .descriptors()
        .next()
        .ok_or_else(|| Error::protocol("no alt setting 0 on interface 0"))?;

    let mut bulk_in = None;
    let mut bulk_out = None;
    for ep in descriptor.endpoint_descriptors() {
        if ep.transfer_type() != rusb::TransferType::Bulk {
            continue;
        }
        match ep.direction() {
            Direction::In => bulk_in = Some(ep.address()),
            Direction::Out => bulk_out = Some(ep.address()),
        }
    }
    let bulk_in = bulk_in.ok_or_else(|| Error::protocol("no bulk-IN endpoint on interface 0"))?;
    let bulk_out = bulk_out.ok_or_else(|| Error::protocol("no bulk-OUT endpoint on interface 0"))?;

    let address = handle.device().address();
    Ok((
        handle,
        Endpoints {
            interface: interface_number,
            bulk_in,
            bulk_out,
        },
        DeviceLocation { bus, port: Some(port), address },
    ))
}

impl UsbTransport for RusbTransport {
    fn control_out(&mut self, b_request: u8, w_value: u16, w_index: u16, data: &[u8]) -> Result<usize> {
        tracing::trace!(target: "adnl::transport", request = b_request, value = w_value, index = w_index, len = data.len(), "control_out");
        Ok(self
            .handle
            .write_control(0x40, b_request, w_value, w_index, data, self.config.control_timeout)?)
    }

    fn control_in(&mut self, b_request: u8, w_value: u16, w_index: u16, len: usize) -> Result<Vec<u8>> {
        tracing::trace!(target: "adnl::transport", request = b_request, value = w_value, index = w_index, len, "control_in");
        let mut buf = vec![0u8; len];
        let read = self
            .handle
            .read_control(0xc0, b_request, w_value, w_index, &mut buf, self.config.control_timeout)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.write_bulk(self.endpoints.bulk_out, data, timeout)?)
    }

    fn bulk_read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let read = self.handle.read_bulk(self.endpoints.bulk_in, &mut buf, timeout)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn location(&self) -> DeviceLocation {
        self.location
    }

    fn reacquire(&mut self, id: UsbId, last_address: u8) -> Result<()> {
        let _ = self.handle.release_interface(self.endpoints.interface);
        let last_location = self.location;
        loop {
            let candidates: Vec<_> = self
                .context
                .devices()?
                .iter()
                .filter(|device| {
                    device
                        .device_descriptor()
                        .map(|desc| desc.vendor_id() == id.vendor && desc.product_id() == id.product)
                        .unwrap_or(false)
                })
                .collect();

            let found = if let Some(port) = last_location.port {
                candidates
                    .iter()
                    .find(|d| d.bus_number() == last_location.bus && d.port_number() == port && d.address() != last_address)
                    .or_else(|| candidates.iter().find(|d| d.address() != last_address))
            } else {
                candidates.iter().find(|d| d.address() != last_address)
            };

            if let Some(device) = found {
                tracing::info!(target: "adnl::transport", address = device.address(), "device reacquired");
                return self.reopen_at(device.clone());
            }

            tracing::debug!(target: "adnl::transport", "waiting for device to re-enumerate...");
            sleep(self.config.poll_interval);
        }
    }
}
