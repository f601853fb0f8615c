//! Explicit configuration for a burn session.
//!
//! The vendor tooling this crate is modeled on leans on module-level
//! constants for device IDs and timeouts. Those become one record here,
//! passed into the orchestrator instead of read from globals, so a process
//! embedding this crate can run more than one flavor of device without
//! recompiling.

use std::time::Duration;

/// USB vendor/product ID pair identifying one protocol flavor on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

/// Amlogic's published vendor ID. Both protocol flavors use it.
pub const AMLOGIC_VENDOR_ID: u16 = 0x1b8e;

/// Knobs governing how a session talks to the bus.
///
/// `Config::default()` matches the constants the protocol was designed
/// around; override fields only to point at non-standard device IDs or to
/// loosen timeouts on a flaky bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// VID/PID for a device running the ADNL protocol (post-ROM, newer
    /// generation).
    pub adnl_id: UsbId,
    /// VID/PID for a device running the legacy ROM/TPL protocol.
    pub legacy_id: UsbId,
    /// Timeout for bulk transfers.
    pub bulk_timeout: Duration,
    /// Timeout for control transfers.
    pub control_timeout: Duration,
    /// Timeout for AMLC acknowledgement reads, which are expected to be
    /// fast and are retried rather than waited-on.
    pub amlc_ack_timeout: Duration,
    /// Maximum bytes read in one bulk-IN call when draining a reply.
    pub bulk_read_buffer: usize,
    /// Maximum bytes sent in one bulk-OUT write when streaming image data.
    pub bulk_chunk_size: usize,
    /// How often to poll the bus while waiting for the device to
    /// re-enumerate, and while polling partition verification status.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adnl_id: UsbId {
                vendor: AMLOGIC_VENDOR_ID,
                product: 0xc004,
            },
            legacy_id: UsbId {
                vendor: AMLOGIC_VENDOR_ID,
                product: 0xc003,
            },
            bulk_timeout: Duration::from_millis(5000),
            control_timeout: Duration::from_millis(5000),
            amlc_ack_timeout: Duration::from_millis(1000),
            bulk_read_buffer: 512,
            bulk_chunk_size: 16384,
            poll_interval: Duration::from_secs(1),
        }
    }
}
