//! Driver for Amlogic SoC USB boot-and-burn sessions: identifies which boot
//! stage a device is in, then transports boot images and partition data to
//! it over either the ADNL or legacy ROM/TPL wire protocol.

pub mod adnl;
pub mod config;
pub mod container;
pub mod error;
pub mod frame;
pub mod legacy;
pub mod orchestrator;
pub mod stage;
pub mod transport;

pub use config::{Config, UsbId, AMLOGIC_VENDOR_ID};
pub use container::{ImageContainer, Item, PartitionRecord};
pub use error::{Error, Result};
pub use orchestrator::{do_adnl_burn, Protocol};
pub use stage::{SocFamily, Stage};
pub use transport::{DeviceLocation, RusbTransport, UsbTransport};
// Note: `legacy` and `adnl` are not re-exported via `pub use *` — their
// function names (`identify`, `read_memory`, ...) would collide with each
// other and with `stage::identify`. Reach them as `driver::legacy::*` /
// `driver::adnl::*`.
