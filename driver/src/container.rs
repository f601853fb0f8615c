//! The image container capability interface.
//!
//! This crate never reads an actual image file — it borrows a reference to
//! whatever the caller's container implementation is. Ownership of the
//! underlying file stays with the caller; the driver only ever holds `&dyn
//! Item` / `&dyn ImageContainer` for the lifetime of one burn session.

use crate::error::{Error, Result};

/// A read-only, seekable cursor over one named component of an image
/// (`(main_type, sub_type)`, e.g. `("USB", "DDR")` or `("PARTITION", "boot")`).
pub trait Item {
    fn main_type(&self) -> &str;
    fn sub_type(&self) -> &str;
    fn size(&self) -> u64;
    fn seek(&mut self, offset: u64) -> Result<()>;
    fn read(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Read the item's entire remaining contents as UTF-8. Used for
    /// `VERIFY` items, whose payload is a pre-formatted hash token like
    /// `"sha1sum <hex>"`.
    fn read_to_string(&mut self) -> Result<String> {
        let remaining = self.size() as usize;
        let bytes = self.read(remaining)?;
        String::from_utf8(bytes).map_err(|e| Error::image(format!("item is not valid UTF-8: {e}")))
    }
}

/// Catalog of items making up one image, keyed by `(main_type, sub_type)`.
pub trait ImageContainer {
    /// All items in the image, in no particular order.
    fn items(&self) -> Vec<Box<dyn Item + '_>>;

    /// Look up a single item by its `(main_type, sub_type)` key.
    fn item_get(&self, main_type: &str, sub_type: &str) -> Result<Box<dyn Item + '_>>;
}

/// `(name, size, verify_hash_string)` for one partition pending burn,
/// derived from a container's `PARTITION/<name>` and `VERIFY/<name>` items.
#[derive(Debug, Clone)]
pub struct PartitionRecord {
    pub name: String,
    pub size: u64,
    pub verify_hash: String,
}

/// Enumerate every `PARTITION` item in `container` paired with its
/// `VERIFY` counterpart, so a burn loop can collect the full set of work
/// up front instead of re-querying the container mid-burn.
pub fn partition_records(container: &dyn ImageContainer) -> Result<Vec<PartitionRecord>> {
    let mut records = Vec::new();
    for item in container.items() {
        if item.main_type() != "PARTITION" {
            continue;
        }
        let name = item.sub_type().to_string();
        let size = item.size();
        let verify_hash = container.item_get("VERIFY", &name)?.read_to_string()?;
        records.push(PartitionRecord { name, size, verify_hash });
    }
    Ok(records)
}
