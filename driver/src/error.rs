//! Crate-wide error type.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving an Amlogic device through the
/// boot-and-burn lifecycle.
///
/// The variants mirror the error kinds a USB boot/burn session can actually
/// fail with: the bus going away, the device talking back something the
/// protocol doesn't allow, the image container not having what was asked
/// for, a partition failing post-write verification, or the driver itself
/// being asked to do something that's only valid at a different stage.
#[derive(Debug, Error)]
pub enum Error {
    /// USB enumeration, endpoint lookup, or transfer failure. Fatal to the
    /// session.
    #[error("USB transport error: {0}")]
    Transport(#[from] rusb::Error),

    /// I/O failure reading from an image item.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reply violated the wire protocol: wrong prefix, short reply, `FAIL`,
    /// missing `AMLC`/`AMLS` magic, or an observed stage transition that
    /// isn't ROM -> SPL -> TPL.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The image container didn't have an item the protocol needs, or a
    /// read/seek against an item failed.
    #[error("image error: {0}")]
    Image(String),

    /// A partition's post-write hash check came back neither `OKAY` nor
    /// `INFO`. Device storage may be left inconsistent.
    #[error("verification failed for partition {partition}: {detail}")]
    Verification {
        /// Name of the partition that failed verification.
        partition: String,
        /// What the device said instead of `OKAY`.
        detail: String,
    },

    /// The caller asked for something that's only valid in a different
    /// stage or with different preconditions (e.g. `chip_info` from TPL, a
    /// chip-info page out of `[0, 7]`, or a SoC family with no known
    /// secure-boot mask). Indicates a bug in the caller, not the device.
    #[error("programmer error: {0}")]
    Programmer(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    #[cfg(not(any(test, feature = "test-util")))]
    pub(crate) fn image(msg: impl Into<String>) -> Self {
        Error::Image(msg.into())
    }

    /// Exposes `Error::Image` construction outside of `#[cfg(test)]` for
    /// integration tests under `tests/`, mirroring `Cbw::to_bytes`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn image(msg: impl Into<String>) -> Self {
        Error::Image(msg.into())
    }

    pub(crate) fn programmer(msg: impl Into<String>) -> Self {
        Error::Programmer(msg.into())
    }
}
