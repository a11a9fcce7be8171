use thiserror::Error;

pub type Result<T> = std::result::Result<T, WinUsbError>;

/// Errors reported while building or realizing a WinUSB device.
///
/// Protocol-level rejections never surface here: a request the device does not understand is
/// answered with a STALL on the packet itself. These variants only cover configuration problems
/// that make the device unfit to be attached to a bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WinUsbError {
    #[error("compatible ID {0:?} is not ASCII")]
    CompatibleIdNotAscii(String),

    #[error("string descriptor {index} is {units} UTF-16 units long (max {max})")]
    StringTooLong {
        index: usize,
        units: usize,
        max: usize,
    },

    #[error("MSOS descriptor 0x{index:04x} is {len} bytes (scratch buffer holds {max})")]
    DescriptorTooLarge { index: u16, len: usize, max: usize },

    #[error("device is already realized")]
    AlreadyRealized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for WinUsbError {
    fn from(err: serde_json::Error) -> Self {
        WinUsbError::InvalidConfig(err.to_string())
    }
}
