//! Microsoft OS 1.0 descriptors.
//!
//! Windows queries string index `0xEE` for an OS string descriptor. If the device answers, the
//! host learns a vendor request code and later fetches the extended descriptors through a vendor
//! IN request with `wIndex` selecting the descriptor:
//!
//! - Extended Compat ID (`0x0004`): binds a driver (e.g. `WINUSB`) when the USB class is not
//!   specific enough.
//! - Extended Properties (`0x0005`): registry values stored under the device's
//!   `Device Parameters` key.
//!
//! All records are written field by field in little-endian order. Windows caches what it reads,
//! so changing the descriptors of an already-enumerated device has no visible effect until the
//! cached `usbflags` / `Enum\USB` entries are removed on the guest.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::usb::USB_DESCRIPTOR_TYPE_STRING;
use crate::{Result, WinUsbError};

/// String descriptor index that advertises OS descriptor support.
pub const MSOS_DESC_INDEX: u8 = 0xee;
pub const MSOS_SIGNATURE: &str = "MSFT100";
pub const MSOS_VENDOR_CODE_QEMU: u8 = b'Q';

pub const MSOS_STR_DESC_LEN: usize = 18;
pub const MSOS_COMPAT_HEADER_LEN: usize = 16;
pub const MSOS_COMPAT_FUNCTION_LEN: usize = 24;
pub const MSOS_PROP_HEADER_LEN: usize = 10;
/// `dwSize` + `dwPropertyDataType` + `wPropertyNameLength` + `dwPropertyDataLength`.
pub const MSOS_PROP_ENTRY_FIXED_LEN: usize = 14;
/// Upper bound for a generated record.
pub const MSOS_SCRATCH_LEN: usize = 4096;

const MSOS_BCD_VERSION: u16 = 0x0100;
const MSOS_COMPAT_ID_LEN: usize = 8;

pub const SELECTIVE_SUSPEND_PROPERTY: &str = "SelectiveSuspendEnabled";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MsosDescriptorIndex {
    ExtendedCompatId = 0x0004,
    ExtendedProperties = 0x0005,
}

impl MsosDescriptorIndex {
    pub fn from_u16(index: u16) -> Option<Self> {
        match index {
            0x0004 => Some(Self::ExtendedCompatId),
            0x0005 => Some(Self::ExtendedProperties),
            _ => None,
        }
    }
}

/// Registry value types understood by the Extended Properties descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MsosPropertyType {
    RegSz = 1,
    RegExpandSz = 2,
    RegBinary = 3,
    RegDwordLe = 4,
    RegDwordBe = 5,
    RegLink = 6,
    RegMultiSz = 7,
}

/// OS descriptor settings of a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MsosDesc {
    pub vendor_code: u8,
    pub compatible_id: Option<String>,
    pub registry_property_name: Option<String>,
    pub registry_property_data: Option<String>,
    pub selective_suspend_enabled: bool,
}

impl Default for MsosDesc {
    fn default() -> Self {
        Self {
            vendor_code: MSOS_VENDOR_CODE_QEMU,
            compatible_id: None,
            registry_property_name: None,
            registry_property_data: None,
            selective_suspend_enabled: false,
        }
    }
}

impl MsosDesc {
    /// Checks that every record this configuration produces is encodable.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.compatible_id {
            if !id.is_ascii() {
                return Err(WinUsbError::CompatibleIdNotAscii(id.clone()));
            }
            if id.len() > MSOS_COMPAT_ID_LEN {
                warn!(
                    compatible_id = %id,
                    "compatible ID longer than {MSOS_COMPAT_ID_LEN} bytes will be truncated"
                );
            }
        }
        if self.registry_property_name.is_some() != self.registry_property_data.is_some() {
            warn!("registry property needs both a name and a value; it will not be reported");
        }

        for index in [
            MsosDescriptorIndex::ExtendedCompatId,
            MsosDescriptorIndex::ExtendedProperties,
        ] {
            let len = encoded_len(index, self);
            if len > MSOS_SCRATCH_LEN {
                return Err(WinUsbError::DescriptorTooLarge {
                    index: index as u16,
                    len,
                    max: MSOS_SCRATCH_LEN,
                });
            }
        }
        Ok(())
    }

    fn properties(&self) -> Vec<MsosProperty<'_>> {
        let mut props = Vec::with_capacity(2);
        if let (Some(name), Some(value)) = (
            self.registry_property_name.as_deref(),
            self.registry_property_data.as_deref(),
        ) {
            props.push(MsosProperty::String {
                ty: MsosPropertyType::RegSz,
                name,
                value,
            });
        }
        if self.selective_suspend_enabled {
            // Advertising remote wakeup in the configuration descriptor is not enough for the
            // Windows driver to actually suspend the device; this value flips the switch.
            props.push(MsosProperty::Dword {
                name: SELECTIVE_SUSPEND_PROPERTY,
                value: 1,
            });
        }
        props
    }
}

enum MsosProperty<'a> {
    String {
        ty: MsosPropertyType,
        name: &'a str,
        value: &'a str,
    },
    Dword {
        name: &'a str,
        value: u32,
    },
}

impl MsosProperty<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            MsosProperty::String { name, value, .. } => {
                MSOS_PROP_ENTRY_FIXED_LEN + utf16z_len(name) + utf16z_len(value)
            }
            MsosProperty::Dword { name, .. } => MSOS_PROP_ENTRY_FIXED_LEN + utf16z_len(name) + 4,
        }
    }
}

/// Little-endian byte cursor used to assemble descriptor records.
struct DescWriter {
    buf: Vec<u8>,
}

impl DescWriter {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MSOS_SCRATCH_LEN),
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_zeroes(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// UTF-16LE with a trailing NUL code unit.
    fn put_utf16z(&mut self, s: &str) {
        for unit in s.encode_utf16().chain(core::iter::once(0)) {
            self.put_u16_le(unit);
        }
    }

    fn patch_u32_le(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

fn utf16z_len(s: &str) -> usize {
    (s.encode_utf16().count() + 1) * 2
}

fn encoded_len(index: MsosDescriptorIndex, msos: &MsosDesc) -> usize {
    match index {
        MsosDescriptorIndex::ExtendedCompatId => MSOS_COMPAT_HEADER_LEN + MSOS_COMPAT_FUNCTION_LEN,
        MsosDescriptorIndex::ExtendedProperties => {
            MSOS_PROP_HEADER_LEN
                + msos
                    .properties()
                    .iter()
                    .map(MsosProperty::encoded_len)
                    .sum::<usize>()
        }
    }
}

/// Builds the OS string descriptor returned for string index [`MSOS_DESC_INDEX`].
///
/// `signature` must be exactly 7 UTF-16 characters (normally [`MSOS_SIGNATURE`]). Without an
/// MSOS configuration the vendor code field is left zero.
pub fn msos_str_desc(msos: Option<&MsosDesc>, signature: &str) -> [u8; MSOS_STR_DESC_LEN] {
    let units: Vec<u16> = signature.encode_utf16().collect();
    assert_eq!(
        units.len(),
        7,
        "MSOS signature must be exactly 7 characters, got {signature:?}"
    );

    let mut desc = [0u8; MSOS_STR_DESC_LEN];
    desc[0] = MSOS_STR_DESC_LEN as u8;
    desc[1] = USB_DESCRIPTOR_TYPE_STRING;
    for (i, unit) in units.iter().enumerate() {
        desc[2 + i * 2..4 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    desc[16] = msos.map_or(0, |m| m.vendor_code);
    desc[17] = 0x00;
    desc
}

fn write_compat_id(w: &mut DescWriter, msos: &MsosDesc) {
    let start = w.len();
    // Single function covering interface 0.
    let functions = [(0u8, msos.compatible_id.as_deref())];

    w.put_u32_le(0); // dwLength, patched below
    w.put_u16_le(MSOS_BCD_VERSION);
    w.put_u16_le(MsosDescriptorIndex::ExtendedCompatId as u16);
    w.put_u8(functions.len() as u8);
    w.put_zeroes(7);

    for (first_interface, compatible_id) in functions {
        let mut id = [0u8; MSOS_COMPAT_ID_LEN];
        if let Some(s) = compatible_id {
            let n = s.len().min(MSOS_COMPAT_ID_LEN);
            id[..n].copy_from_slice(&s.as_bytes()[..n]);
        }
        w.put_u8(first_interface);
        w.put_u8(0x01);
        w.put_bytes(&id);
        w.put_zeroes(MSOS_COMPAT_ID_LEN); // subCompatibleID
        w.put_zeroes(6);
    }

    let len = w.len() - start;
    w.patch_u32_le(start, len as u32);
}

fn write_property(w: &mut DescWriter, prop: &MsosProperty<'_>) {
    let start = w.len();
    let (ty, name) = match prop {
        MsosProperty::String { ty, name, .. } => (*ty, *name),
        MsosProperty::Dword { name, .. } => (MsosPropertyType::RegDwordLe, *name),
    };

    w.put_u32_le(0); // dwSize, patched below
    w.put_u32_le(ty as u32);
    w.put_u16_le(utf16z_len(name) as u16);
    w.put_utf16z(name);
    match prop {
        MsosProperty::String { value, .. } => {
            w.put_u32_le(utf16z_len(value) as u32);
            w.put_utf16z(value);
        }
        MsosProperty::Dword { value, .. } => {
            w.put_u32_le(4);
            w.put_u32_le(*value);
        }
    }

    let len = w.len() - start;
    w.patch_u32_le(start, len as u32);
}

fn write_properties(w: &mut DescWriter, msos: &MsosDesc) {
    let start = w.len();
    let props = msos.properties();

    w.put_u32_le(0); // dwLength, patched below
    w.put_u16_le(MSOS_BCD_VERSION);
    w.put_u16_le(MsosDescriptorIndex::ExtendedProperties as u16);
    w.put_u16_le(props.len() as u16);

    for prop in &props {
        write_property(w, prop);
    }

    let len = w.len() - start;
    w.patch_u32_le(start, len as u32);
}

/// Encodes the extended descriptor selected by `index`.
///
/// Unknown indices produce an empty record.
pub fn generate(index: u16, msos: &MsosDesc) -> Vec<u8> {
    let mut w = DescWriter::new();
    match MsosDescriptorIndex::from_u16(index) {
        Some(MsosDescriptorIndex::ExtendedCompatId) => write_compat_id(&mut w, msos),
        Some(MsosDescriptorIndex::ExtendedProperties) => write_properties(&mut w, msos),
        None => {}
    }
    w.into_inner()
}

/// Encodes the descriptor selected by `index` and copies at most `max_len` bytes of it into
/// `dest`, returning the number of bytes copied.
///
/// A host asking for fewer bytes than the record holds gets the leading part of it, as with any
/// other GET_DESCRIPTOR style request.
pub fn deliver(index: u16, msos: &MsosDesc, dest: &mut [u8], max_len: usize) -> usize {
    let record = generate(index, msos);
    debug_assert!(
        record.len() <= MSOS_SCRATCH_LEN,
        "MSOS record of {} bytes exceeds the scratch buffer",
        record.len()
    );
    let len = record.len().min(max_len).min(dest.len());
    dest[..len].copy_from_slice(&record[..len]);
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GUID_NAME: &str = "DeviceInterfaceGUID";
    const GUID_VALUE: &str = "{85239cd7-da0f-44ea-a9c8-da8cc28f8564}";

    fn read_u16(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
    }

    fn read_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn utf16z(s: &str) -> Vec<u8> {
        s.encode_utf16()
            .chain(core::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect()
    }

    fn guid_msos() -> MsosDesc {
        MsosDesc {
            registry_property_name: Some(GUID_NAME.to_string()),
            registry_property_data: Some(GUID_VALUE.to_string()),
            ..MsosDesc::default()
        }
    }

    #[test]
    fn compat_id_record_layout() {
        let msos = MsosDesc {
            compatible_id: Some("WINUSB".to_string()),
            ..MsosDesc::default()
        };
        let rec = generate(0x0004, &msos);

        assert_eq!(rec.len(), 40);
        assert_eq!(read_u32(&rec, 0), 40);
        assert_eq!(&rec[4..6], &[0x00, 0x01]); // bcdVersion 1.00
        assert_eq!(read_u16(&rec, 6), 0x0004);
        assert_eq!(rec[8], 1); // bCount
        assert_eq!(&rec[9..16], &[0; 7]);

        assert_eq!(rec[16], 0); // bFirstInterfaceNumber
        assert_eq!(rec[17], 0x01);
        assert_eq!(&rec[18..26], b"WINUSB\0\0");
        assert_eq!(&rec[26..40], &[0; 14]);
    }

    #[test]
    fn compat_id_without_id_is_zeroed() {
        let rec = generate(0x0004, &MsosDesc::default());
        assert_eq!(rec.len(), 40);
        assert_eq!(&rec[18..26], &[0; 8]);
    }

    #[test]
    fn compat_id_longer_than_field_is_truncated() {
        let msos = MsosDesc {
            compatible_id: Some("ABCDEFGHIJ".to_string()),
            ..MsosDesc::default()
        };
        let rec = generate(0x0004, &msos);
        assert_eq!(rec.len(), 40);
        assert_eq!(&rec[18..26], b"ABCDEFGH");
    }

    #[test]
    fn properties_with_registry_pair_only() {
        let rec = generate(0x0005, &guid_msos());

        let name = utf16z(GUID_NAME);
        let value = utf16z(GUID_VALUE);
        let prop_len = MSOS_PROP_ENTRY_FIXED_LEN + name.len() + value.len();

        assert_eq!(read_u32(&rec, 0) as usize, MSOS_PROP_HEADER_LEN + prop_len);
        assert_eq!(rec.len(), MSOS_PROP_HEADER_LEN + prop_len);
        assert_eq!(&rec[4..6], &[0x00, 0x01]);
        assert_eq!(read_u16(&rec, 6), 0x0005);
        assert_eq!(read_u16(&rec, 8), 1);

        let p = &rec[MSOS_PROP_HEADER_LEN..];
        assert_eq!(read_u32(p, 0) as usize, prop_len);
        assert_eq!(read_u32(p, 4), MsosPropertyType::RegSz as u32);
        assert_eq!(read_u16(p, 8) as usize, name.len());
        assert_eq!(&p[10..10 + name.len()], name.as_slice());
        let data_at = 10 + name.len();
        assert_eq!(read_u32(p, data_at) as usize, value.len());
        assert_eq!(&p[data_at + 4..], value.as_slice());
    }

    #[test]
    fn properties_with_selective_suspend_only() {
        let msos = MsosDesc {
            selective_suspend_enabled: true,
            ..MsosDesc::default()
        };
        let rec = generate(0x0005, &msos);
        assert_eq!(read_u16(&rec, 8), 1);

        let name = utf16z(SELECTIVE_SUSPEND_PROPERTY);
        let p = &rec[MSOS_PROP_HEADER_LEN..];
        assert_eq!(
            read_u32(p, 0) as usize,
            MSOS_PROP_ENTRY_FIXED_LEN + name.len() + 4
        );
        assert_eq!(read_u32(p, 4), MsosPropertyType::RegDwordLe as u32);
        assert_eq!(&p[10..10 + name.len()], name.as_slice());
        let data_at = 10 + name.len();
        assert_eq!(read_u32(p, data_at), 4);
        assert_eq!(read_u32(p, data_at + 4), 1);
        assert_eq!(p.len(), data_at + 8);
    }

    #[test]
    fn properties_emit_registry_pair_before_suspend_flag() {
        let msos = MsosDesc {
            selective_suspend_enabled: true,
            ..guid_msos()
        };
        let rec = generate(0x0005, &msos);
        assert_eq!(read_u16(&rec, 8), 2);

        let first_len = read_u32(&rec, MSOS_PROP_HEADER_LEN) as usize;
        assert_eq!(
            read_u32(&rec, MSOS_PROP_HEADER_LEN + 4),
            MsosPropertyType::RegSz as u32
        );
        let second = MSOS_PROP_HEADER_LEN + first_len;
        let second_len = read_u32(&rec, second) as usize;
        assert_eq!(
            read_u32(&rec, second + 4),
            MsosPropertyType::RegDwordLe as u32
        );
        assert_eq!(second + second_len, rec.len());
        assert_eq!(read_u32(&rec, 0) as usize, rec.len());
    }

    #[test]
    fn properties_without_any_property_is_bare_header() {
        let msos = MsosDesc {
            registry_property_name: Some(GUID_NAME.to_string()),
            ..MsosDesc::default()
        };
        let rec = generate(0x0005, &msos);
        assert_eq!(rec, vec![10, 0, 0, 0, 0x00, 0x01, 0x05, 0x00, 0, 0]);
    }

    #[test]
    fn unknown_index_generates_nothing() {
        assert!(generate(0x0001, &guid_msos()).is_empty());
        let mut dest = [0xaau8; 16];
        assert_eq!(deliver(0x0007, &guid_msos(), &mut dest, 16), 0);
        assert_eq!(dest, [0xaa; 16]);
    }

    #[test]
    fn deliver_truncates_to_requested_length() {
        let msos = guid_msos();
        let full = generate(0x0005, &msos);

        let mut dest = vec![0u8; 256];
        assert_eq!(deliver(0x0005, &msos, &mut dest, 10), 10);
        assert_eq!(&dest[..10], &full[..10]);
        assert!(dest[10..].iter().all(|&b| b == 0));

        let mut dest = vec![0u8; 256];
        assert_eq!(deliver(0x0005, &msos, &mut dest, 256), full.len());
        assert_eq!(&dest[..full.len()], full.as_slice());
    }

    #[test]
    fn str_desc_layout() {
        let msos = MsosDesc::default();
        let desc = msos_str_desc(Some(&msos), MSOS_SIGNATURE);
        assert_eq!(desc.len(), 18);
        assert_eq!(desc[0], 18);
        assert_eq!(desc[1], USB_DESCRIPTOR_TYPE_STRING);
        assert_eq!(&desc[2..16], utf16z("MSFT100").get(..14).unwrap());
        assert_eq!(desc[16], MSOS_VENDOR_CODE_QEMU);
        assert_eq!(desc[17], 0);
    }

    #[test]
    fn str_desc_without_msos_has_zero_vendor_code() {
        assert_eq!(msos_str_desc(None, MSOS_SIGNATURE)[16], 0);
    }

    #[test]
    fn str_desc_counts_characters_not_bytes() {
        // 7 characters, 8 UTF-8 bytes.
        let desc = msos_str_desc(None, "MSFT10\u{e9}");
        assert_eq!(&desc[2..14], utf16z("MSFT10").get(..12).unwrap());
        assert_eq!(read_u16(&desc, 14), 0x00e9);
    }

    #[test]
    #[should_panic(expected = "exactly 7 characters")]
    fn str_desc_rejects_wrong_signature_length() {
        msos_str_desc(None, "MSFT10");
    }

    #[test]
    fn validate_rejects_oversized_records() {
        let msos = MsosDesc {
            registry_property_name: Some("Name".to_string()),
            registry_property_data: Some("x".repeat(MSOS_SCRATCH_LEN)),
            ..MsosDesc::default()
        };
        assert!(matches!(
            msos.validate(),
            Err(WinUsbError::DescriptorTooLarge { index: 0x0005, .. })
        ));
    }

    #[test]
    fn validate_rejects_non_ascii_compatible_id() {
        let msos = MsosDesc {
            compatible_id: Some("WINÜSB".to_string()),
            ..MsosDesc::default()
        };
        assert_eq!(
            msos.validate(),
            Err(WinUsbError::CompatibleIdNotAscii("WINÜSB".to_string()))
        );
    }

    proptest! {
        #[test]
        fn compat_id_field_is_zero_padded(id in "[A-Z0-9_]{0,8}") {
            let msos = MsosDesc { compatible_id: Some(id.clone()), ..MsosDesc::default() };
            let rec = generate(0x0004, &msos);
            prop_assert_eq!(rec.len(), 40);
            prop_assert_eq!(read_u32(&rec, 0), 40);
            let mut expected = [0u8; 8];
            expected[..id.len()].copy_from_slice(id.as_bytes());
            prop_assert_eq!(&rec[18..26], &expected[..]);
        }

        #[test]
        fn property_lengths_are_consistent(
            name in "[A-Za-z]{1,32}",
            value in "\\PC{0,64}",
            suspend in any::<bool>(),
        ) {
            let msos = MsosDesc {
                registry_property_name: Some(name),
                registry_property_data: Some(value),
                selective_suspend_enabled: suspend,
                ..MsosDesc::default()
            };
            let rec = generate(0x0005, &msos);
            prop_assert_eq!(read_u32(&rec, 0) as usize, rec.len());

            let count = read_u16(&rec, 8) as usize;
            prop_assert_eq!(count, 1 + usize::from(suspend));

            let mut at = MSOS_PROP_HEADER_LEN;
            for _ in 0..count {
                let len = read_u32(&rec, at) as usize;
                let name_len = read_u16(&rec, at + 8) as usize;
                let data_len = read_u32(&rec, at + 10 + name_len) as usize;
                prop_assert_eq!(len, MSOS_PROP_ENTRY_FIXED_LEN + name_len + data_len);
                at += len;
            }
            prop_assert_eq!(at, rec.len());
        }

        #[test]
        fn deliver_copies_min_of_record_and_request(max_len in 0usize..128) {
            let msos = MsosDesc {
                compatible_id: Some("WINUSB".to_string()),
                ..MsosDesc::default()
            };
            let full = generate(0x0004, &msos);
            let mut dest = vec![0u8; 128];
            let n = deliver(0x0004, &msos, &mut dest, max_len);
            prop_assert_eq!(n, max_len.min(full.len()));
            prop_assert_eq!(&dest[..n], &full[..n]);
        }
    }
}
