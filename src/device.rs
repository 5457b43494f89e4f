//! Known EFM8 devices, in identification scan order

use std::borrow::Cow;
use std::fmt;

/// Variant ids probed for every device id, the bootloader does not report a maximum
pub const MAX_VARIANTS: u8 = 25;

#[derive(Debug, PartialEq, Clone)]
pub struct DeviceDescriptor {
    pub id: u8,
    pub name: Cow<'static, str>,
    pub variants: &'static [(u8, &'static str)],
}

impl DeviceDescriptor {
    /// Name of a variant, or a placeholder for variants missing from the table
    pub fn variant_name(&self, variant_id: u8) -> Cow<'static, str> {
        match self.variants.iter().find(|(id, _)| *id == variant_id) {
            Some((_, name)) => Cow::Borrowed(name),
            None => Cow::Owned(format!("UNKNOWN_VARIANT_ID_0x{:02X}", variant_id)),
        }
    }
}

/// Known devices, probed first to last
pub const KNOWN_DEVICES: &[DeviceDescriptor] = &[
    DeviceDescriptor {
        id: 0x30,
        name: Cow::Borrowed("EFM8BB1"),
        variants: &[
            (0x01, "EFM8BB10F8G_QSOP24"),
            (0x02, "EFM8BB10F8G_QFN20"),
            (0x03, "EFM8BB10F8G_SOIC16"),
            (0x05, "EFM8BB10F4G_QFN20"),
            (0x08, "EFM8BB10F2G_QFN20"),
        ],
    },
    DeviceDescriptor {
        id: 0x32,
        name: Cow::Borrowed("EFM8BB2"),
        variants: &[
            (0x01, "EFM8BB22F16G_QFN28"),
            (0x02, "EFM8BB21F16G_QSOP24"),
            (0x03, "EFM8BB21F16G_QFN20"),
        ],
    },
    DeviceDescriptor {
        id: 0x16,
        name: Cow::Borrowed("EFM8SB2"),
        variants: &[],
    },
];

/// Build the scan table, optionally followed by every device id not in the known list
pub fn scan_table(unknown_ids: bool) -> Vec<DeviceDescriptor> {
    let mut table = KNOWN_DEVICES.to_vec();

    if unknown_ids {
        for id in 0..0xFFu8 {
            if KNOWN_DEVICES.iter().any(|d| d.id == id) {
                continue;
            }
            table.push(DeviceDescriptor {
                id,
                name: Cow::Owned(format!("UNKNOWN_ID_0x{:02X}", id)),
                variants: &[],
            });
        }
    }

    table
}

/// Result of a successful identification scan
#[derive(Debug, PartialEq, Clone)]
pub struct DeviceMatch {
    pub device_id: u8,
    pub variant_id: u8,
    pub device_name: String,
    pub variant_name: String,
}

impl DeviceMatch {
    /// Most specific name for the detected part
    pub fn name(&self) -> &str {
        &self.variant_name
    }
}

impl fmt::Display for DeviceMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}, id 0x{:02X}:0x{:02X})",
            self.device_name, self.variant_name, self.device_id, self.variant_id
        )
    }
}
