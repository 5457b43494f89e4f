//! Intel HEX loading and saving for memory images

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use ihex::Record;

use crate::image::MemoryImage;

/// Data bytes per emitted record
const RECORD_LEN: u32 = 16;

/// Load an Intel HEX file
pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<MemoryImage> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;

    parse(&text).with_context(|| format!("failed to parse '{}'", path.display()))
}

/// Parse Intel HEX text into a memory image
pub fn parse(text: &str) -> anyhow::Result<MemoryImage> {
    let mut image = MemoryImage::new();
    let mut base = 0u32;

    for record in ihex::Reader::new(text) {
        match record.map_err(|e| anyhow!("{:?}", e))? {
            Record::Data { offset, value } => {
                let start = base + offset as u32;
                for (i, v) in value.iter().enumerate() {
                    let address = start
                        .checked_add(i as u32)
                        .ok_or_else(|| anyhow!("record at 0x{:08X} overflows the address space", start))?;
                    image.set(address, *v);
                }
            }
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::EndOfFile => break,
            // Start addresses carry no flash content
            _ => (),
        }
    }

    Ok(image)
}

/// Save a memory image as an Intel HEX file
pub fn save<P: AsRef<Path>>(path: P, image: &MemoryImage) -> anyhow::Result<()> {
    let path = path.as_ref();
    let text = render(image)?;

    fs::write(path, text).with_context(|| format!("failed to write '{}'", path.display()))
}

/// Render a memory image as Intel HEX text
pub fn render(image: &MemoryImage) -> anyhow::Result<String> {
    let mut records = Vec::new();
    let mut upper = 0u16;

    for s in image.segments() {
        let mut address = s.start;

        while address < s.end {
            let hi = (address >> 16) as u16;
            if hi != upper {
                records.push(Record::ExtendedLinearAddress(hi));
                upper = hi;
            }

            // Records never cross a 64K boundary
            let boundary = (address | 0xFFFF) + 1;
            let end = s.end.min(address + RECORD_LEN).min(boundary);

            records.push(Record::Data {
                offset: address as u16,
                value: image.bytes(address, end, 0xFF),
            });
            address = end;
        }
    }

    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records).map_err(|e| anyhow!("{:?}", e))
}
