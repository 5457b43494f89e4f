//! Sparse flash memory image

use std::collections::BTreeMap;
use std::iter::FromIterator;

/// Flash erase granularity
pub const FLASH_PAGE_SIZE: u32 = 512;

/// Value of erased flash, used to fill gaps when checksumming a range
pub const ERASED_BYTE: u8 = 0xFF;

/// A maximal contiguous run of populated addresses, `[start, end)`
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Segment {
    pub start: u32,
    pub end: u32,
}

/// A flash page, `[start, end)`
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FlashPage {
    pub index: u32,
    pub start: u32,
    pub end: u32,
}

impl FlashPage {
    pub fn new(index: u32) -> Self {
        let start = index * FLASH_PAGE_SIZE;
        Self {
            index,
            start,
            end: start + FLASH_PAGE_SIZE,
        }
    }

    /// The page holding `address`
    pub fn containing(address: u32) -> Self {
        Self::new(address / FLASH_PAGE_SIZE)
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end
    }
}

/// A block of at most `MAX_CHUNK` bytes to be written or verified at once
#[derive(Debug, PartialEq, Clone)]
pub struct Chunk {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Sparse address to byte mapping
#[derive(Debug, PartialEq, Clone, Default)]
pub struct MemoryImage {
    data: BTreeMap<u32, u8>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, address: u32, value: u8) {
        self.data.insert(address, value);
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.data.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Populated addresses in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.data.keys().copied()
    }

    pub fn first_address(&self) -> Option<u32> {
        self.data.keys().next().copied()
    }

    pub fn last_address(&self) -> Option<u32> {
        self.data.keys().next_back().copied()
    }

    /// Whether any address in `[start, end)` is populated
    pub fn contains_any(&self, start: u32, end: u32) -> bool {
        self.data.range(start..end).next().is_some()
    }

    /// Contiguous runs of populated addresses
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();

        for a in self.addresses() {
            match segments.last_mut() {
                Some(s) if s.end == a => s.end = a + 1,
                _ => segments.push(Segment { start: a, end: a + 1 }),
            }
        }

        segments
    }

    /// Bytes of `[start, end)`, with unpopulated addresses filled with `fill`
    pub fn bytes(&self, start: u32, end: u32, fill: u8) -> Vec<u8> {
        (start..end)
            .map(|a| self.get(a).unwrap_or(fill))
            .collect()
    }

    /// Split every segment into chunks of at most `max` bytes
    pub fn chunks(&self, max: usize) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        for s in self.segments() {
            let mut address = s.start;
            while address < s.end {
                let len = (s.end - address).min(max as u32);
                chunks.push(Chunk {
                    address,
                    data: self.bytes(address, address + len, ERASED_BYTE),
                });
                address += len;
            }
        }

        chunks
    }

    /// Pages holding at least one populated address
    pub fn pages(&self) -> Vec<FlashPage> {
        let last = match self.last_address() {
            Some(a) => a,
            None => return Vec::new(),
        };

        (0..=last / FLASH_PAGE_SIZE)
            .map(FlashPage::new)
            .filter(|p| self.contains_any(p.start, p.end))
            .collect()
    }
}

impl FromIterator<(u32, u8)> for MemoryImage {
    fn from_iter<I: IntoIterator<Item = (u32, u8)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}
