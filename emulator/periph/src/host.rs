/*++

Licensed under the Apache-2.0 license.

File Name:

    host.rs

Abstract:

    File contains the host side storage behind the emulated eSPI link: system
    memory reached by bus mastering and the flash attached to the master.

--*/

use std::collections::HashMap;

/// Sparse host memory. Bytes never written read back as a pattern derived
/// from their address.
#[derive(Default)]
pub struct HostMemory {
    written: HashMap<u64, u8>,
}

impl HostMemory {
    pub fn pattern(addr: u64) -> u8 {
        (addr as u8) ^ ((addr >> 8) as u8).rotate_left(3)
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let a = addr.wrapping_add(i);
                self.written
                    .get(&a)
                    .copied()
                    .unwrap_or_else(|| Self::pattern(a))
            })
            .collect()
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.written.insert(addr.wrapping_add(i as u64), *byte);
        }
    }
}

/// Flash behind the eSPI master.
pub struct FlashImage {
    data: Vec<u8>,
}

impl FlashImage {
    pub fn new(size: usize) -> Self {
        Self {
            data: (0..size).map(|i| (i % 251) as u8).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn range(&self, offset: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    pub fn read(&self, offset: u32, len: usize) -> Option<Vec<u8>> {
        self.range(offset, len).map(|r| self.data[r].to_vec())
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        match self.range(offset, data.len()) {
            Some(r) => {
                self.data[r].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Erases the `size` block containing `offset`.
    pub fn erase(&mut self, offset: u32, size: u32) -> bool {
        let base = offset & !(size - 1);
        match self.range(base, size as usize) {
            Some(r) => {
                self.data[r].fill(0xff);
                true
            }
            None => false,
        }
    }
}
