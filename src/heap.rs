//! Global data layout: three byte regions and the address allocator.
//!
//! Every initialized global lives in one of three regions according to its
//! element width. The memory image is emitted HEAP64 first, then HEAP32,
//! then HEAP8, so an absolute address folds in the sizes of the regions in
//! front of it.

use std::collections::BTreeMap;

use crate::error::{CompileError, CompileResult};

pub const STACK_ALIGN: u32 = 16;

/// Round a stack quantity up to the stack alignment.
pub fn stack_align(x: u32) -> u32 {
    crate::ir::round_up(x, STACK_ALIGN)
}

/// Symbolic form of [`stack_align`] for dynamic sizes.
pub fn stack_align_expr(x: &str) -> String {
    format!("(({x}+{})&-{})", STACK_ALIGN - 1, STACK_ALIGN)
}

/// Region-relative address: offset plus element bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub offset: u32,
    pub bits: u32,
}

pub struct GlobalLayout {
    pub data8: Vec<u8>,
    pub data32: Vec<u8>,
    pub data64: Vec<u8>,
    addresses: BTreeMap<String, Address>,
    global_base: u32,
}

impl GlobalLayout {
    pub fn new(global_base: u32) -> Self {
        Self {
            data8: Vec::new(),
            data32: Vec::new(),
            data64: Vec::new(),
            addresses: BTreeMap::new(),
            global_base,
        }
    }

    fn region_mut(&mut self, bits: u32) -> &mut Vec<u8> {
        match bits {
            8 => &mut self.data8,
            32 => &mut self.data32,
            64 => &mut self.data64,
            _ => panic!("unsupported data element size {bits}"),
        }
    }

    /// Reserve an address for `name` in the region for `bits`-wide elements,
    /// padding the region up to the element alignment first. Returns the
    /// region so the caller can push the global's bytes.
    pub fn allocate(&mut self, name: &str, bits: u32) -> &mut Vec<u8> {
        debug_assert!(!self.addresses.contains_key(name), "{name} allocated twice");
        let elem = bits / 8;
        let region = self.region_mut(bits);
        while region.len() % elem as usize != 0 {
            region.push(0);
        }
        let offset = region.len() as u32;
        self.addresses.insert(name.to_string(), Address { offset, bits });
        self.region_mut(bits)
    }

    /// The absolute address of a global, folding in the global base and the
    /// regions laid out in front of its own.
    pub fn absolute_address(&self, name: &str) -> CompileResult<u32> {
        let a = self.lookup(name)?;
        let addr = match a.bits {
            64 => a.offset + self.global_base,
            32 => a.offset + self.global_base + self.data64.len() as u32,
            8 => {
                a.offset + self.global_base + self.data64.len() as u32 + self.data32.len() as u32
            }
            _ => {
                return Err(CompileError::Invariant(format!(
                    "bad global address {name}: offset={} elementsize={}",
                    a.offset, a.bits
                )))
            }
        };
        debug_assert!(addr % (a.bits / 8).min(8) == 0, "misaligned global {name}");
        Ok(addr)
    }

    /// The offset of a global inside its own region.
    pub fn relative_address(&self, name: &str) -> CompileResult<u32> {
        Ok(self.lookup(name)?.offset)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.addresses.contains_key(name)
    }

    fn lookup(&self, name: &str) -> CompileResult<Address> {
        self.addresses.get(name).copied().ok_or_else(|| {
            CompileError::Invariant(format!("cannot find global address {name}"))
        })
    }

    /// All memory-image bytes in emission order.
    pub fn image_len(&self) -> usize {
        self.data64.len() + self.data32.len() + self.data8.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_pads_to_element_size() {
        let mut layout = GlobalLayout::new(8);
        layout.allocate("a", 64).extend_from_slice(&[1, 2, 3]); // 3 bytes
        layout.allocate("b", 64).extend_from_slice(&[9; 8]); // pads to 8 first
        assert_eq!(layout.relative_address("a").unwrap(), 0);
        assert_eq!(layout.relative_address("b").unwrap(), 8);
        assert_eq!(layout.absolute_address("b").unwrap(), 16);
        assert_eq!(layout.data64.len(), 16);
    }

    #[test]
    fn absolute_addresses_fold_in_earlier_regions() {
        let mut layout = GlobalLayout::new(8);
        layout.allocate("q", 64).extend_from_slice(&[0; 8]);
        layout.allocate("w", 32).extend_from_slice(&[0; 4]);
        layout.allocate("b", 8).push(0);
        assert_eq!(layout.absolute_address("q").unwrap(), 8);
        assert_eq!(layout.absolute_address("w").unwrap(), 16);
        assert_eq!(layout.absolute_address("b").unwrap(), 20);
    }

    #[test]
    fn widths_keep_addresses_aligned() {
        let mut layout = GlobalLayout::new(8);
        layout.allocate("a", 64).extend_from_slice(&[0; 8]);
        layout.allocate("b", 64).extend_from_slice(&[0; 8]);
        for name in ["a", "b"] {
            assert_eq!(layout.absolute_address(name).unwrap() % 8, 0);
        }
    }

    #[test]
    fn unknown_global_is_an_error() {
        let layout = GlobalLayout::new(8);
        assert!(layout.absolute_address("nope").is_err());
    }
}
