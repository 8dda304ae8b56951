use std::sync::Mutex;

use log::warn;
use schnellru::{ByLength, LruMap};

use crate::segment::Segment;

const CACHE_LIMIT: u32 = 100_000;

/// Virtual-address to file-offset translation for one slice.
///
/// Translation maps at segment granularity (sections inside one segment
/// share its mapping rule): a sorted run of `(vm_addr, vm_size, file_off)`
/// tuples searched by binary search, fronted by a bounded LRU. The cache is
/// purely an accelerator; eviction never changes results.
#[derive(Debug)]
pub struct AddressTranslator {
    entries: Vec<(u64, u64, u64)>,
    cache: Mutex<LruMap<u64, Option<u64>, ByLength>>,
}

impl AddressTranslator {
    pub fn new(mut entries: Vec<(u64, u64, u64)>) -> Self {
        entries.retain(|(_, size, _)| *size > 0);
        entries.sort_by_key(|(vm, _, _)| *vm);
        for pair in entries.windows(2) {
            let (vm_a, size_a, _) = pair[0];
            let (vm_b, _, _) = pair[1];
            if vm_a + size_a > vm_b {
                warn!("segments overlap at {vm_b:#x}; earlier mapping wins below it");
            }
        }
        AddressTranslator {
            entries,
            cache: Mutex::new(LruMap::new(ByLength::new(CACHE_LIMIT))),
        }
    }

    pub fn from_segments(segments: &[Segment]) -> Self {
        Self::new(
            segments
                .iter()
                .map(|seg| (seg.vmaddr, seg.vmsize, seg.fileoff))
                .collect(),
        )
    }

    fn lookup(&self, vm: u64) -> Option<u64> {
        let idx = match self.entries.binary_search_by_key(&vm, |(addr, _, _)| *addr) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (addr, size, off) = self.entries[idx];
        if vm < addr + size {
            Some(off + (vm - addr))
        } else {
            None
        }
    }

    pub fn file_offset(&self, vm: u64) -> Option<u64> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&vm) {
                return *hit;
            }
            let result = self.lookup(vm);
            cache.insert(vm, result);
            return result;
        }
        self.lookup(vm)
    }

    pub fn contains(&self, vm: u64) -> bool {
        self.file_offset(vm).is_some()
    }

    /// Remaining bytes of the mapping that contains `vm`, for bounding
    /// C-string reads.
    pub fn span_remaining(&self, vm: u64) -> Option<u64> {
        let idx = match self.entries.binary_search_by_key(&vm, |(addr, _, _)| *addr) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (addr, size, _) = self.entries[idx];
        if vm < addr + size {
            Some(addr + size - vm)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> AddressTranslator {
        AddressTranslator::new(vec![
            (0x100000000, 0x4000, 0x0),
            (0x100004000, 0x4000, 0x4000),
            (0x100010000, 0x1000, 0x9000),
        ])
    }

    #[test]
    fn translates_inside_segments() {
        let t = translator();
        assert_eq!(t.file_offset(0x100000000), Some(0));
        assert_eq!(t.file_offset(0x100004010), Some(0x4010));
        assert_eq!(t.file_offset(0x100010fff), Some(0x9fff));
    }

    #[test]
    fn unmapped_addresses_fail() {
        let t = translator();
        assert_eq!(t.file_offset(0xdead), None);
        assert_eq!(t.file_offset(0x100008000), None);
        assert_eq!(t.file_offset(0x100011000), None);
        assert!(!t.contains(0x100008000));
    }

    #[test]
    fn translation_is_monotonic_within_a_segment() {
        let t = translator();
        let a = 0x100004100u64;
        let b = 0x100004f00u64;
        let ta = t.file_offset(a).unwrap();
        let tb = t.file_offset(b).unwrap();
        assert!(ta < tb);
        assert_eq!(tb - ta, b - a);
    }

    #[test]
    fn cached_result_matches_uncached() {
        let t = translator();
        let first = t.file_offset(0x100004010);
        let second = t.file_offset(0x100004010);
        assert_eq!(first, second);
    }

    #[test]
    fn span_remaining_bounds_strings() {
        let t = translator();
        assert_eq!(t.span_remaining(0x100010ff0), Some(0x10));
        assert_eq!(t.span_remaining(0x100011000), None);
    }
}
