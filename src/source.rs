use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{DumpError, DumpResult};

/// Read-only view over the bytes of a binary.
///
/// The extractor never writes back; every read borrows from the backing
/// storage, which is either a read-only mmap or an owned buffer.
pub trait ByteSource: Send + Sync {
    fn len(&self) -> usize;

    /// Borrow `len` bytes starting at `offset`, failing on any overrun.
    fn read(&self, offset: u64, len: usize) -> DumpResult<&[u8]>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All bytes from `offset` to the end of the source.
    fn read_to_end(&self, offset: u64) -> DumpResult<&[u8]> {
        let len = (self.len() as u64)
            .checked_sub(offset)
            .ok_or_else(|| DumpError::range(offset, 0, self.len() as u64))?;
        self.read(offset, len as usize)
    }

    /// Zero-copy C string at `offset`.
    fn cstr(&self, offset: u64) -> DumpResult<&str> {
        let tail = self.read_to_end(offset)?;
        let end = find_null(tail).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end])
            .map_err(|_| DumpError::Inconsistent(format!("non-UTF8 string at {offset:#x}")))
    }

    /// Unaligned typed load.
    fn read_u32(&self, offset: u64) -> DumpResult<u32> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&self, offset: u64) -> DumpResult<u64> {
        let bytes = self.read(offset, 8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }
}

fn check_range(offset: u64, len: usize, size: usize) -> DumpResult<(usize, usize)> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| DumpError::range(offset, len as u64, size as u64))?;
    if end > size as u64 {
        return Err(DumpError::range(offset, len as u64, size as u64));
    }
    Ok((offset as usize, end as usize))
}

/// A whole file mapped read-only.
pub struct MmapSource {
    mmap: Mmap,
    path: PathBuf,
}

impl MmapSource {
    pub fn open<P: AsRef<Path>>(path: P) -> DumpResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(DumpError::FileNotFound(path));
        }
        let file = File::open(&path).map_err(|source| DumpError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        file.metadata().map_err(|source| DumpError::StatFailed {
            path: path.clone(),
            source,
        })?;
        let mmap = unsafe {
            Mmap::map(&file).map_err(|source| DumpError::MmapFailed {
                path: path.clone(),
                source,
            })?
        };
        Ok(MmapSource { mmap, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for MmapSource {
    fn len(&self) -> usize {
        self.mmap.len()
    }

    fn read(&self, offset: u64, len: usize) -> DumpResult<&[u8]> {
        let (start, end) = check_range(offset, len, self.mmap.len())?;
        Ok(&self.mmap[start..end])
    }
}

/// An owned in-memory buffer, mainly for tests and pre-read inputs.
pub struct BufSource {
    buf: Vec<u8>,
}

impl BufSource {
    pub fn new(buf: Vec<u8>) -> Self {
        BufSource { buf }
    }
}

impl ByteSource for BufSource {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn read(&self, offset: u64, len: usize) -> DumpResult<&[u8]> {
        let (start, end) = check_range(offset, len, self.buf.len())?;
        Ok(&self.buf[start..end])
    }
}

const SWAR_ONES: u64 = 0x0101_0101_0101_0101;
const SWAR_HIGH: u64 = 0x8080_8080_8080_8080;

/// Index of the first zero byte, eight bytes at a time.
///
/// A word has a zero byte iff `(w - 0x0101..) & !w & 0x8080..` is non-zero;
/// the straggler bytes at the end are scanned one by one.
pub fn find_null(bytes: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 8 <= bytes.len() {
        let word = u64::from_le_bytes([
            bytes[i],
            bytes[i + 1],
            bytes[i + 2],
            bytes[i + 3],
            bytes[i + 4],
            bytes[i + 5],
            bytes[i + 6],
            bytes[i + 7],
        ]);
        if word.wrapping_sub(SWAR_ONES) & !word & SWAR_HIGH != 0 {
            for (j, byte) in bytes[i..i + 8].iter().enumerate() {
                if *byte == 0 {
                    return Some(i + j);
                }
            }
        }
        i += 8;
    }
    bytes[i..].iter().position(|b| *b == 0).map(|j| i + j)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn naive_find_null(bytes: &[u8]) -> Option<usize> {
        bytes.iter().position(|b| *b == 0)
    }

    #[test]
    fn swar_matches_naive_on_boundaries() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0],
            vec![1],
            vec![1, 2, 3, 4, 5, 6, 7, 0],
            vec![1, 2, 3, 4, 5, 6, 7, 8, 0],
            vec![1; 7],
            vec![1; 8],
            vec![1; 9],
            b"hello world no terminator".to_vec(),
        ];
        for case in cases {
            assert_eq!(find_null(&case), naive_find_null(&case), "{case:?}");
        }
    }

    #[test]
    fn swar_matches_naive_at_every_position() {
        // Null placed at each index of a 24-byte buffer, including straddling
        // the word boundary.
        for pos in 0..24 {
            let mut buf = vec![0xee_u8; 24];
            buf[pos] = 0;
            assert_eq!(find_null(&buf), Some(pos));
        }
    }

    #[test]
    fn buf_source_bounds() {
        let src = BufSource::new(vec![1, 2, 3, 4]);
        assert_eq!(src.read(1, 2).unwrap(), &[2, 3]);
        assert!(src.read(3, 2).is_err());
        assert!(src.read(u64::MAX, 2).is_err());
        assert_eq!(src.read_u32(0).unwrap(), 0x04030201);
    }

    #[test]
    fn cstr_from_source() {
        let src = BufSource::new(b"__TEXT\0__objc_classlist\0".to_vec());
        assert_eq!(src.cstr(0).unwrap(), "__TEXT");
        assert_eq!(src.cstr(7).unwrap(), "__objc_classlist");
    }

    #[test]
    fn mmap_source_maps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"\xfe\xed\xfa\xcfrest").unwrap();
        drop(file);

        let src = MmapSource::open(&path).unwrap();
        assert_eq!(src.len(), 8);
        assert_eq!(src.read(0, 4).unwrap(), b"\xfe\xed\xfa\xcf");

        let missing = dir.path().join("nope.bin");
        assert!(matches!(
            MmapSource::open(&missing),
            Err(DumpError::FileNotFound(_))
        ));
    }
}
