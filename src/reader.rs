use crate::error::{DumpError, DumpResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn nom(self) -> nom::number::Endianness {
        match self {
            Endian::Little => nom::number::Endianness::Little,
            Endian::Big => nom::number::Endianness::Big,
        }
    }
}

/// Bounds-checked cursor over an immutable byte slice.
///
/// Sequential reads advance the position; random reads leave it alone.
/// Every accessor fails rather than reading past the end, so a truncated
/// structure surfaces as `RangeOutOfBounds` instead of garbage. The cursor
/// is a plain value and can be reset for reuse.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        ByteCursor {
            data,
            pos: 0,
            endian,
        }
    }

    pub fn at(data: &'a [u8], offset: usize, endian: Endian) -> DumpResult<Self> {
        if offset > data.len() {
            return Err(DumpError::range(offset as u64, 0, data.len() as u64));
        }
        Ok(ByteCursor {
            data,
            pos: offset,
            endian,
        })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Reset to an absolute offset for cursor reuse.
    pub fn seek(&mut self, offset: usize) -> DumpResult<()> {
        if offset > self.data.len() {
            return Err(DumpError::range(offset as u64, 0, self.data.len() as u64));
        }
        self.pos = offset;
        Ok(())
    }

    pub fn skip(&mut self, len: usize) -> DumpResult<()> {
        self.take(len).map(|_| ())
    }

    fn take(&mut self, len: usize) -> DumpResult<&'a [u8]> {
        let bytes = self.slice(self.pos, len)?;
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> DumpResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> DumpResult<u16> {
        let bytes = self.take(2)?;
        let raw = [bytes[0], bytes[1]];
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    pub fn read_u32(&mut self) -> DumpResult<u32> {
        let bytes = self.take(4)?;
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    pub fn read_u64(&mut self) -> DumpResult<u64> {
        let bytes = self.take(8)?;
        let raw = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ];
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        })
    }

    pub fn read_i32(&mut self) -> DumpResult<i32> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn read_i64(&mut self) -> DumpResult<i64> {
        self.read_u64().map(|v| v as i64)
    }

    /// Pointer-sized read: 8 bytes when `is64`, zero-extended 4 otherwise.
    pub fn read_ptr(&mut self, is64: bool) -> DumpResult<u64> {
        if is64 {
            self.read_u64()
        } else {
            self.read_u32().map(|v| v as u64)
        }
    }

    /// Random access: borrow `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> DumpResult<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| DumpError::range(offset as u64, len as u64, self.data.len() as u64))?;
        self.data
            .get(offset..end)
            .ok_or_else(|| DumpError::range(offset as u64, len as u64, self.data.len() as u64))
    }

    /// Random access: zero-copy C string starting at `offset`.
    pub fn cstr(&self, offset: usize) -> DumpResult<&'a str> {
        let tail = self
            .data
            .get(offset..)
            .ok_or_else(|| DumpError::range(offset as u64, 1, self.data.len() as u64))?;
        let end = crate::source::find_null(tail).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end])
            .map_err(|_| DumpError::Inconsistent(format!("non-UTF8 string at offset {offset:#x}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads_advance() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xff];
        let mut cursor = ByteCursor::new(&data, Endian::Little);
        assert_eq!(cursor.read_u16().unwrap(), 1);
        assert_eq!(cursor.read_u32().unwrap(), 2);
        assert_eq!(cursor.read_u8().unwrap(), 0xff);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn big_endian_reads() {
        let data = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02];
        let mut cursor = ByteCursor::new(&data, Endian::Big);
        assert_eq!(cursor.read_u16().unwrap(), 1);
        assert_eq!(cursor.read_u32().unwrap(), 2);
    }

    #[test]
    fn no_partial_reads_past_end() {
        let data = [0x01, 0x02];
        let mut cursor = ByteCursor::new(&data, Endian::Little);
        assert!(cursor.read_u32().is_err());
        // A failed read must not move the cursor.
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.read_u16().unwrap(), 0x0201);
    }

    #[test]
    fn seek_resets_for_reuse() {
        let data = [0xaa, 0xbb, 0xcc];
        let mut cursor = ByteCursor::new(&data, Endian::Little);
        cursor.skip(2).unwrap();
        cursor.seek(1).unwrap();
        assert_eq!(cursor.read_u8().unwrap(), 0xbb);
        assert!(cursor.seek(4).is_err());
    }

    #[test]
    fn cstr_reads_to_terminator_or_end() {
        let data = b"hello\0world";
        let cursor = ByteCursor::new(data, Endian::Little);
        assert_eq!(cursor.cstr(0).unwrap(), "hello");
        assert_eq!(cursor.cstr(6).unwrap(), "world");
        assert!(cursor.cstr(12).is_err());
    }
}
