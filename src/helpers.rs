pub fn string_upto_null_terminator(bytes: &[u8]) -> nom::IResult<&[u8], String> {
    let (bytes, name_bytes) = match nom::bytes::complete::take_until::<
        &str,
        &[u8],
        nom::error::Error<&[u8]>,
    >("\0")(bytes)
    {
        Ok((bytes, name_bytes)) => (bytes, name_bytes),
        Err(_) => {
            return Ok((
                &[],
                String::from_utf8_lossy(bytes).into_owned(),
            ))
        }
    };
    let name = String::from_utf8_lossy(name_bytes).into_owned();
    Ok((&bytes[1..], name))
}

/// `X.Y.Z` rendering of the packed `xxxx.yy.zz` version words used by
/// dylib and build-version commands.
pub fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        (version >> 16) & 0xffff,
        (version >> 8) & 0xff,
        version & 0xff
    )
}

/// `A.B.C.D.E` rendering of the packed `a24.b10.c10.d10.e10` source version.
pub fn source_version_string(version: u64) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        version >> 40,
        (version >> 30) & 0x3ff,
        (version >> 20) & 0x3ff,
        (version >> 10) & 0x3ff,
        version & 0x3ff
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_up_to_terminator() {
        let (rest, s) = string_upto_null_terminator(b"__TEXT\0rest").unwrap();
        assert_eq!(s, "__TEXT");
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn tolerates_missing_terminator() {
        let (rest, s) = string_upto_null_terminator(b"__LINKEDIT").unwrap();
        assert_eq!(s, "__LINKEDIT");
        assert!(rest.is_empty());
    }

    #[test]
    fn version_rendering() {
        assert_eq!(version_string(0x000E0001), "14.0.1");
        assert_eq!(source_version_string((41u64 << 40) | (2 << 30)), "41.2.0.0.0");
    }
}
