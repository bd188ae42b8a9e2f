use core::fmt;

/// Lowercase hex rendering of a byte string, used when logging call digests
/// and credential signatures. `limit` truncates long values to a prefix.
pub struct HexSlice<'a> {
    bytes: &'a [u8],
    limit: Option<usize>,
}

impl<'a> HexSlice<'a> {
    fn new<T>(data: &'a T, limit: Option<usize>) -> HexSlice<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexSlice {
            bytes: data.as_ref(),
            limit,
        }
    }
}

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = match self.limit {
            Some(limit) if limit < self.bytes.len() => &self.bytes[..limit],
            _ => self.bytes,
        };
        for byte in shown {
            write!(f, "{:02x}", byte)?;
        }
        if shown.len() < self.bytes.len() {
            write!(f, "..")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    /// Full hex rendering.
    fn hex(&self) -> HexSlice<'_>;
    /// First 6 bytes only, for log lines.
    fn short_hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice::new(self, None)
    }

    fn short_hex(&self) -> HexSlice<'_> {
        HexSlice::new(self, Some(6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_zero_padded_lowercase() {
        assert_eq!([0x0a_u8, 0xff, 0x00].hex().to_string(), "0aff00");
    }

    #[test]
    fn short_hex_truncates() {
        let digest = [0xab_u8; 32];
        assert_eq!(digest.short_hex().to_string(), "abababababab..");
        assert_eq!([1_u8, 2].short_hex().to_string(), "0102");
    }
}
