//! Checked buffer reads shared by the wire codec.

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Error indicating that the provided buffer was too small
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Extension trait for bounds-checked reads from buffers
pub trait BufExt {
    fn get_checked_u8(&mut self) -> Result<u8>;
    fn get_checked_u16(&mut self) -> Result<u16>;
    fn get_checked_u32(&mut self) -> Result<u32>;
    fn get_checked_u64(&mut self) -> Result<u64>;
    fn get_checked_i8(&mut self) -> Result<i8>;
    fn get_checked_i32(&mut self) -> Result<i32>;
    fn get_checked_i64(&mut self) -> Result<i64>;
    /// Skip `n` bytes, failing if fewer remain
    fn skip(&mut self, n: usize) -> Result<()>;
}

impl<T: Buf> BufExt for T {
    fn get_checked_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u8())
    }

    fn get_checked_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u16())
    }

    fn get_checked_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u32())
    }

    fn get_checked_u64(&mut self) -> Result<u64> {
        if self.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u64())
    }

    fn get_checked_i8(&mut self) -> Result<i8> {
        if self.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_i8())
    }

    fn get_checked_i32(&mut self) -> Result<i32> {
        if self.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_i32())
    }

    fn get_checked_i64(&mut self) -> Result<i64> {
        if self.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_i64())
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(UnexpectedEnd);
        }
        self.advance(n);
        Ok(())
    }
}

/// Extension for `Bytes` buffers where a length-prefixed region is consumed
pub trait BytesExt {
    /// Split off the next `n` bytes, failing if fewer remain
    fn take_prefix(&mut self, n: usize) -> Result<Bytes>;
}

impl BytesExt for Bytes {
    fn take_prefix(&mut self, n: usize) -> Result<Bytes> {
        if self.len() < n {
            return Err(UnexpectedEnd);
        }
        Ok(self.split_to(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_reads() {
        let mut buf = Bytes::from_static(&[0x01, 0x02, 0x03]);
        assert_eq!(buf.get_checked_u8(), Ok(0x01));
        assert_eq!(buf.get_checked_u16(), Ok(0x0203));
        assert_eq!(buf.get_checked_u8(), Err(UnexpectedEnd));
    }

    #[test]
    fn take_respects_bounds() {
        let mut buf = Bytes::from_static(b"abcd");
        assert_eq!(buf.take_prefix(3).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(buf.take_prefix(2), Err(UnexpectedEnd));
        assert_eq!(buf.take_prefix(1).unwrap(), Bytes::from_static(b"d"));
    }
}
