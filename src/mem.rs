use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, OOB_MEMORY_ACCESS};

/// Handle to the guest-owned linear-memory buffer; growth replaces it,
/// leaving previously bound views stale.
pub type MemBuffer = Rc<RefCell<Vec<u8>>>;

/// Allocate a fresh zeroed memory buffer of `len` bytes.
pub fn new_buffer(len: usize) -> MemBuffer {
    Rc::new(RefCell::new(vec![0; len]))
}

macro_rules! impl_le {
    ($type:ty, $size:literal, $get_name:ident, $set_name:ident) => {
        pub fn $get_name(&self, addr: u32) -> Result<$type, Error> {
            let buf = self.buf.borrow();
            let data = buf.borrow();
            let start = addr as usize;
            let end = start
                .checked_add($size)
                .ok_or(Error::Memory(OOB_MEMORY_ACCESS))?;
            if end > data.len() {
                return Err(Error::Memory(OOB_MEMORY_ACCESS));
            }
            let mut raw = [0u8; $size];
            raw.copy_from_slice(&data[start..end]);
            Ok(<$type>::from_le_bytes(raw))
        }
        pub fn $set_name(&self, addr: u32, v: $type) -> Result<(), Error> {
            let buf = self.buf.borrow();
            let mut data = buf.borrow_mut();
            let start = addr as usize;
            let end = start
                .checked_add($size)
                .ok_or(Error::Memory(OOB_MEMORY_ACCESS))?;
            if end > data.len() {
                return Err(Error::Memory(OOB_MEMORY_ACCESS));
            }
            data[start..end].copy_from_slice(&v.to_le_bytes());
            Ok(())
        }
    };
}

/// Little-endian typed view over the guest's linear memory, rebound through
/// `set_buffer` whenever the guest grows.
pub struct DataView {
    buf: RefCell<MemBuffer>,
}

impl DataView {
    pub fn new(buf: MemBuffer) -> Self {
        Self {
            buf: RefCell::new(buf),
        }
    }

    /// Rebind the view to `buf`. Invoked on load and whenever the guest
    /// signals that its memory moved.
    pub fn set_buffer(&self, buf: MemBuffer) {
        *self.buf.borrow_mut() = buf;
    }

    /// The currently bound buffer handle.
    pub fn buffer(&self) -> MemBuffer {
        self.buf.borrow().clone()
    }

    impl_le!(u8, 1, get_u8, set_u8);
    impl_le!(i32, 4, get_i32, set_i32);
    impl_le!(u32, 4, get_u32, set_u32);
    impl_le!(f64, 8, get_f64, set_f64);

    /// 64-bit reads go through two 32-bit halves; the sign comes from the
    /// high word.
    pub fn get_i64(&self, addr: u32) -> Result<i64, Error> {
        let low = self.get_u32(addr)?;
        let high = self.get_i32(addr.wrapping_add(4))?;
        Ok((i64::from(high) << 32) | i64::from(low))
    }

    /// 64-bit writes mirror `get_i64`: low word first, then the
    /// arithmetically shifted high word.
    pub fn set_i64(&self, addr: u32, v: i64) -> Result<(), Error> {
        self.set_u32(addr, v as u32)?;
        self.set_u32(addr.wrapping_add(4), (v >> 32) as u32)
    }

    /// Read the `(ptr, len)` pair of a guest slice header at `addr`.
    pub fn load_slice_header(&self, addr: u32) -> Result<(u32, u32), Error> {
        let ptr = self.get_i64(addr)?;
        let len = self.get_i64(addr.wrapping_add(8))?;
        let ptr = u32::try_from(ptr).map_err(|_| Error::Memory(OOB_MEMORY_ACCESS))?;
        let len = u32::try_from(len).map_err(|_| Error::Memory(OOB_MEMORY_ACCESS))?;
        Ok((ptr, len))
    }

    /// Copy the bytes of the guest slice addressed at `addr` out of linear
    /// memory.
    pub fn load_slice(&self, addr: u32) -> Result<Vec<u8>, Error> {
        let (ptr, len) = self.load_slice_header(addr)?;
        self.read_bytes(ptr, len)
    }

    /// Decode the guest string addressed at `addr` as UTF-8.
    pub fn load_string(&self, addr: u32) -> Result<String, Error> {
        let bytes = self.load_slice(addr)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>, Error> {
        let buf = self.buf.borrow();
        let data = buf.borrow();
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(Error::Memory(OOB_MEMORY_ACCESS))?;
        if end > data.len() {
            return Err(Error::Memory(OOB_MEMORY_ACCESS));
        }
        Ok(data[start..end].to_vec())
    }

    pub fn write_bytes(&self, ptr: u32, bytes: &[u8]) -> Result<(), Error> {
        let buf = self.buf.borrow();
        let mut data = buf.borrow_mut();
        let start = ptr as usize;
        let end = start
            .checked_add(bytes.len())
            .ok_or(Error::Memory(OOB_MEMORY_ACCESS))?;
        if end > data.len() {
            return Err(Error::Memory(OOB_MEMORY_ACCESS));
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Run `f` over the writable byte range `[ptr, ptr+len)`. Used where the
    /// producer fills guest memory in place (e.g. the entropy import).
    pub fn with_bytes_mut<R>(
        &self,
        ptr: u32,
        len: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, Error> {
        let buf = self.buf.borrow();
        let mut data = buf.borrow_mut();
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(Error::Memory(OOB_MEMORY_ACCESS))?;
        if end > data.len() {
            return Err(Error::Memory(OOB_MEMORY_ACCESS));
        }
        Ok(f(&mut data[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(len: usize) -> DataView {
        DataView::new(new_buffer(len))
    }

    #[test]
    fn int64_halves_are_bit_exact() {
        let v = view(64);
        v.set_i64(8, 4294967297).unwrap();
        assert_eq!(
            v.read_bytes(8, 8).unwrap(),
            [0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn int64_sign_comes_from_high_word() {
        let v = view(64);
        v.write_bytes(0, &[0xFF; 8]).unwrap();
        assert_eq!(v.get_i64(0).unwrap(), -1);

        v.set_i64(16, -2).unwrap();
        assert_eq!(v.get_i64(16).unwrap(), -2);
        assert_eq!(
            v.read_bytes(16, 8).unwrap(),
            [0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn slice_header_reads_ptr_then_len() {
        let v = view(128);
        v.set_i64(0, 32).unwrap();
        v.set_i64(8, 3).unwrap();
        v.write_bytes(32, b"abc").unwrap();
        assert_eq!(v.load_slice(0).unwrap(), b"abc");
        assert_eq!(v.load_string(0).unwrap(), "abc");
    }

    #[test]
    fn rebinding_switches_the_backing_buffer() {
        let first = new_buffer(16);
        let second = new_buffer(32);
        let v = DataView::new(first.clone());
        v.set_u32(0, 7).unwrap();
        assert_eq!(first.borrow()[0], 7);

        v.set_buffer(second.clone());
        v.set_u32(0, 9).unwrap();
        assert_eq!(first.borrow()[0], 7);
        assert_eq!(second.borrow()[0], 9);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let v = view(8);
        assert!(matches!(v.get_u32(6), Err(Error::Memory(_))));
        assert!(matches!(v.set_f64(8, 1.0), Err(Error::Memory(_))));
        assert!(matches!(v.read_bytes(u32::MAX, 2), Err(Error::Memory(_))));
    }
}
