//! The concrete import functions the guest links against (namespace `go`).
//!
//! Every import receives the guest's stack pointer and reads operands at
//! fixed offsets from it. Imports that can re-enter the guest re-read the
//! stack pointer before writing results, because a callback may have grown
//! (and therefore relocated) the guest stack. Reflective call failures are
//! written back as `(error value, success=0)`; they never surface to the
//! host caller.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::driver::Driver;
use crate::error::{Error, ENTROPY_FAILED, OOB_MEMORY_ACCESS};
use crate::value::{self, Value};

/// A throw escaping an import with no guest-visible status byte is fatal to
/// the run.
fn throw_to_host(thrown: Value) -> Error {
    Error::Guest(thrown.to_display_string())
}

impl Driver {
    /// `runtime.wasmExit`: code at `sp+8`. Marks the instance exited and
    /// releases every host reference the guest held.
    pub fn wasm_exit(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let code = self.inner.view.get_i32(sp + 8)?;
        self.inner.values.borrow_mut().clear();
        self.exit(code);
        Ok(())
    }

    /// `runtime.wasmWrite`: fd at `sp+8`, buffer pointer at `sp+16`, length
    /// at `sp+24`. All descriptors share the sys-shim output buffer.
    pub fn wasm_write(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let view = &self.inner.view;
        let _fd = view.get_i64(sp + 8)?;
        let ptr = view.get_i64(sp + 16)?;
        let len = view.get_i32(sp + 24)?;
        let ptr = u32::try_from(ptr).map_err(|_| Error::Memory(OOB_MEMORY_ACCESS))?;
        let len = u32::try_from(len).map_err(|_| Error::Memory(OOB_MEMORY_ACCESS))?;
        let bytes = view.read_bytes(ptr, len)?;
        self.inner.fs.write(&bytes);
        Ok(())
    }

    /// `runtime.resetMemoryDataView`: the guest grew memory; rebind the view
    /// to its current buffer.
    pub fn reset_memory_data_view(&self, sp: i32) -> Result<(), Error> {
        let _ = sp;
        let guest = self.require_guest()?;
        self.inner.view.set_buffer(guest.memory());
        Ok(())
    }

    /// `runtime.nanotime1`: monotonic nanoseconds since the epoch origin,
    /// written as int64 at `sp+8`.
    pub fn nanotime1(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let ms = self.inner.time_origin_ms + self.inner.started.elapsed().as_secs_f64() * 1000.0;
        self.inner.view.set_i64(sp + 8, (ms * 1e6) as i64)
    }

    /// `runtime.walltime`: wall-clock seconds at `sp+8`, the sub-second
    /// remainder in nanoseconds at `sp+16`.
    pub fn walltime(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.inner.view.set_i64(sp + 8, ms / 1000)?;
        self.inner.view.set_i32(sp + 16, ((ms % 1000) * 1_000_000) as i32)
    }

    /// `runtime.scheduleTimeoutEvent`: delay (ms) at `sp+8`; the allocated
    /// event id is written at `sp+16`.
    pub fn schedule_timeout_event(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let delay = self.inner.view.get_i64(sp + 8)?.max(0) as u64;
        let id = self.inner.timers.borrow_mut().schedule(delay);
        self.inner.view.set_i32(sp + 16, id as i32)
    }

    /// `runtime.clearTimeoutEvent`: id at `sp+8`. Cancelling an id that
    /// already fired and was deregistered is a no-op.
    pub fn clear_timeout_event(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let id = self.inner.view.get_i32(sp + 8)?;
        self.inner.timers.borrow_mut().clear(id as u32);
        Ok(())
    }

    /// `runtime.getRandomData`: fill the slice addressed at `sp+8` with
    /// system entropy.
    pub fn get_random_data(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let (ptr, len) = self.inner.view.load_slice_header(sp + 8)?;
        self.inner
            .view
            .with_bytes_mut(ptr, len, getrandom::getrandom)?
            .map_err(|_| Error::State(ENTROPY_FAILED))
    }

    /// `syscall/js.finalizeRef`: release one guest reference to the id at
    /// `sp+8`.
    pub fn finalize_ref(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let id = self.inner.view.get_u32(sp + 8)?;
        self.inner.values.borrow_mut().remove_ref(id);
        Ok(())
    }

    /// `syscall/js.stringVal`: intern the guest string at `sp+8` as a host
    /// value at `sp+24`.
    pub fn string_val(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let s = self.inner.view.load_string(sp + 8)?;
        self.store_value(sp + 24, &Value::String(s.into()))
    }

    /// `syscall/js.valueGet`: property read; result at `sp+32` after a
    /// stack-pointer refresh.
    pub fn value_get(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let key = self.inner.view.load_string(sp + 16)?;
        let result = value::reflect_get(&target, &key).map_err(throw_to_host)?;
        let sp = self.refresh_sp()?;
        self.store_value(sp + 32, &result)
    }

    /// `syscall/js.valueSet`: property write; value operand at `sp+32`.
    pub fn value_set(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let key = self.inner.view.load_string(sp + 16)?;
        let val = self.load_value(sp + 32)?;
        value::reflect_set(&target, &key, val).map_err(throw_to_host)
    }

    /// `syscall/js.valueDelete`: property removal.
    pub fn value_delete(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let key = self.inner.view.load_string(sp + 16)?;
        value::reflect_delete(&target, &key).map_err(throw_to_host)
    }

    /// `syscall/js.valueIndex`: indexed read; result at `sp+24`.
    pub fn value_index(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let index = self.inner.view.get_i64(sp + 16)?;
        let result = value::reflect_index(&target, index).map_err(throw_to_host)?;
        self.store_value(sp + 24, &result)
    }

    /// `syscall/js.valueSetIndex`: indexed write; value operand at `sp+24`.
    pub fn value_set_index(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let index = self.inner.view.get_i64(sp + 16)?;
        let val = self.load_value(sp + 24)?;
        value::reflect_set_index(&target, index, val).map_err(throw_to_host)
    }

    /// `syscall/js.valueCall`: method call. Receiver at `sp+8`, method name
    /// at `sp+16`, argument slice at `sp+32`; result at `sp+56` and success
    /// byte at `sp+64`, both written after the stack-pointer refresh.
    pub fn value_call(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let name = self.inner.view.load_string(sp + 16)?;
        let args = self.load_slice_of_values(sp + 32)?;
        let result = value::reflect_get(&target, &name)
            .and_then(|method| value::reflect_apply(&method, &target, &args));
        let sp = self.refresh_sp()?;
        match result {
            Ok(v) => {
                self.store_value(sp + 56, &v)?;
                self.inner.view.set_u8(sp + 64, 1)
            }
            Err(thrown) => {
                self.store_value(sp + 56, &thrown)?;
                self.inner.view.set_u8(sp + 64, 0)
            }
        }
    }

    /// `syscall/js.valueInvoke`: plain call of the value at `sp+8` with the
    /// argument slice at `sp+16`; result at `sp+40`, success at `sp+48`.
    pub fn value_invoke(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let args = self.load_slice_of_values(sp + 16)?;
        let result = value::reflect_apply(&target, &Value::Undefined, &args);
        let sp = self.refresh_sp()?;
        match result {
            Ok(v) => {
                self.store_value(sp + 40, &v)?;
                self.inner.view.set_u8(sp + 48, 1)
            }
            Err(thrown) => {
                self.store_value(sp + 40, &thrown)?;
                self.inner.view.set_u8(sp + 48, 0)
            }
        }
    }

    /// `syscall/js.valueNew`: construct the value at `sp+8` with the
    /// argument slice at `sp+16`; result at `sp+40`, success at `sp+48`.
    pub fn value_new(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let args = self.load_slice_of_values(sp + 16)?;
        let result = value::reflect_construct(&target, &args);
        let sp = self.refresh_sp()?;
        match result {
            Ok(v) => {
                self.store_value(sp + 40, &v)?;
                self.inner.view.set_u8(sp + 48, 1)
            }
            Err(thrown) => {
                self.store_value(sp + 40, &thrown)?;
                self.inner.view.set_u8(sp + 48, 0)
            }
        }
    }

    /// `syscall/js.valueLength`: element count of the value at `sp+8`,
    /// written as int64 at `sp+16`.
    pub fn value_length(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let len = self.load_value(sp + 8)?.length();
        self.inner.view.set_i64(sp + 16, len as i64)
    }

    /// `syscall/js.valuePrepareString`: UTF-8 encode the string coercion of
    /// the value at `sp+8`; the byte buffer is stored at `sp+16`, its length
    /// at `sp+24`.
    pub fn value_prepare_string(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let s = self.load_value(sp + 8)?.to_display_string();
        let bytes = s.into_bytes();
        let len = bytes.len() as i64;
        self.store_value(sp + 16, &Value::Bytes(Rc::new(RefCell::new(bytes))))?;
        self.inner.view.set_i64(sp + 24, len)
    }

    /// `syscall/js.valueLoadString`: copy a previously prepared string's
    /// bytes into the guest slice addressed at `sp+16`.
    pub fn value_load_string(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let prepared = self.load_value(sp + 8)?;
        let Value::Bytes(src) = prepared else {
            return Err(Error::Guest(
                "valueLoadString target is not a byte buffer".to_string(),
            ));
        };
        let (ptr, len) = self.inner.view.load_slice_header(sp + 16)?;
        let src = src.borrow();
        let n = (len as usize).min(src.len());
        self.inner.view.write_bytes(ptr, &src[..n])
    }

    /// `syscall/js.valueInstanceOf`: 1/0 at `sp+24`.
    pub fn value_instance_of(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let target = self.load_value(sp + 8)?;
        let ctor = self.load_value(sp + 16)?;
        self.inner
            .view
            .set_u8(sp + 24, u8::from(value::instance_of(&target, &ctor)))
    }

    /// `syscall/js.copyBytesToGo`: destination slice at `sp+8`, source byte
    /// array at `sp+32`; copied count at `sp+40`, success at `sp+48`.
    pub fn copy_bytes_to_go(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let view = &self.inner.view;
        let (dst_ptr, dst_len) = view.load_slice_header(sp + 8)?;
        let src = self.load_value(sp + 32)?;
        let Value::Bytes(src) = src else {
            return view.set_u8(sp + 48, 0);
        };
        let src = src.borrow();
        let n = (dst_len as usize).min(src.len());
        view.write_bytes(dst_ptr, &src[..n])?;
        view.set_i64(sp + 40, n as i64)?;
        view.set_u8(sp + 48, 1)
    }

    /// `syscall/js.copyBytesToJS`: destination byte array at `sp+8`, source
    /// slice at `sp+16`; copied count at `sp+40`, success at `sp+48`.
    pub fn copy_bytes_to_js(&self, sp: i32) -> Result<(), Error> {
        let sp = sp as u32;
        let view = &self.inner.view;
        let dst = self.load_value(sp + 8)?;
        let Value::Bytes(dst) = dst else {
            return view.set_u8(sp + 48, 0);
        };
        let (src_ptr, src_len) = view.load_slice_header(sp + 16)?;
        let n = {
            let mut dst = dst.borrow_mut();
            let n = dst.len().min(src_len as usize);
            let bytes = view.read_bytes(src_ptr, n as u32)?;
            dst[..n].copy_from_slice(&bytes);
            n
        };
        view.set_i64(sp + 40, n as i64)?;
        view.set_u8(sp + 48, 1)
    }

    /// `debug`: diagnostic print of the raw operand.
    pub fn debug(&self, value: i32) {
        debug!(target: "gobi", value, "debug");
    }
}
