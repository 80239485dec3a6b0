#![deny(unsafe_code)]

//! GOBI - Go-Wasm Bridge.
//!
//! Host-side embedder for WebAssembly modules produced by the Go toolchain.
//! The crate supplies the module's `go` import namespace (time, randomness,
//! timeout events, console write and the `syscall/js` value bridge), writes
//! argv/env into linear memory at the fixed ABI layout, and drives the
//! exported `run`/`resume`/`getsp` entry points until the guest exits.
//!
//! The instantiated module itself is consumed through the [`GuestModule`]
//! trait; producing it (an interpreter, a JIT, a browser) is someone else's
//! job. A minimal embedding:
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::rc::Rc;
//!
//! # fn instantiate(_: &gobi::WeakDriver) -> Rc<dyn gobi::GuestModule> { unimplemented!() }
//! let driver = gobi::Driver::new();
//! let guest = instantiate(&driver.downgrade());
//! driver.load_module(guest);
//! driver.run(&["prog".to_string()], &BTreeMap::new())?;
//! # Ok::<(), gobi::Error>(())
//! ```

pub mod driver;
pub mod error;
pub mod fs;
pub mod globals;
pub mod guest;
mod imports;
pub mod mem;
pub mod table;
pub mod timer;
pub mod value;

pub use driver::{Driver, WeakDriver};
pub use error::Error;
pub use guest::GuestModule;
pub use mem::{new_buffer, DataView, MemBuffer};
pub use value::Value;
