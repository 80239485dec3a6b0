use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::{
    Error, ALREADY_EXITED, ARGS_TOO_LARGE, EVENT_LOOP_STARVED, MODULE_NOT_LOADED,
    OOB_MEMORY_ACCESS,
};
use crate::fs::{LineSink, SysFs};
use crate::globals;
use crate::guest::GuestModule;
use crate::mem::{new_buffer, DataView};
use crate::table::ValueTable;
use crate::timer::TimerQueue;
use crate::value::{self, Func, FuncKind, Object, Value};

/// Lowest address the argument writer may touch; everything below is the
/// guest's data section.
const ARGV_FLOOR: u32 = 4096;
/// First address the guest's own data may start at; the argument writer must
/// stay below it.
const DATA_CEILING: u32 = 4096 + 8192;

/// Host bridge for one guest instance: the import surface, the value table,
/// the timeout-event registry and the run/resume lifecycle. Clones share the
/// instance.
#[derive(Clone)]
pub struct Driver {
    pub(crate) inner: Rc<Inner>,
}

/// Non-owning driver handle; guests hold this so the guest-to-driver edge
/// never forms a reference cycle.
#[derive(Clone)]
pub struct WeakDriver {
    inner: Weak<Inner>,
}

impl WeakDriver {
    pub fn upgrade(&self) -> Option<Driver> {
        self.inner.upgrade().map(|inner| Driver { inner })
    }
}

pub(crate) struct Inner {
    pub(crate) view: DataView,
    pub(crate) values: RefCell<ValueTable>,
    pub(crate) timers: RefCell<TimerQueue>,
    pub(crate) fs: Rc<SysFs>,
    pub(crate) global: Value,
    pub(crate) embedder: Value,
    pub(crate) guest: RefCell<Option<Rc<dyn GuestModule>>>,
    pub(crate) exited: Cell<bool>,
    pub(crate) exit_code: Cell<i32>,
    pub(crate) time_origin_ms: f64,
    pub(crate) started: Instant,
}

impl Driver {
    pub fn new() -> Self {
        let fs = Rc::new(SysFs::new());
        let global = globals::build_global(&fs);
        let inner = Rc::new_cyclic(|weak: &Weak<Inner>| {
            let embedder = globals::build_embedder(WeakDriver {
                inner: weak.clone(),
            });
            Inner {
                view: DataView::new(new_buffer(0)),
                values: RefCell::new(ValueTable::new()),
                timers: RefCell::new(TimerQueue::new()),
                fs,
                global,
                embedder,
                guest: RefCell::new(None),
                exited: Cell::new(false),
                exit_code: Cell::new(0),
                time_origin_ms: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64() * 1000.0)
                    .unwrap_or(0.0),
                started: Instant::now(),
            }
        });
        Driver { inner }
    }

    pub fn downgrade(&self) -> WeakDriver {
        WeakDriver {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Redirect guest console output away from stdout.
    pub fn set_output_sink(&self, sink: LineSink) {
        self.inner.fs.set_sink(sink);
    }

    /// The seeded global object (reference id 5). Hosts may attach extra
    /// bindings before `run`.
    pub fn global(&self) -> Value {
        self.inner.global.clone()
    }

    /// The embedder handle (reference id 6) carrying `_pendingEvent` and
    /// `_makeFuncWrapper`.
    pub fn embedder(&self) -> Value {
        self.inner.embedder.clone()
    }

    pub fn exited(&self) -> bool {
        self.inner.exited.get()
    }

    /// The code passed to the guest's last `wasmExit`.
    pub fn exit_code(&self) -> i32 {
        self.inner.exit_code.get()
    }

    /// Capture the instantiated module's exports and bind the memory view.
    pub fn load_module(&self, guest: Rc<dyn GuestModule>) {
        self.inner.view.set_buffer(guest.memory());
        *self.inner.guest.borrow_mut() = Some(guest);
    }

    /// Serialise `args`/`env`, invoke the guest's `run` export and pump the
    /// event loop until the guest exits. A non-zero exit code is diagnostic
    /// only; it does not fail the call.
    pub fn run(&self, args: &[String], env: &BTreeMap<String, String>) -> Result<(), Error> {
        let guest = self.require_guest()?;
        let inner = &self.inner;
        inner.view.set_buffer(guest.memory());
        inner.exited.set(false);
        inner.exit_code.set(0);
        inner.timers.borrow_mut().reset();
        *inner.values.borrow_mut() =
            ValueTable::seeded(inner.global.clone(), inner.embedder.clone());
        value::reflect_set(&inner.embedder, "_pendingEvent", Value::Null)
            .expect("embedder handle is an object");

        let (argc, argv) = self.store_arguments(args, env)?;
        guest.run(argc, argv)?;

        while !inner.exited.get() {
            let next = inner.timers.borrow().earliest();
            let Some((id, deadline)) = next else {
                return Err(Error::State(EVENT_LOOP_STARVED));
            };
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
            self.fire_timeout(id)?;
        }
        Ok(())
    }

    /// Re-enter the guest to deliver queued events.
    pub fn resume(&self) -> Result<(), Error> {
        if self.inner.exited.get() {
            return Err(Error::State(ALREADY_EXITED));
        }
        let guest = self.require_guest()?;
        guest.resume()
    }

    /// The guest's current stack pointer.
    pub fn getsp(&self) -> Result<u32, Error> {
        Ok(self.require_guest()?.getsp())
    }

    /// Mark the instance exited. Non-zero codes are diagnostic only.
    pub fn exit(&self, code: i32) {
        self.inner.exited.set(true);
        self.inner.exit_code.set(code);
        if code != 0 {
            warn!(target: "gobi::driver", code, "exit code");
        }
    }

    /// Deliver one fired timeout: resume, then keep resuming while the guest
    /// leaves the id registered.
    fn fire_timeout(&self, id: u32) -> Result<(), Error> {
        self.resume()?;
        while !self.inner.exited.get() && self.timer_registered(id) {
            warn!(
                target: "gobi::driver",
                id, "scheduled timeout event still registered after resume"
            );
            self.resume()?;
        }
        Ok(())
    }

    fn timer_registered(&self, id: u32) -> bool {
        self.inner.timers.borrow().contains(id)
    }

    /// Write argv/env into linear memory per the fixed layout: NUL-terminated
    /// UTF-8 strings from 4096 up, 8-byte aligned, args first then env sorted
    /// by key; the pointer arrays (argv then envp, each 0-terminated) follow.
    fn store_arguments(
        &self,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<(i32, i32), Error> {
        let view = &self.inner.view;
        let mut offset = ARGV_FLOOR;

        fn write_str(view: &DataView, offset: &mut u32, s: &str) -> Result<u32, Error> {
            let ptr = *offset;
            view.write_bytes(*offset, s.as_bytes())?;
            view.set_u8(*offset + s.len() as u32, 0)?;
            *offset += s.len() as u32 + 1;
            if *offset % 8 != 0 {
                *offset += 8 - *offset % 8;
            }
            Ok(ptr)
        }

        let mut ptrs: Vec<u32> = Vec::with_capacity(args.len() + env.len() + 2);
        for arg in args {
            ptrs.push(write_str(view, &mut offset, arg)?);
        }
        ptrs.push(0);
        for (key, val) in env {
            ptrs.push(write_str(view, &mut offset, &format!("{key}={val}"))?);
        }
        ptrs.push(0);

        let argv = offset;
        for ptr in &ptrs {
            view.set_u32(offset, *ptr)?;
            view.set_u32(offset + 4, 0)?;
            offset += 8;
        }

        if offset >= DATA_CEILING {
            return Err(Error::Argument(ARGS_TOO_LARGE));
        }
        Ok((args.len() as i32, argv as i32))
    }

    // ---------------- Shared marshalling helpers ----------------

    pub(crate) fn require_guest(&self) -> Result<Rc<dyn GuestModule>, Error> {
        self.inner
            .guest
            .borrow()
            .clone()
            .ok_or(Error::State(MODULE_NOT_LOADED))
    }

    /// Re-read the stack pointer after anything that may have re-entered the
    /// guest (its stack may have relocated).
    pub(crate) fn refresh_sp(&self) -> Result<u32, Error> {
        self.getsp()
    }

    pub(crate) fn load_value(&self, addr: u32) -> Result<Value, Error> {
        self.inner.values.borrow().load_value(&self.inner.view, addr)
    }

    pub(crate) fn store_value(&self, addr: u32, value: &Value) -> Result<(), Error> {
        self.inner
            .values
            .borrow_mut()
            .store_value(&self.inner.view, addr, value)
    }

    pub(crate) fn load_slice_of_values(&self, addr: u32) -> Result<Vec<Value>, Error> {
        let view = &self.inner.view;
        let arr = view.get_i64(addr)?;
        let len = view.get_i64(addr + 8)?;
        let arr = u32::try_from(arr).map_err(|_| Error::Memory(OOB_MEMORY_ACCESS))?;
        let len = u32::try_from(len).map_err(|_| Error::Memory(OOB_MEMORY_ACCESS))?;
        let mut out = Vec::with_capacity(len as usize);
        for i in 0..len {
            out.push(self.load_value(arr + i * 8)?);
        }
        Ok(out)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------- Func wrappers ----------------

/// Host callable proxying the guest-registered callback `id`.
pub(crate) fn make_func_wrapper(driver: WeakDriver, id: u32) -> Value {
    Value::Func(Rc::new(Func {
        name: "wrapped",
        kind: FuncKind::Wrapper { id, driver },
    }))
}

/// Invoke a guest callback: stage the pending event, resume once, return the
/// event's `result`. At most one event may be staged at a time.
pub(crate) fn invoke_wrapper(
    driver: &WeakDriver,
    id: u32,
    this: &Value,
    args: &[Value],
) -> Result<Value, Value> {
    let Some(driver) = driver.upgrade() else {
        return Err(value::type_error("bridge instance dropped"));
    };
    let embedder = driver.inner.embedder.clone();
    let staged = value::reflect_get(&embedder, "_pendingEvent")?;
    if !matches!(staged, Value::Null | Value::Undefined) {
        return Err(value::type_error("a pending event is already staged"));
    }
    let event = Value::Object(Object::with_props(
        "Object",
        [
            ("id", Value::Number(f64::from(id))),
            ("this", this.clone()),
            ("args", Value::Array(Rc::new(RefCell::new(args.to_vec())))),
        ],
    ));
    value::reflect_set(&embedder, "_pendingEvent", event.clone())?;
    if let Err(err) = driver.resume() {
        return Err(value::error_value(&err.to_string()));
    }
    value::reflect_get(&event, "result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::new_buffer;

    fn driver_with_memory(len: usize) -> Driver {
        let driver = Driver::new();
        driver.inner.view.set_buffer(new_buffer(len));
        driver
    }

    fn read_cstr(driver: &Driver, ptr: u32) -> String {
        let mut out = Vec::new();
        let mut addr = ptr;
        loop {
            let b = driver.inner.view.get_u8(addr).unwrap();
            if b == 0 {
                break;
            }
            out.push(b);
            addr += 1;
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn argument_layout_is_byte_exact() {
        let driver = driver_with_memory(64 * 1024);
        let args = vec!["js".to_string(), "hello".to_string()];
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());

        let (argc, argv) = driver.store_arguments(&args, &env).unwrap();
        assert_eq!(argc, 2);
        let argv = argv as u32;
        assert!(argv >= ARGV_FLOOR);

        // Strings land in order from 4096 up, each 8-byte aligned.
        assert_eq!(read_cstr(&driver, 4096), "js");
        assert_eq!(read_cstr(&driver, 4104), "hello");
        assert_eq!(read_cstr(&driver, 4112), "A=1");
        assert_eq!(read_cstr(&driver, 4120), "B=2");

        let view = &driver.inner.view;
        // argv: two pointers, then the 0 terminator, then envp.
        assert_eq!(view.get_u32(argv).unwrap(), 4096);
        assert_eq!(view.get_u32(argv + 4).unwrap(), 0);
        assert_eq!(view.get_u32(argv + 8).unwrap(), 4104);
        assert_eq!(view.get_u32(argv + 16).unwrap(), 0);
        assert_eq!(view.get_u32(argv + 24).unwrap(), 4112);
        assert_eq!(view.get_u32(argv + 32).unwrap(), 4120);
        assert_eq!(view.get_u32(argv + 40).unwrap(), 0);
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        let driver = driver_with_memory(64 * 1024);
        let args = vec!["x".repeat(9000)];
        let env = BTreeMap::new();
        assert_eq!(
            driver.store_arguments(&args, &env),
            Err(Error::Argument(ARGS_TOO_LARGE))
        );
    }

    #[test]
    fn run_without_module_fails() {
        let driver = Driver::new();
        let err = driver.run(&[], &BTreeMap::new()).unwrap_err();
        assert_eq!(err, Error::State(MODULE_NOT_LOADED));
    }

    #[test]
    fn resume_after_exit_fails() {
        let driver = Driver::new();
        driver.exit(0);
        assert_eq!(driver.resume(), Err(Error::State(ALREADY_EXITED)));
    }
}
