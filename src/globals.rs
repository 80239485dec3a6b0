use std::rc::Rc;

use crate::driver::WeakDriver;
use crate::fs::SysFs;
use crate::value::{
    ctor, enosys, native, reflect_apply, type_error, Class, Object, Value,
};

/// File-system entry points that only ever report the not-implemented
/// sentinel through their completion callback.
const FS_STUBS: &[&str] = &[
    "chmod", "chown", "close", "fchmod", "fchown", "fstat", "ftruncate", "lchown", "link",
    "lstat", "mkdir", "open", "read", "readdir", "readlink", "rename", "rmdir", "stat",
    "symlink", "truncate", "unlink", "utimes",
];

/// Build the seeded global object: constructors, `Math`, `fs`, `process`,
/// `console`. Each driver owns its own copy.
pub fn build_global(fs: &Rc<SysFs>) -> Value {
    let global = Object::new("Object");
    {
        let mut props = global.props.borrow_mut();
        props.insert("Object".to_string(), ctor("Object", Class::Object));
        props.insert("Array".to_string(), ctor("Array", Class::Array));
        props.insert(
            "Uint8Array".to_string(),
            ctor("Uint8Array", Class::Uint8Array),
        );
        props.insert("Math".to_string(), build_math());
        props.insert("fs".to_string(), build_fs(fs));
        props.insert("process".to_string(), build_process());
        props.insert("console".to_string(), build_console(fs));
    }
    Value::Object(global)
}

/// Build the embedder handle (seeded id 6): the pending-event slot and the
/// func-wrapper factory.
pub fn build_embedder(driver: WeakDriver) -> Value {
    Value::Object(Object::with_props(
        "Object",
        [
            ("_pendingEvent", Value::Null),
            (
                "_makeFuncWrapper",
                native("_makeFuncWrapper", move |_, args| {
                    let id = args.first().map(Value::as_f64).unwrap_or(f64::NAN);
                    if !id.is_finite() || id < 0.0 {
                        return Err(type_error("callback id must be a non-negative number"));
                    }
                    Ok(crate::driver::make_func_wrapper(driver.clone(), id as u32))
                }),
            ),
        ],
    ))
}

fn build_math() -> Value {
    fn arg(args: &[Value], i: usize) -> f64 {
        args.get(i).map(Value::as_f64).unwrap_or(f64::NAN)
    }
    Value::Object(Object::with_props(
        "Object",
        [
            ("abs", native("abs", |_, a| Ok(Value::Number(arg(a, 0).abs())))),
            (
                "floor",
                native("floor", |_, a| Ok(Value::Number(arg(a, 0).floor()))),
            ),
            (
                "ceil",
                native("ceil", |_, a| Ok(Value::Number(arg(a, 0).ceil()))),
            ),
            (
                "min",
                native("min", |_, a| Ok(Value::Number(arg(a, 0).min(arg(a, 1))))),
            ),
            (
                "max",
                native("max", |_, a| Ok(Value::Number(arg(a, 0).max(arg(a, 1))))),
            ),
        ],
    ))
}

fn build_fs(fs: &Rc<SysFs>) -> Value {
    let obj = Object::new("Object");
    let mut props = obj.props.borrow_mut();

    props.insert("constants".to_string(), build_fs_constants());

    let sink = fs.clone();
    props.insert(
        "writeSync".to_string(),
        native("writeSync", move |_, args| {
            let Some(Value::Bytes(buf)) = args.get(1) else {
                return Err(type_error("writeSync expects a byte buffer"));
            };
            let n = sink.write(&buf.borrow());
            Ok(Value::Number(n as f64))
        }),
    );

    let sink = fs.clone();
    props.insert(
        "write".to_string(),
        native("write", move |_, args| {
            let Some(Value::Bytes(buf)) = args.get(1) else {
                return Err(type_error("write expects a byte buffer"));
            };
            let Some(callback @ Value::Func(_)) = args.get(5) else {
                return Err(type_error("write expects a completion callback"));
            };
            let len = buf.borrow().len() as f64;
            let trivial = args.get(2).map(Value::as_f64) == Some(0.0)
                && args.get(3).map(Value::as_f64) == Some(len)
                && matches!(args.get(4), Some(Value::Null));
            if !trivial {
                // Only the append-to-console form is implemented.
                reflect_apply(callback, &Value::Undefined, &[enosys()])?;
                return Ok(Value::Undefined);
            }
            let n = sink.write(&buf.borrow());
            reflect_apply(
                callback,
                &Value::Undefined,
                &[Value::Null, Value::Number(n as f64)],
            )?;
            Ok(Value::Undefined)
        }),
    );

    props.insert(
        "fsync".to_string(),
        native("fsync", |_, args| {
            if let Some(callback @ Value::Func(_)) = args.get(1) {
                reflect_apply(callback, &Value::Undefined, &[Value::Null])?;
            }
            Ok(Value::Undefined)
        }),
    );

    for name in FS_STUBS {
        props.insert(name.to_string(), not_implemented(name));
    }

    drop(props);
    Value::Object(obj)
}

fn build_fs_constants() -> Value {
    let flags = [
        "O_WRONLY",
        "O_RDWR",
        "O_CREAT",
        "O_TRUNC",
        "O_APPEND",
        "O_EXCL",
        "O_DIRECTORY",
    ];
    Value::Object(Object::with_props(
        "Object",
        flags.into_iter().map(|f| (f, Value::Number(-1.0))),
    ))
}

/// A stub that reports `ENOSYS` through the trailing callback, or throws the
/// sentinel when invoked without one.
fn not_implemented(name: &'static str) -> Value {
    native(name, |_, args| {
        match args.iter().rev().find(|a| matches!(a, Value::Func(_))) {
            Some(callback) => {
                reflect_apply(callback, &Value::Undefined, &[enosys()])?;
                Ok(Value::Undefined)
            }
            None => Err(enosys()),
        }
    })
}

fn build_process() -> Value {
    let identity = |name: &'static str| native(name, |_, _| Ok(Value::Number(-1.0)));
    let sentinel = |name: &'static str| native(name, |_, _| Err(enosys()));
    Value::Object(Object::with_props(
        "Object",
        [
            ("pid", Value::Number(-1.0)),
            ("ppid", Value::Number(-1.0)),
            ("getuid", identity("getuid")),
            ("getgid", identity("getgid")),
            ("geteuid", identity("geteuid")),
            ("getegid", identity("getegid")),
            ("getgroups", sentinel("getgroups")),
            ("umask", sentinel("umask")),
            ("cwd", sentinel("cwd")),
            ("chdir", sentinel("chdir")),
        ],
    ))
}

fn build_console(fs: &Rc<SysFs>) -> Value {
    let joined = |args: &[Value]| {
        args.iter()
            .map(Value::to_display_string)
            .collect::<Vec<_>>()
            .join(" ")
    };
    let sink = fs.clone();
    let log = native("log", move |_, args| {
        sink.emit_line(&joined(args));
        Ok(Value::Undefined)
    });
    let sink = fs.clone();
    let error = native("error", move |_, args| {
        sink.emit_line(&joined(args));
        Ok(Value::Undefined)
    });
    Value::Object(Object::with_props("Object", [("log", log), ("error", error)]))
}
