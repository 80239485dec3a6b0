use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::driver::WeakDriver;

// ---------------- Values ----------------

/// A host-world value the guest can hold through a reference id; reference
/// variants compare by identity, primitives by value.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Bytes(Rc<RefCell<Vec<u8>>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<Object>),
    Func(Rc<Func>),
}

pub struct Object {
    /// Class tag used by `instanceof` and string coercion ("Object", "Error").
    pub class: &'static str,
    pub props: RefCell<HashMap<String, Value>>,
}

impl Object {
    pub fn new(class: &'static str) -> Rc<Self> {
        Rc::new(Self {
            class,
            props: RefCell::new(HashMap::new()),
        })
    }

    pub fn with_props(
        class: &'static str,
        props: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> Rc<Self> {
        let map = props
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Rc::new(Self {
            class,
            props: RefCell::new(map),
        })
    }
}

pub struct Func {
    pub name: &'static str,
    pub kind: FuncKind,
}

pub type NativeFn = Box<dyn Fn(&Value, &[Value]) -> Result<Value, Value>>;

pub enum FuncKind {
    /// Host-implemented function; `Err` is a thrown value.
    Native(NativeFn),
    /// Constructor reachable through `valueNew`/`valueInstanceOf`.
    Ctor(Class),
    /// Proxy for a guest-registered callable; invocation stages a pending
    /// event and resumes the guest.
    Wrapper { id: u32, driver: WeakDriver },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Class {
    Object,
    Array,
    Uint8Array,
}

pub fn native(name: &'static str, f: impl Fn(&Value, &[Value]) -> Result<Value, Value> + 'static) -> Value {
    Value::Func(Rc::new(Func {
        name,
        kind: FuncKind::Native(Box::new(f)),
    }))
}

pub fn ctor(name: &'static str, class: Class) -> Value {
    Value::Func(Rc::new(Func {
        name,
        kind: FuncKind::Ctor(class),
    }))
}

// ---------------- Identity ----------------

/// Inverse-map key: identity for reference variants, value for primitives.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ValueKey {
    Null,
    Bool(bool),
    Number(u64),
    Ref(usize),
}

impl Value {
    /// Key under which this value is deduplicated in the reference table.
    /// `Undefined` never reaches the table and has no key.
    pub fn key(&self) -> Option<ValueKey> {
        match self {
            Value::Undefined => None,
            Value::Null => Some(ValueKey::Null),
            Value::Bool(b) => Some(ValueKey::Bool(*b)),
            // Negative zero shares the id of positive zero.
            Value::Number(n) => Some(ValueKey::Number(if *n == 0.0 { 0 } else { n.to_bits() })),
            Value::String(s) => Some(ValueKey::Ref(Rc::as_ptr(s) as *const u8 as usize)),
            Value::Bytes(b) => Some(ValueKey::Ref(Rc::as_ptr(b) as usize)),
            Value::Array(a) => Some(ValueKey::Ref(Rc::as_ptr(a) as usize)),
            Value::Object(o) => Some(ValueKey::Ref(Rc::as_ptr(o) as usize)),
            Value::Func(f) => Some(ValueKey::Ref(Rc::as_ptr(f) as usize)),
        }
    }

    /// Type flag carried in the NaN-box head: object=1, string=2, symbol=3,
    /// function=4; primitives carry 0.
    pub fn type_flag(&self) -> u32 {
        match self {
            Value::Bytes(_) | Value::Array(_) | Value::Object(_) => 1,
            Value::String(_) => 2,
            Value::Func(_) => 4,
            _ => 0,
        }
    }

    /// Numeric coercion used by native functions.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Null => 0.0,
            _ => f64::NAN,
        }
    }

    /// Element/character count reported through `valueLength`.
    pub fn length(&self) -> u64 {
        match self {
            Value::Array(a) => a.borrow().len() as u64,
            Value::Bytes(b) => b.borrow().len() as u64,
            Value::String(s) => s.encode_utf16().count() as u64,
            _ => 0,
        }
    }

    /// String coercion used by `valuePrepareString` and console output.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Bytes(b) => {
                let b = b.borrow();
                b.iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Array(a) => {
                let a = a.borrow();
                a.iter()
                    .map(|v| match v {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.to_display_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(o) => {
                if o.class == "Error" {
                    let msg = o
                        .props
                        .borrow()
                        .get("message")
                        .map(|m| m.to_display_string())
                        .unwrap_or_default();
                    if msg.is_empty() {
                        "Error".to_string()
                    } else {
                        format!("Error: {msg}")
                    }
                } else {
                    "[object Object]".to_string()
                }
            }
            Value::Func(f) => format!("function {}() {{ [native code] }}", f.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "Uint8Array({})", b.borrow().len()),
            Value::Array(a) => write!(f, "Array({})", a.borrow().len()),
            Value::Object(o) => write!(f, "[object {}]", o.class),
            Value::Func(func) => write!(f, "function {}", func.name),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == n.trunc() && n.abs() < 9.007_199_254_740_992e15 {
        return format!("{}", n as i64);
    }
    format!("{n}")
}

// ---------------- Thrown values ----------------

/// Error object carrying `message` (and optionally `code`); thrown values
/// travel as `Err(Value)` through the reflection facade.
pub fn error_value(message: &str) -> Value {
    Value::Object(Object::with_props(
        "Error",
        [("message", Value::String(message.into()))],
    ))
}

pub fn type_error(message: &str) -> Value {
    error_value(message)
}

/// The not-implemented sentinel: an error whose `code` property is "ENOSYS".
pub fn enosys() -> Value {
    Value::Object(Object::with_props(
        "Error",
        [
            ("message", Value::String("not implemented".into())),
            ("code", Value::String("ENOSYS".into())),
        ],
    ))
}

// ---------------- Reflection ----------------

pub fn reflect_get(target: &Value, key: &str) -> Result<Value, Value> {
    match target {
        Value::Undefined | Value::Null => Err(type_error(&format!(
            "cannot read property '{key}' of {}",
            target.to_display_string()
        ))),
        Value::Object(o) => Ok(o.props.borrow().get(key).cloned().unwrap_or(Value::Undefined)),
        Value::Array(_) | Value::Bytes(_) | Value::String(_) if key == "length" => {
            Ok(Value::Number(target.length() as f64))
        }
        Value::Bytes(b) if key == "byteLength" => Ok(Value::Number(b.borrow().len() as f64)),
        _ => Ok(Value::Undefined),
    }
}

pub fn reflect_set(target: &Value, key: &str, value: Value) -> Result<(), Value> {
    match target {
        Value::Undefined | Value::Null => Err(type_error(&format!(
            "cannot set property '{key}' of {}",
            target.to_display_string()
        ))),
        Value::Object(o) => {
            o.props.borrow_mut().insert(key.to_string(), value);
            Ok(())
        }
        _ => Err(type_error(&format!(
            "cannot set property '{key}' on this value"
        ))),
    }
}

pub fn reflect_delete(target: &Value, key: &str) -> Result<(), Value> {
    match target {
        Value::Undefined | Value::Null => Err(type_error(&format!(
            "cannot delete property '{key}' of {}",
            target.to_display_string()
        ))),
        Value::Object(o) => {
            o.props.borrow_mut().remove(key);
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn reflect_index(target: &Value, index: i64) -> Result<Value, Value> {
    match target {
        Value::Undefined | Value::Null => Err(type_error("cannot index this value")),
        Value::Array(a) => Ok(usize::try_from(index)
            .ok()
            .and_then(|i| a.borrow().get(i).cloned())
            .unwrap_or(Value::Undefined)),
        Value::Bytes(b) => Ok(usize::try_from(index)
            .ok()
            .and_then(|i| b.borrow().get(i).copied())
            .map(|byte| Value::Number(f64::from(byte)))
            .unwrap_or(Value::Undefined)),
        _ => Ok(Value::Undefined),
    }
}

pub fn reflect_set_index(target: &Value, index: i64, value: Value) -> Result<(), Value> {
    match target {
        Value::Undefined | Value::Null => Err(type_error("cannot index this value")),
        Value::Array(a) => {
            let i = usize::try_from(index).map_err(|_| type_error("negative array index"))?;
            let mut a = a.borrow_mut();
            if i >= a.len() {
                a.resize(i + 1, Value::Undefined);
            }
            a[i] = value;
            Ok(())
        }
        Value::Bytes(b) => {
            // Out-of-range typed-array writes are silently dropped.
            if let Ok(i) = usize::try_from(index) {
                let mut b = b.borrow_mut();
                if i < b.len() {
                    b[i] = to_byte(&value);
                }
            }
            Ok(())
        }
        _ => Err(type_error("cannot index this value")),
    }
}

pub fn reflect_apply(func: &Value, this: &Value, args: &[Value]) -> Result<Value, Value> {
    let Value::Func(f) = func else {
        return Err(type_error(&format!(
            "{} is not a function",
            func.to_display_string()
        )));
    };
    match &f.kind {
        FuncKind::Native(body) => body(this, args),
        FuncKind::Ctor(_) => Err(type_error(&format!(
            "constructor {} requires 'new'",
            f.name
        ))),
        FuncKind::Wrapper { id, driver } => crate::driver::invoke_wrapper(driver, *id, this, args),
    }
}

pub fn reflect_construct(func: &Value, args: &[Value]) -> Result<Value, Value> {
    let Value::Func(f) = func else {
        return Err(type_error(&format!(
            "{} is not a constructor",
            func.to_display_string()
        )));
    };
    let FuncKind::Ctor(class) = &f.kind else {
        return Err(type_error(&format!("{} is not a constructor", f.name)));
    };
    match class {
        Class::Object => Ok(Value::Object(Object::new("Object"))),
        Class::Array => match args {
            [Value::Number(n)] => {
                let len = usize::try_from(*n as i64)
                    .map_err(|_| type_error("invalid array length"))?;
                Ok(Value::Array(Rc::new(RefCell::new(vec![
                    Value::Undefined;
                    len
                ]))))
            }
            _ => Ok(Value::Array(Rc::new(RefCell::new(args.to_vec())))),
        },
        Class::Uint8Array => {
            let len = match args {
                [] => 0,
                [Value::Number(n)] => usize::try_from(*n as i64)
                    .map_err(|_| type_error("invalid typed array length"))?,
                _ => return Err(type_error("unsupported Uint8Array constructor arguments")),
            };
            Ok(Value::Bytes(Rc::new(RefCell::new(vec![0; len]))))
        }
    }
}

/// `value instanceof ctor`. A non-constructor right-hand side never matches.
pub fn instance_of(value: &Value, ctor: &Value) -> bool {
    let Value::Func(f) = ctor else {
        return false;
    };
    let FuncKind::Ctor(class) = &f.kind else {
        return false;
    };
    match class {
        Class::Object => matches!(
            value,
            Value::Object(_) | Value::Array(_) | Value::Bytes(_) | Value::Func(_)
        ),
        Class::Array => matches!(value, Value::Array(_)),
        Class::Uint8Array => matches!(value, Value::Bytes(_)),
    }
}

fn to_byte(value: &Value) -> u8 {
    let n = value.as_f64();
    if !n.is_finite() {
        return 0;
    }
    (n as i64 & 0xFF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_variants_compare_by_identity() {
        let a = Value::String(Rc::from("hello"));
        let b = Value::String(Rc::from("hello"));
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a.clone().key());

        let o = Value::Object(Object::new("Object"));
        assert_eq!(o.key(), o.clone().key());
    }

    #[test]
    fn primitives_compare_by_value() {
        assert_eq!(Value::Bool(true).key(), Value::Bool(true).key());
        assert_eq!(Value::Null.key(), Value::Null.key());
        assert_eq!(Value::Number(0.0).key(), Value::Number(-0.0).key());
        assert_ne!(Value::Number(1.0).key(), Value::Number(2.0).key());
    }

    #[test]
    fn property_access_round_trips() {
        let obj = Value::Object(Object::new("Object"));
        reflect_set(&obj, "answer", Value::Number(42.0)).unwrap();
        let got = reflect_get(&obj, "answer").unwrap();
        assert_eq!(got.as_f64(), 42.0);

        reflect_delete(&obj, "answer").unwrap();
        assert!(matches!(
            reflect_get(&obj, "answer").unwrap(),
            Value::Undefined
        ));
    }

    #[test]
    fn get_on_undefined_throws() {
        let err = reflect_get(&Value::Undefined, "x").unwrap_err();
        assert!(matches!(err, Value::Object(_)));
    }

    #[test]
    fn indexing_arrays_and_bytes() {
        let arr = Value::Array(Rc::new(RefCell::new(vec![Value::Number(1.0)])));
        assert_eq!(reflect_index(&arr, 0).unwrap().as_f64(), 1.0);
        assert!(matches!(reflect_index(&arr, 5).unwrap(), Value::Undefined));

        reflect_set_index(&arr, 2, Value::Number(3.0)).unwrap();
        assert_eq!(arr.length(), 3);

        let bytes = Value::Bytes(Rc::new(RefCell::new(vec![9, 8, 7])));
        assert_eq!(reflect_index(&bytes, 1).unwrap().as_f64(), 8.0);
        reflect_set_index(&bytes, 0, Value::Number(255.0)).unwrap();
        reflect_set_index(&bytes, 9, Value::Number(1.0)).unwrap();
        assert_eq!(reflect_index(&bytes, 0).unwrap().as_f64(), 255.0);
    }

    #[test]
    fn native_functions_apply() {
        let double = native("double", |_, args| {
            Ok(Value::Number(args.first().map(Value::as_f64).unwrap_or(f64::NAN) * 2.0))
        });
        let out = reflect_apply(&double, &Value::Undefined, &[Value::Number(21.0)]).unwrap();
        assert_eq!(out.as_f64(), 42.0);

        assert!(reflect_apply(&Value::Null, &Value::Undefined, &[]).is_err());
    }

    #[test]
    fn constructors_build_expected_shapes() {
        let u8ctor = ctor("Uint8Array", Class::Uint8Array);
        let arr = reflect_construct(&u8ctor, &[Value::Number(4.0)]).unwrap();
        assert!(matches!(&arr, Value::Bytes(b) if b.borrow().len() == 4));
        assert!(instance_of(&arr, &u8ctor));
        assert!(instance_of(&arr, &ctor("Object", Class::Object)));
        assert!(!instance_of(&arr, &ctor("Array", Class::Array)));
    }

    #[test]
    fn string_coercion_matches_host_conventions() {
        assert_eq!(Value::Undefined.to_display_string(), "undefined");
        assert_eq!(Value::Number(3.0).to_display_string(), "3");
        assert_eq!(Value::Number(1.5).to_display_string(), "1.5");
        assert_eq!(Value::Number(f64::NAN).to_display_string(), "NaN");
        assert_eq!(
            Value::Bytes(Rc::new(RefCell::new(vec![1, 2]))).to_display_string(),
            "1,2"
        );
        assert_eq!(
            Value::Object(Object::new("Object")).to_display_string(),
            "[object Object]"
        );
        assert_eq!(
            enosys().to_display_string(),
            "Error: not implemented"
        );
    }

    #[test]
    fn enosys_carries_the_sentinel_code() {
        let err = enosys();
        let code = reflect_get(&err, "code").unwrap();
        assert_eq!(code.to_display_string(), "ENOSYS");
    }
}
