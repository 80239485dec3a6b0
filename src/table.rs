use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, UNKNOWN_REF};
use crate::mem::DataView;
use crate::value::{Value, ValueKey};

/// High 32 bits of an id-carrying slot; the low 5 type-flag bits are OR'd in.
pub const NAN_HEAD: u32 = 0x7FF8_0000;

/// Ref-count marker for the seeded ids; never incremented, never collected.
const PINNED: u32 = u32::MAX;

/// Host-side registry of values the guest references by id; seeded ids 0..=6
/// are pinned, everything else is ref-counted and recycled.
pub struct ValueTable {
    values: Vec<Value>,
    ref_counts: Vec<u32>,
    ids: HashMap<ValueKey, u32>,
    id_pool: Vec<u32>,
}

impl ValueTable {
    /// An empty table; every lookup fails until seeding.
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            ref_counts: Vec::new(),
            ids: HashMap::new(),
            id_pool: Vec::new(),
        }
    }

    /// Install the fixed-id seed values for one instance run.
    pub fn seeded(global: Value, embedder: Value) -> Self {
        let mut table = Self::new();
        let seeds = [
            Value::Number(f64::NAN),
            Value::Number(0.0),
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            global,
            embedder,
        ];
        for (id, value) in seeds.into_iter().enumerate() {
            // NaN is found by the store fast path, never by key lookup.
            if id != 0 {
                if let Some(key) = value.key() {
                    table.ids.insert(key, id as u32);
                }
            }
            table.values.push(value);
            table.ref_counts.push(PINNED);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Value> {
        self.values.get(id as usize)
    }

    /// Whether `id` is currently handed out (seeded or ref-count above zero).
    pub fn is_live(&self, id: u32) -> bool {
        self.ref_counts
            .get(id as usize)
            .map(|&c| c > 0)
            .unwrap_or(false)
    }

    /// Drop every entry on guest exit; later dereferences fail.
    pub fn clear(&mut self) {
        self.values.clear();
        self.ref_counts.clear();
        self.ids.clear();
        self.id_pool.clear();
    }

    /// NaN-box `value` into the 8-byte slot at `addr`.
    pub fn store_value(&mut self, view: &DataView, addr: u32, value: &Value) -> Result<(), Error> {
        if let Value::Number(n) = value {
            if n.is_nan() {
                view.set_u32(addr + 4, NAN_HEAD)?;
                view.set_u32(addr, 0)?;
                return Ok(());
            }
            if *n != 0.0 {
                return view.set_f64(addr, *n);
            }
        }
        if let Value::Undefined = value {
            return view.set_f64(addr, 0.0);
        }

        let key = value.key().expect("non-undefined value always has a key");
        let id = match self.ids.get(&key) {
            Some(&id) => id,
            None => {
                let id = match self.id_pool.pop() {
                    Some(id) => id,
                    None => {
                        self.values.push(Value::Undefined);
                        self.ref_counts.push(0);
                        (self.values.len() - 1) as u32
                    }
                };
                self.values[id as usize] = value.clone();
                self.ref_counts[id as usize] = 0;
                self.ids.insert(key, id);
                id
            }
        };
        if self.ref_counts[id as usize] != PINNED {
            self.ref_counts[id as usize] += 1;
        }
        view.set_u32(addr + 4, NAN_HEAD | value.type_flag())?;
        view.set_u32(addr, id)
    }

    /// Decode the 8-byte slot at `addr` back into a value.
    pub fn load_value(&self, view: &DataView, addr: u32) -> Result<Value, Error> {
        let f = view.get_f64(addr)?;
        if f == 0.0 {
            return Ok(Value::Undefined);
        }
        if !f.is_nan() {
            return Ok(Value::Number(f));
        }
        let id = view.get_u32(addr)?;
        self.values
            .get(id as usize)
            .cloned()
            .ok_or(Error::State(UNKNOWN_REF))
    }

    /// Release one guest reference to `id`; seeded and already-dead ids are
    /// left alone.
    pub fn remove_ref(&mut self, id: u32) {
        let idx = id as usize;
        let Some(count) = self.ref_counts.get_mut(idx) else {
            return;
        };
        if *count == PINNED || *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            let value = std::mem::replace(&mut self.values[idx], Value::Undefined);
            if let Some(key) = value.key() {
                self.ids.remove(&key);
            }
            self.id_pool.push(id);
            debug!(target: "gobi::table", id, "reference id recycled");
        }
    }
}

impl Default for ValueTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::new_buffer;
    use crate::value::{ctor, Class, Object};
    use std::rc::Rc;

    fn seeded() -> ValueTable {
        ValueTable::seeded(
            Value::Object(Object::new("Object")),
            Value::Object(Object::new("Object")),
        )
    }

    fn view() -> DataView {
        DataView::new(new_buffer(256))
    }

    #[test]
    fn undefined_stores_eight_zero_bytes() {
        let mut t = seeded();
        let v = view();
        t.store_value(&v, 0, &Value::Undefined).unwrap();
        assert_eq!(v.read_bytes(0, 8).unwrap(), [0; 8]);
        assert!(matches!(t.load_value(&v, 0).unwrap(), Value::Undefined));
    }

    #[test]
    fn nan_stores_the_bare_head() {
        let mut t = seeded();
        let v = view();
        t.store_value(&v, 0, &Value::Number(f64::NAN)).unwrap();
        assert_eq!(v.get_u32(0).unwrap(), 0);
        assert_eq!(v.get_u32(4).unwrap(), 0x7FF8_0000);
        let back = t.load_value(&v, 0).unwrap();
        assert!(matches!(back, Value::Number(n) if n.is_nan()));
    }

    #[test]
    fn numbers_store_verbatim() {
        let mut t = seeded();
        let v = view();
        for n in [1.0, -2.5, 1e300, f64::MIN_POSITIVE] {
            t.store_value(&v, 8, &Value::Number(n)).unwrap();
            assert_eq!(v.get_f64(8).unwrap(), n);
            assert!(matches!(t.load_value(&v, 8).unwrap(), Value::Number(m) if m == n));
        }
    }

    #[test]
    fn fresh_object_gets_the_next_id_with_object_flag() {
        let mut t = seeded();
        let v = view();
        t.store_value(&v, 0, &Value::Object(Object::new("Object")))
            .unwrap();
        assert_eq!(v.get_u32(0).unwrap(), 7);
        assert_eq!(v.get_u32(4).unwrap(), 0x7FF8_0001);
    }

    #[test]
    fn round_trip_preserves_identity() {
        let mut t = seeded();
        let v = view();
        let obj = Value::Object(Object::new("Object"));
        t.store_value(&v, 0, &obj).unwrap();
        let back = t.load_value(&v, 0).unwrap();
        assert_eq!(back.key(), obj.key());

        let s = Value::String(Rc::from("hi"));
        t.store_value(&v, 8, &s).unwrap();
        assert_eq!(v.get_u32(12).unwrap(), 0x7FF8_0002);
        assert_eq!(t.load_value(&v, 8).unwrap().key(), s.key());

        let f = ctor("Object", Class::Object);
        t.store_value(&v, 16, &f).unwrap();
        assert_eq!(v.get_u32(20).unwrap(), 0x7FF8_0004);
        assert_eq!(t.load_value(&v, 16).unwrap().key(), f.key());
    }

    #[test]
    fn zero_and_primitives_hit_their_seeded_ids() {
        let mut t = seeded();
        let v = view();
        t.store_value(&v, 0, &Value::Number(0.0)).unwrap();
        assert_eq!(v.get_u32(0).unwrap(), 1);
        t.store_value(&v, 0, &Value::Null).unwrap();
        assert_eq!(v.get_u32(0).unwrap(), 2);
        t.store_value(&v, 0, &Value::Bool(true)).unwrap();
        assert_eq!(v.get_u32(0).unwrap(), 3);
        t.store_value(&v, 0, &Value::Bool(false)).unwrap();
        assert_eq!(v.get_u32(0).unwrap(), 4);
    }

    #[test]
    fn ref_count_recycles_ids() {
        let mut t = seeded();
        let v = view();
        let obj = Value::Object(Object::new("Object"));
        t.store_value(&v, 0, &obj).unwrap();
        t.store_value(&v, 0, &obj).unwrap();
        let id = v.get_u32(0).unwrap();
        assert!(t.is_live(id));

        t.remove_ref(id);
        assert!(t.is_live(id));
        t.remove_ref(id);
        assert!(!t.is_live(id));
        assert!(matches!(t.get(id), Some(Value::Undefined)));

        // The freed id is reused for the next fresh value.
        let other = Value::Object(Object::new("Object"));
        t.store_value(&v, 8, &other).unwrap();
        assert_eq!(v.get_u32(8).unwrap(), id);
    }

    #[test]
    fn distinct_identity_distinct_id() {
        let mut t = seeded();
        let v = view();
        t.store_value(&v, 0, &Value::String(Rc::from("x"))).unwrap();
        let a = v.get_u32(0).unwrap();
        t.store_value(&v, 0, &Value::String(Rc::from("x"))).unwrap();
        let b = v.get_u32(0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn seeded_ids_survive_finalize() {
        let mut t = seeded();
        for id in 0..=6 {
            t.remove_ref(id);
            t.remove_ref(id);
            assert!(t.is_live(id), "seeded id {id} must stay live");
        }
        assert!(matches!(t.get(2), Some(Value::Null)));
        assert!(matches!(t.get(3), Some(Value::Bool(true))));
    }

    #[test]
    fn cleared_table_rejects_loads() {
        let mut t = seeded();
        let v = view();
        t.store_value(&v, 0, &Value::Null).unwrap();
        t.clear();
        assert!(matches!(
            t.load_value(&v, 0),
            Err(Error::State(UNKNOWN_REF))
        ));
    }
}
