use std::time::Instant;

use gobi::mem::{new_buffer, DataView};
use gobi::table::ValueTable;
use gobi::value::{Object, Value};

fn main() {
    const ROUNDS: u32 = 1_000_000;

    let view = DataView::new(new_buffer(4096));
    let mut table = ValueTable::seeded(
        Value::Object(Object::new("Object")),
        Value::Object(Object::new("Object")),
    );

    // Numbers take the NaN-box fast path and never touch the table.
    let start = Instant::now();
    for i in 0..ROUNDS {
        table
            .store_value(&view, 0, &Value::Number(f64::from(i) + 0.5))
            .unwrap();
        let _ = table.load_value(&view, 0).unwrap();
    }
    let numbers = start.elapsed();

    // Objects allocate an id, then release it, exercising the free-list.
    let start = Instant::now();
    for _ in 0..ROUNDS {
        let obj = Value::Object(Object::new("Object"));
        table.store_value(&view, 8, &obj).unwrap();
        let id = view.get_u32(8).unwrap();
        table.remove_ref(id);
    }
    let objects = start.elapsed();

    let per = |d: std::time::Duration| d.as_nanos() as f64 / f64::from(ROUNDS);
    println!("number round-trip: {:.1} ns/op", per(numbers));
    println!("object store+release: {:.1} ns/op", per(objects));
    println!("table len after churn: {}", table.len());
}
