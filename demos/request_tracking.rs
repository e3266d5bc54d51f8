//! Example: tracking every asynchronous side effect of a request workflow
//!
//! This example builds a small fake "request" object graph, instruments it
//! with an `InstrumentationSession`, runs application code against it, and
//! waits for the single completion signal.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use settlekit::prelude::*;

fn main() {
    println!("🧰 settlekit - Request Tracking Example\n");

    example_callback_shape();
    example_all_shapes();

    println!("\n✅ All request tracking examples completed!");
}

/// One tracked callback: schedule, fire, settle.
fn example_callback_shape() {
    println!("📌 Example 1: Callback Shape");
    println!("   One schedule call, one completion, one signal\n");

    let target = Target::new();
    let timers: Arc<Mutex<HashMap<u64, Callback>>> = Arc::default();

    let stored = Arc::clone(&timers);
    target.define_function("set_timeout", move |args| {
        let callback = args.first().and_then(Value::as_callback).unwrap();
        stored.lock().insert(1, callback);
        Value::Handle(1)
    });

    let (tx, rx) = mpsc::channel();
    let session = InstrumentationSession::with_callback(
        target.clone(),
        Duration::from_secs(1),
        move |error| tx.send(error).unwrap(),
    );
    session.track_callback("set_timeout").unwrap();

    // Application code schedules work...
    target
        .call("set_timeout", &[Value::callback(|_args| Value::Unit)])
        .unwrap();
    println!("   Outstanding operations: {}", session.ledger().outstanding_count());

    // ...and the scheduler fires the stored callback later.
    let callback = timers.lock().remove(&1).unwrap();
    (*callback)(&[]);

    println!("   Session outcome: {:?}", rx.recv().unwrap());
    println!("   ⚡ Settled without polling or hand-written chaining!\n");
}

/// A request workflow exercising callbacks, properties, and a deferred
/// response in one session.
fn example_all_shapes() {
    println!("📌 Example 2: Mixed Shapes");
    println!("   Timer + on-event property + deferred response\n");

    let target = Target::new();
    let timers: Arc<Mutex<Vec<(Value, Callback)>>> = Arc::default();

    let stored = Arc::clone(&timers);
    target.define_function("set_timeout", move |args| {
        let callback = args.first().and_then(Value::as_callback).unwrap();
        let handle = Value::Handle(stored.lock().len() as u64 + 1);
        stored.lock().push((handle.clone(), callback));
        handle
    });

    let response_class = target.define_deferred_class("Response");
    let request_class = target.define_class("Request");

    let (tx, rx) = mpsc::channel();
    let session = InstrumentationSession::with_callback(
        target.clone(),
        Duration::from_secs(1),
        move |error| tx.send(error).unwrap(),
    );
    session.track_callback("set_timeout").unwrap();
    session.track_deferred("Response").unwrap();
    session.track_property("Request", "on_complete").unwrap();

    // The application wires up three different asynchronous shapes.
    target
        .call("set_timeout", &[Value::callback(|_args| Value::Unit)])
        .unwrap();

    let request = request_class.instantiate();
    request.set("on_complete", Value::callback(|_args| Value::Unit));

    let response = response_class.pending();
    response.then(Some(Arc::new(|_args: &[Value]| Value::Unit)), None);

    println!("   Outstanding operations: {}", session.ledger().outstanding_count());

    // Completions arrive in arbitrary order.
    response.resolve(Value::from("ok"));
    request.invoke("on_complete", &[]);
    let (_, callback) = timers.lock().pop().unwrap();
    (*callback)(&[]);

    println!("   Session outcome: {:?}", rx.recv().unwrap());
    println!("   ✓ One signal covered all three shapes!");
}
