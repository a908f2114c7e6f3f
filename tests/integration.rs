//! Integration tests exercising transaction behaviour through the public
//! surface.

use std::sync::{Arc, Mutex};
use std::thread;

use covalent::{Cell, Error, Stream, StreamSink};

/// Observe every firing of a stream. The listener is strong, so the
/// registration outlives the returned handle.
fn record<A: Clone + Send + Sync + 'static>(stream: &Stream<A>) -> Arc<Mutex<Vec<A>>> {
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    stream.listen(move |a| sink.lock().unwrap().push(a));
    values
}

#[test]
fn simultaneous_merge() {
    let a = StreamSink::new();
    let b = StreamSink::new();
    let m = a.stream().merge(&b.stream(), |l, r| l + r);
    let observed = record(&m);

    covalent::run(|| {
        a.send(2).unwrap();
        b.send(3).unwrap();
    })
    .unwrap();
    assert_eq!(*observed.lock().unwrap(), vec![5]);

    a.send(2).unwrap();
    b.send(3).unwrap();
    assert_eq!(*observed.lock().unwrap(), vec![5, 2, 3]);
}

#[test]
fn snapshot_sees_values_with_one_transaction_delay() {
    let s = StreamSink::new();
    let c = s.stream().hold(0);
    let out = s.stream().snapshot(&c, |_, v| v);
    let observed = record(&out);

    s.send(10).unwrap();
    s.send(20).unwrap();
    assert_eq!(*observed.lock().unwrap(), vec![0, 10]);
}

#[test]
fn accum_exposes_pre_transaction_state() {
    let deltas = StreamSink::new();
    let sum = deltas.stream().accum(0, |a, d| a + d);

    let mut sampled_during = Vec::new();
    for d in [1, 2, 3] {
        let deltas = deltas.clone();
        let sum = sum.clone();
        sampled_during.push(
            covalent::run(move || {
                deltas.send(d).unwrap();
                sum.sample()
            })
            .unwrap(),
        );
    }
    assert_eq!(sampled_during, vec![0, 1, 3]);
    assert_eq!(sum.sample(), 6);
}

#[test]
fn diamond_propagation_is_glitch_free() {
    // Two paths of different length from the same source must be combined
    // exactly once, with both paths fully up to date.
    let a = StreamSink::new();
    let long_path = a.stream().map(|x| x + 1);
    let m = long_path.merge(&a.stream(), |l, r| l * 10 + r);
    let observed = record(&m);

    a.send(1).unwrap();
    assert_eq!(*observed.lock().unwrap(), vec![21]);
}

#[test]
fn listener_attached_after_send_in_the_same_transaction() {
    let s = StreamSink::new();
    let observed = covalent::run(|| {
        s.send(7).unwrap();
        record(&s.stream())
    })
    .unwrap();
    assert_eq!(*observed.lock().unwrap(), vec![7]);
}

#[test]
fn send_from_callback_is_rejected_without_a_firing() {
    let s = StreamSink::new();
    let s2: StreamSink<i32> = StreamSink::new();
    let observed = record(&s2.stream());
    let failures = Arc::new(Mutex::new(Vec::new()));

    let failures2 = failures.clone();
    s.stream().listen(move |v| {
        if let Err(e) = s2.send(v) {
            failures2.lock().unwrap().push(e);
        }
    });
    s.send(1).unwrap();

    assert_eq!(*failures.lock().unwrap(), vec![Error::SendFromCallback]);
    assert!(observed.lock().unwrap().is_empty());
}

#[test]
fn counter_with_increments_and_decrements() {
    let up = StreamSink::new();
    let down = StreamSink::new();
    let count = up
        .stream()
        .map(|()| 1)
        .merge(&down.stream().map(|()| -1), |l, r| l + r)
        .accum(0, |n, d| n + d);

    up.send(()).unwrap();
    up.send(()).unwrap();
    down.send(()).unwrap();
    assert_eq!(count.sample(), 1);

    // Simultaneous increment and decrement cancel out.
    covalent::run(|| {
        up.send(()).unwrap();
        down.send(()).unwrap();
    })
    .unwrap();
    assert_eq!(count.sample(), 1);
}

#[test]
fn state_machine_with_cell_cyclic() {
    #[derive(Clone, Copy, PartialEq, Debug)]
    enum Door {
        Open,
        Closed,
    }
    let toggle = StreamSink::new();
    let door = Cell::cyclic(|door| {
        toggle
            .stream()
            .snapshot(door, |(), d| match d {
                Door::Open => Door::Closed,
                Door::Closed => Door::Open,
            })
            .hold(Door::Closed)
    });
    assert_eq!(door.sample(), Door::Closed);
    toggle.send(()).unwrap();
    assert_eq!(door.sample(), Door::Open);
    toggle.send(()).unwrap();
    assert_eq!(door.sample(), Door::Closed);
}

#[test]
fn sends_from_many_threads_serialize() {
    let deltas = StreamSink::new();
    let sum = deltas.stream().accum(0i64, |a, d| a + d);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let deltas = deltas.clone();
            thread::spawn(move || deltas.feed(1..=50).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().expect("sender thread failed");
    }
    assert_eq!(sum.sample(), 4 * (1..=50).sum::<i64>());
}

#[test]
fn unlisten_is_idempotent_across_observations() {
    let s = StreamSink::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let listener = s.stream().listen(move |a| seen2.lock().unwrap().push(a));
    s.send(1).unwrap();
    for _ in 0..3 {
        listener.unlisten();
    }
    s.send(2).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}
