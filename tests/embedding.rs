use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use verweis::{Env, Error, ListKind, Mode, Opaque};

thread_local! {
    static CALLS: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

fn record(_: &mut Env, data: Opaque, hint: Opaque) {
    CALLS.with(|calls| calls.borrow_mut().push((data.addr(), hint.addr())));
}

fn calls() -> Vec<(usize, usize)> {
    CALLS.with(|calls| calls.borrow().clone())
}

#[test]
fn wrapped_object_finalized_on_collection() {
    let mut env = Env::new();
    let object = env.create_object();
    let reference = env
        .wrap(object, Opaque::from_addr(1), Some(record), Opaque::from_addr(2), false)
        .unwrap();
    assert_eq!(reference, None);
    assert_eq!(env.unwrap(object), Ok(Opaque::from_addr(1)));

    env.collect_garbage();
    assert!(calls().is_empty());
    env.run_and_clear_interrupts();
    assert_eq!(calls(), vec![(1, 2)]);
    assert_eq!(env.tracked_count(ListKind::Finalizing), 0);
}

#[test]
fn userland_wrap_reference_belongs_to_caller() {
    let mut env = Env::new();
    let object = env.create_object();
    let reference = env
        .wrap(object, Opaque::from_addr(3), Some(record), Opaque::NULL, true)
        .unwrap()
        .expect("reference requested");
    assert_eq!(env.reference_count(reference), Ok(0));
    assert_eq!(env.reference_mode(reference), Ok(Mode::Weak));

    // keep the object alive through the returned reference
    env.reference_ref(reference).unwrap();
    env.collect_garbage();
    assert_eq!(env.unwrap(object), Ok(Opaque::from_addr(3)));

    assert_eq!(env.remove_wrap(object), Ok(Opaque::from_addr(3)));
    assert_eq!(env.unwrap(object), Err(Error::InvalidArg));

    // the callback is gone, the reference is not
    env.reference_unref(reference).unwrap();
    env.collect_garbage();
    env.run_and_clear_interrupts();
    assert!(calls().is_empty());
    env.delete_reference(reference).unwrap();
    drop(env);
    assert!(calls().is_empty());
}

#[test]
fn object_can_be_rewrapped_after_remove() {
    let mut env = Env::new();
    let object = env.create_object();
    let anchor = env.create_reference(object, 1).unwrap();
    env.wrap(object, Opaque::from_addr(4), Some(record), Opaque::NULL, false)
        .unwrap();
    env.remove_wrap(object).unwrap();
    env.wrap(object, Opaque::from_addr(5), Some(record), Opaque::NULL, false)
        .unwrap();

    env.delete_reference(anchor).unwrap();
    env.collect_garbage();
    env.run_and_clear_interrupts();
    assert_eq!(calls(), vec![(5, 0)]);
}

#[test]
fn add_finalizer_stacks_callbacks() {
    let mut env = Env::new();
    let object = env.create_object();
    env.add_finalizer(object, Opaque::from_addr(6), record, Opaque::NULL, false)
        .unwrap();
    let kept = env
        .add_finalizer(object, Opaque::from_addr(7), record, Opaque::NULL, true)
        .unwrap()
        .expect("reference requested");

    let text = env.create_string("no finalizers on strings");
    assert_eq!(
        env.add_finalizer(text, Opaque::NULL, record, Opaque::NULL, false),
        Err(Error::InvalidArg)
    );

    env.collect_garbage();
    env.run_and_clear_interrupts();
    let mut seen = calls();
    seen.sort_unstable();
    assert_eq!(seen, vec![(6, 0), (7, 0)]);
    assert_eq!(env.reference_mode(kept), Ok(Mode::Empty));
    env.delete_reference(kept).unwrap();
}

#[test]
fn external_finalized_with_its_data() {
    let mut env = Env::new();
    let external = env
        .create_external(Opaque::from_addr(8), Some(record), Opaque::from_addr(9))
        .unwrap();
    assert_eq!(env.get_value_external(external), Ok(Opaque::from_addr(8)));

    env.collect_garbage();
    env.run_and_clear_interrupts();
    assert_eq!(calls(), vec![(8, 9)]);
    assert!(!env.heap().is_live(external));
}

#[test]
fn instance_data_finalized_at_teardown() {
    let mut env = Env::new();
    assert_eq!(env.get_instance_data(), None);
    env.set_instance_data(Opaque::from_addr(10), Some(record), Opaque::from_addr(11));
    assert_eq!(env.get_instance_data(), Some(Opaque::from_addr(10)));

    env.collect_garbage();
    env.run_and_clear_interrupts();
    assert!(calls().is_empty());

    drop(env);
    assert_eq!(calls(), vec![(10, 11)]);
}

#[test]
fn interrupts_from_other_threads_run_at_safe_point() {
    let mut env = Env::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let handle = env.interrupt_handle();
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                for _ in 0..10 {
                    let ran = Arc::clone(&ran);
                    handle.request_interrupt(move |env| {
                        env.create_object();
                        ran.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(ran.load(Ordering::Relaxed), 0);
    assert!(env.has_pending_interrupts());
    assert_eq!(env.run_and_clear_interrupts(), 40);
    assert_eq!(ran.load(Ordering::Relaxed), 40);
    assert_eq!(env.collect_garbage(), 40);
}

#[test]
fn interrupts_queued_while_running_are_run_too() {
    let mut env = Env::new();
    env.request_interrupt(|env| {
        env.request_interrupt(|env| {
            env.set_instance_data(Opaque::from_addr(12), None, Opaque::NULL);
        });
    });
    assert_eq!(env.run_and_clear_interrupts(), 2);
    assert_eq!(env.get_instance_data(), Some(Opaque::from_addr(12)));
}

#[test]
fn object_can_be_rewrapped_after_reference_deleted() {
    let mut env = Env::new();
    let object = env.create_object();
    let anchor = env.create_reference(object, 1).unwrap();
    let reference = env
        .wrap(object, Opaque::from_addr(13), Some(record), Opaque::NULL, true)
        .unwrap()
        .expect("reference requested");

    env.delete_reference(reference).unwrap();
    assert_eq!(calls(), vec![(13, 0)]);
    assert_eq!(env.unwrap(object), Err(Error::InvalidArg));

    assert_eq!(
        env.wrap(object, Opaque::from_addr(14), Some(record), Opaque::NULL, false),
        Ok(None)
    );
    assert_eq!(env.unwrap(object), Ok(Opaque::from_addr(14)));

    env.delete_reference(anchor).unwrap();
    env.collect_garbage();
    env.run_and_clear_interrupts();
    assert_eq!(calls(), vec![(13, 0), (14, 0)]);
}
