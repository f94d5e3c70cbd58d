//! Basic demo of counted references and deferred finalization
//!
//! This example demonstrates:
//! - A runtime-owned reference going weak when its count drops to zero
//! - The collector only enqueueing the finalizer
//! - The finalizer running at the next safe point

use verweis::{Env, Finalizer, Mode, Opaque, Ownership};

fn release(_env: &mut Env, data: Opaque, _hint: Opaque) {
    println!("  finalizer ran for native object #{}", data.addr());
}

fn main() {
    println!("=== Verweis Demo ===\n");

    let mut env = Env::new();
    let object = env.create_object();
    let reference = env
        .create_reference_with(object, 1, Ownership::Runtime, Finalizer::new(release, Opaque::from_addr(7), Opaque::NULL))
        .expect("object can be referenced");
    println!("  created reference, mode {:?}", mode(&env, reference));

    let count = env.reference_unref(reference).expect("count was 1");
    println!("  unref -> count {count}, mode {:?}", mode(&env, reference));

    let reclaimed = env.collect_garbage();
    println!(
        "  collected {reclaimed} value(s), {} finalizer(s) pending",
        env.pending_finalizer_count()
    );

    let ran = env.run_and_clear_interrupts();
    println!("  safe point ran {ran} interrupt(s)");
    println!(
        "  value after drain: {:?}",
        env.get_reference_value(reference).expect("handle was issued")
    );
}

fn mode(env: &Env, reference: verweis::RefId) -> Mode {
    env.reference_mode(reference).unwrap_or(Mode::Empty)
}
