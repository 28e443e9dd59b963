//! Future-returning fibers
//!
//! A fiber starts a second, future-returning fiber, blocks until it is done
//! and prints the value it produced. The inner future yields the fiber after
//! every line it prints, so the two interleave on one thread.

use rust_fibers::prelude::*;

async fn count(label: &str, n: usize) -> usize {
    for i in 0..n {
        println!("{}: {}", i, label);
        yield_now().await;
    }
    n
}

fn start(cx: &FiberContext) -> Result<()> {
    let counter = cx.go_async(|_| count("abc", 5))?;
    let returned = counter.join_in(cx)?;
    println!("count() returned {}", returned);
    Ok(())
}

fn main() -> Result<()> {
    let scheduler = Scheduler::with_defaults();

    let handle = scheduler.go(start)?;
    handle.join(&scheduler)??;
    println!("done.");

    let stats = scheduler.stats();
    println!(
        "activations: {}, yields: {}, joins: {}",
        stats.activations.load(std::sync::atomic::Ordering::Relaxed),
        stats.yields.load(std::sync::atomic::Ordering::Relaxed),
        stats.joins.load(std::sync::atomic::Ordering::Relaxed),
    );
    Ok(())
}
