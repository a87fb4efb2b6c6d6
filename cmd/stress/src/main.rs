//! Stress test - many fibers
//!
//! Spawns a large number of fibers that yield a few times and park on
//! the reactor's timer wheel, then reports throughput.
//!
//! Usage:
//!     cargo run --release -p filament-stress [fibers] [workers]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use filament::{hook, Fiber, IoManager};

fn main() -> std::io::Result<()> {
    let num_fibers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);
    let workers: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    filament::kprint::init();
    println!("=== filament stress: {} fibers on {} workers ===\n", num_fibers, workers);

    let iom = IoManager::new(workers, false, "stress")?;
    let completed = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    for _ in 0..num_fibers {
        let completed = completed.clone();
        iom.schedule(move || {
            for _ in 0..3 {
                Fiber::yield_to_ready();
            }
            hook::sleep_ms(10);
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }
    let spawn_time = start.elapsed();
    println!("spawned in {:?} ({:.0} fibers/sec)",
        spawn_time,
        num_fibers as f64 / spawn_time.as_secs_f64());

    while (completed.load(Ordering::Relaxed) as usize) < num_fibers {
        std::thread::sleep(Duration::from_millis(10));
    }
    let total = start.elapsed();
    iom.stop();

    println!("completed {} fibers in {:?}", num_fibers, total);
    println!("throughput: {:.0} fibers/sec", num_fibers as f64 / total.as_secs_f64());
    Ok(())
}
