//! Blocking synchronization primitives built on the scheduler's block/wakeup pair
//! (§4.5 Supplement).

pub mod semaphore;
