// Background jobs

pub mod hold_sweeper;

pub use hold_sweeper::{start_scheduler, sweep_orphaned_holds, SweepStats};
