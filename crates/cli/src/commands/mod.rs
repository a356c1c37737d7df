// Demo workloads, one per subcommand

pub mod classify;
pub mod concat;
pub mod factorial;
pub mod sleep;
