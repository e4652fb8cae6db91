pub mod graceful_shutdown;
pub mod pid_file;

pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
