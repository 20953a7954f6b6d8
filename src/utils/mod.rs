pub mod atomic_write;
pub mod lock_file;
pub mod logging;
pub mod paths;
pub mod sos;
