#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("slicer only works on linux or android");

pub mod control;
pub mod dispatcher;
pub mod errors;
pub mod jail;
pub mod pool;
pub mod server;
pub mod shmem;
pub mod worker;

pub use crate::{
    control::ControlState,
    dispatcher::{purge_loop, Dispatcher},
    errors::{ControlError, JailError, WorkerError},
    pool::WorkerPool,
    shmem::SharedRegion,
    worker::{Runtime, Worker},
};
