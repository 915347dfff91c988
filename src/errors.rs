//! Error types you might see while setting up or running a sandboxed worker

use thiserror::Error;

/// Errors from the jail launcher and its freezer cgroup
#[derive(Error, Debug)]
pub enum JailError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// error in memory-backed file
    #[error("error in memory-backed file: {0}")]
    MemfdError(#[from] memfd::Error),

    /// jail was already started
    #[error("jail was already started")]
    AlreadyStarted,

    /// jail has not been started
    #[error("jail has not been started")]
    NotStarted,
}

/// Errors on the control channel between host and bootstrap
#[derive(Error, Debug)]
pub enum ControlError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// frame did not carry the protocol magic
    #[error("invalid magic")]
    InvalidMagic,

    /// frame body was not a well-formed key/value list
    #[error("kv parser failed")]
    KvParserFailed,

    /// peer sent a command we do not understand in the current state
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// an invoke was attempted while the worker was not ready
    #[error("handler is busy")]
    HandlerBusy,

    /// the bootstrap faulted before it finished initializing
    #[error("control faulted during init")]
    ControlFault,

    /// the jailed process exited while a control read was pending
    #[error("control connection lost")]
    Disconnected,
}

/// Errors that occur while creating or driving a worker
#[derive(Error, Debug)]
pub enum WorkerError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// jail error
    #[error("jail error: {0}")]
    Jail(#[from] JailError),

    /// control channel error
    #[error("control error: {0}")]
    Control(#[from] ControlError),
}
