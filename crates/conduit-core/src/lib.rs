//! conduit-core — shared foundations of the Conduit fleet daemon.
//!
//! - [`config`]: `conduit.toml` parsing, validation and per-cycle reload
//! - [`worker`]: worker handles and the runtime-agnostic control trait
//! - [`docker`]: the docker CLI binding of that trait
//! - [`process`]: bounded-time external command execution
//! - [`clock`]: injectable wall clock

pub mod clock;
pub mod config;
pub mod docker;
pub mod process;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use config::{ChannelConfig, ConfigError, ConfigSource, FleetConfig, parse_duration};
pub use docker::DockerControl;
pub use process::{CommandOutput, ProcessError, run_command};
pub use worker::{BoxFuture, WorkerControl, WorkerError, WorkerHandle, WorkerInfo, WorkerResult};
