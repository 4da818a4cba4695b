//! Preforking process spawner for warm web-application images.
//!
//! Loading a heavyweight application (framework boot, code loading,
//! database handles) can take seconds. This crate loads it once, into a
//! long-lived **preloader** process, and then produces workers on demand by
//! forking that warm image; copy-on-write makes each fork cheap. A slower
//! **cold spawn** path boots the application from scratch in a fresh
//! process when no preloader is running.
//!
//! ```no_run
//! use prefork::{BasicEndpointFactory, BootError, Spawner, SpawnerOptions};
//!
//! fn boot_app() -> Result<(), BootError> {
//!     // load framework, open database handles, ...
//!     Ok(())
//! }
//!
//! fn main() -> prefork::Result<()> {
//!     let options = SpawnerOptions::new("/srv/app").environment("staging");
//!     let endpoints = BasicEndpointFactory::new(|_conn| { /* serve */ });
//!     let mut spawner = Spawner::start(options, boot_app, endpoints)?;
//!
//!     let worker = spawner.spawn()?;
//!     println!("worker {} at {}", worker.pid(), worker.endpoint_name());
//!     Ok(())
//! }
//! ```
//!
//! Boot failures inside a forked child never cross the process boundary as
//! native panics or exits: they are serialized over a private status
//! channel and reconstructed as a typed [`Error`] in the caller.

mod boot;
mod error;

#[cfg(unix)]
mod endpoint;
#[cfg(unix)]
mod lifecycle;
#[cfg(unix)]
mod loader;
#[cfg(unix)]
mod privilege;
#[cfg(unix)]
mod sequencer;
#[cfg(unix)]
mod spawner;
#[cfg(unix)]
mod status;
#[cfg(unix)]
mod worker;

pub use boot::{BootError, BootProcedure};
pub use error::{Error, Result};

#[cfg(unix)]
pub use endpoint::{
    BasicEndpoint, BasicEndpointFactory, ConnectionHandler, Endpoint, EndpointFactory,
};
#[cfg(unix)]
pub use lifecycle::{
    HARD_TERMINATION_SIGNAL, SOFT_TERMINATION_SIGNAL, double_fork, install_termination_handlers,
    prepare_forking_image, shutdown_requested,
};
#[cfg(unix)]
pub use loader::{ENV_NAME_VAR, ImageLoader};
#[cfg(unix)]
pub use privilege::{PrivilegeSpec, lower_privilege};
#[cfg(unix)]
pub use sequencer::launch;
#[cfg(unix)]
pub use spawner::{DEFAULT_ENTRY_FILE, Spawner, SpawnerOptions, spawn_cold};
#[cfg(unix)]
pub use status::{receive_and_raise, report};
#[cfg(unix)]
pub use worker::Worker;
