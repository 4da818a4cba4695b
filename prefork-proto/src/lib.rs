//! Wire protocol for prefork spawner-worker communication.
//!
//! A spawner and the processes it forks talk over a Unix socket pair with a
//! deliberately narrow vocabulary: one boot-status report, one worker
//! greeting, one spawn-request token, and out-of-band file descriptor
//! transfer for the owner pipe. Everything else (request routing, worker
//! supervision) lives outside this protocol.

mod codec;
mod message;

#[cfg(unix)]
mod channel;

pub use codec::{recv, send};
pub use message::{Fault, SpawnRequest, StatusMessage, WorkerHello};

#[cfg(unix)]
pub use channel::Channel;
