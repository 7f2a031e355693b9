//! `rotor`: a multicore, event-driven TCP/UDP server framework for
//! Unix-like platforms.
//!
//! The crate owns sockets, drives readiness notifications from the
//! kernel's I/O multiplexer (via `mio`), dispatches events across a pool
//! of single-threaded event loops, and invokes a user-supplied
//! [`handler::EventHandler`] for connection lifecycle and data handling.
//!
//! Two reactor topologies are available, chosen automatically from
//! [`options::Options`] (see [`Server::serve`]):
//!
//! - **Distributed accept**: every loop owns its own listener (via kernel
//!   `SO_REUSEPORT`, or a single shared UDP socket) and accepts directly.
//! - **Main + sub reactors**: one loop owns the listener and hands
//!   accepted connections to a pool of worker loops through a pluggable
//!   [`load_balancer::LoadBalancer`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use rotor::{EventHandler, Options, Server};
//!
//! struct Echo;
//! impl EventHandler for Echo {
//!     fn react(&self, frame: bytes::Bytes, _conn: &mut rotor::Conn) -> (Option<bytes::Bytes>, rotor::Action) {
//!         (Some(frame), rotor::Action::None)
//!     }
//! }
//!
//! # fn main() -> Result<(), rotor::InitError> {
//! let addr = "127.0.0.1:9000".parse().unwrap();
//! let options = Options::default().with_num_event_loop(4);
//! let listener = rotor::init_listener("tcp", addr, &options)?;
//! let server = Server::new();
//! server.serve(Arc::new(Echo), listener, options, "tcp://127.0.0.1:9000")?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod conn;
mod error;
mod event_loop;
mod handler;
mod listener;
mod load_balancer;
mod options;
mod poller;
mod server;
mod ticker;

pub use codec::{Codec, Frame, PassthroughCodec};
pub use conn::Conn;
pub use error::{InitError, TypeMismatch};
pub use handler::{Action, EventHandler, InitAction, TickResult};
pub use listener::{init_listener, Listener, Network};
pub use options::{LbKind, Options};
pub use server::{lookup, Server, ServerView};
