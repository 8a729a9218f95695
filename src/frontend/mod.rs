//! Protocol listeners.
//!
//! Each listener owns one listening socket and borrows the shared execution
//! pools for its accept loop and connection work.

mod listener;

pub use listener::{BindError, DrainOutcome, Listener, SocketSettings};
