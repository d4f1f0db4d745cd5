// tether keeps long-lived logical connections between a client process and a
// cluster node alive across socket failures. A logical connection is bound to
// a `ConnectionIdentity` minted by the server during the first handshake; every
// later socket carrying the same identity is reattached to the same server-side
// transport instead of starting a new session.
//
// The crate is organised around a handful of tasks per process: one reader per
// socket, one reconnect worker per client establisher, one shared health
// monitor per checker and one acceptor per server. Shared tables (admission
// ledger, stack registry) are only mutated through compound operations so
// that concurrent connect and disconnect storms can't interleave a
// read-then-act sequence.

pub mod transport;

pub use transport::*;
