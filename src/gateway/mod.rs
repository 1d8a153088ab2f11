//! Gateway server implementation

mod listener;
mod router;
mod server;

pub use listener::{TlsListener, tls_acceptor};
pub use router::{AppState, create_router};
pub use server::Gateway;
