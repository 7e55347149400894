//! Browser WebSocket.
//!
//! One socket per browser tab, bound to one session:
//!
//! ```text
//! browser ──text frames──> ClientCommand ──> SessionHandle ──> actor
//! browser <──text frames── BrowserEvent <── mpsc <──────────── actor
//! ```

mod handler;

pub use handler::ws_handler;
