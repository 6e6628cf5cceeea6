//! DLT log relay.
//!
//! Applications on an ECU write DLT messages and control envelopes to a
//! local socket; dltrelay buffers them until a log viewer attaches, stamps
//! and forwards them, and answers the viewer's control requests.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte channels (Unix sockets, TCP) and connection ids
//! - [`frame`]: DLT message codec, producer envelopes, control payloads
//! - [`daemon`]: registry, ring buffer, delivery state machine, dispatcher

/// Re-export transport types.
pub mod transport {
    pub use dltrelay_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use dltrelay_frame::*;
}

/// Re-export daemon types.
pub mod daemon {
    pub use dltrelay_daemon::*;
}
