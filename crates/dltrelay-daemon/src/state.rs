use std::fmt;

use tracing::info;

use crate::error::{DaemonError, Result};

/// Where log messages go right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryState {
    /// Transports are not up yet.
    #[default]
    Init,
    /// No consumer; messages go into the ring buffer.
    Buffer,
    /// The ring buffer rejected a message; discards are being counted.
    BufferFull,
    /// A consumer is attached and the buffer is being drained to it.
    SendBuffer,
    /// Messages go straight to consumers.
    SendDirect,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Buffer => "BUFFER",
            Self::BufferFull => "BUFFER_FULL",
            Self::SendBuffer => "SEND_BUFFER",
            Self::SendDirect => "SEND_DIRECT",
        }
    }

    /// New messages are stored instead of written out.
    pub fn is_buffering(self) -> bool {
        matches!(self, Self::Buffer | Self::BufferFull | Self::SendBuffer)
    }

    /// The periodic flush has work to do.
    pub fn is_flushing(self) -> bool {
        matches!(self, Self::SendBuffer | Self::BufferFull)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is an edge of the state machine.
pub fn is_legal_transition(from: DeliveryState, to: DeliveryState) -> bool {
    use DeliveryState::*;
    match (from, to) {
        (Init, Buffer) | (Init, SendDirect) => true,
        (Buffer, SendBuffer) | (Buffer, SendDirect) => true,
        (SendBuffer, SendDirect) => true,
        (BufferFull, SendBuffer) => true,
        (SendDirect, Buffer) | (SendBuffer, Buffer) => true,
        (from, BufferFull) => from != SendDirect,
        _ => false,
    }
}

/// Guards the five delivery states; every change goes through
/// [`DeliveryStateMachine::request`].
#[derive(Debug, Default)]
pub struct DeliveryStateMachine {
    state: DeliveryState,
}

impl DeliveryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Move to `to` if that is a legal edge. Requesting the current state
    /// is a no-op.
    pub fn request(&mut self, to: DeliveryState) -> Result<()> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if !is_legal_transition(from, to) {
            return Err(DaemonError::IllegalTransition { from, to });
        }
        info!(from = %from, to = %to, "delivery state changed");
        self.state = to;
        Ok(())
    }

    /// Transports are live. A consumer on a serial line counts as attached.
    pub fn transports_ready(&mut self, serial_consumer: bool) -> DeliveryState {
        if self.state != DeliveryState::Init {
            return self.state;
        }
        let to = if serial_consumer {
            DeliveryState::SendDirect
        } else {
            DeliveryState::Buffer
        };
        self.apply(to)
    }

    /// The first consumer connected.
    pub fn consumer_connected(&mut self, buffer_empty: bool) -> DeliveryState {
        match self.state {
            DeliveryState::Buffer if buffer_empty => self.apply(DeliveryState::SendDirect),
            DeliveryState::Buffer | DeliveryState::BufferFull => {
                self.apply(DeliveryState::SendBuffer)
            }
            state => state,
        }
    }

    /// The flush wrote its first message after an overflow.
    pub fn flush_resumed(&mut self) -> DeliveryState {
        match self.state {
            DeliveryState::BufferFull => self.apply(DeliveryState::SendBuffer),
            state => state,
        }
    }

    /// The flush emptied the ring buffer.
    pub fn buffer_drained(&mut self) -> DeliveryState {
        match self.state {
            DeliveryState::SendBuffer => self.apply(DeliveryState::SendDirect),
            state => state,
        }
    }

    /// A push was rejected by the ring buffer.
    pub fn buffer_overflowed(&mut self) -> DeliveryState {
        self.apply(DeliveryState::BufferFull)
    }

    /// The last consumer went away. With an offline trace configured,
    /// delivery stays direct so the trace keeps receiving messages.
    pub fn last_consumer_closed(&mut self, offline_trace: bool) -> DeliveryState {
        match self.state {
            DeliveryState::SendDirect | DeliveryState::SendBuffer => {
                let to = if offline_trace {
                    DeliveryState::SendDirect
                } else {
                    DeliveryState::Buffer
                };
                self.apply(to)
            }
            state => state,
        }
    }

    /// Event helpers ignore edges that do not apply to the current state.
    fn apply(&mut self, to: DeliveryState) -> DeliveryState {
        let _ = self.request(to);
        self.state
    }
}
