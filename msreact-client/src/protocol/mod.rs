//! Typed messaging on top of a [`Transport`].

pub mod codec;
pub mod id;

use rmpv::Value;
use tracing::{error, instrument, trace};

use crate::{
    error::{ProtocolError, TransportError},
    protocol::id::{EventId, MessageId},
    transport::Transport,
};

/// The protocol revision this client speaks.
pub const PROTOCOL_VERSION: &str = "v0.1";

/// Sends and receives [`MessageId`]-tagged messages. Holds no business state.
#[derive(Debug)]
pub struct ProtocolClient<T: Transport> {
    transport: T,
}

impl<T: Transport> ProtocolClient<T> {
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect the underlying transport. `Ok(false)` means the server refused the
    /// connection and the caller may retry.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Transport`] if the transport cannot attempt a
    /// connection at all.
    pub async fn connect(&self, address: Option<String>) -> Result<bool, ProtocolError> {
        Ok(self.transport.connect(address).await?)
    }

    /// # Errors
    /// Returns [`ProtocolError::Transport`] if the transport was not connected.
    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        Ok(self.transport.disconnect().await?)
    }

    /// Send a command to the server.
    ///
    /// # Errors
    /// - [`ProtocolError::Packing`] if `id` is not a command or the payload cannot
    ///   be encoded
    /// - [`ProtocolError::Transport`] if the transport rejects the frame
    #[instrument(skip(self, payload))]
    pub async fn send_message(
        &self,
        id: MessageId,
        payload: Option<&Value>,
    ) -> Result<(), ProtocolError> {
        if !matches!(id, MessageId::Command(_)) {
            return Err(ProtocolError::Packing {
                details: format!("{id} is not a command"),
            });
        }
        let frame = codec::encode(id, payload).map_err(|e| ProtocolError::Packing {
            details: e.to_string(),
        })?;
        trace!("sending {} byte frame", frame.len());
        self.transport.send(frame).await?;
        Ok(())
    }

    /// Receive the next message from the server.
    ///
    /// A transport failure is not propagated. It is logged and turned into an
    /// `ERROR_EVT` carrying the failure reason, so lost connections are handled
    /// the same way as errors reported by the server.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Parsing`] if a frame arrived but could not be
    /// decoded.
    pub async fn receive_message(&self) -> Result<(MessageId, Option<Value>), ProtocolError> {
        let frame = match self.transport.receive().await {
            Ok(frame) => frame,
            Err(e) => return Ok(Self::transport_failure(&e)),
        };
        codec::decode(&frame).map_err(|source| ProtocolError::Parsing { source })
    }

    fn transport_failure(e: &TransportError) -> (MessageId, Option<Value>) {
        error!("transport failure while receiving: {e}");
        (
            MessageId::Event(EventId::Error),
            Some(Value::from(e.to_string())),
        )
    }
}
