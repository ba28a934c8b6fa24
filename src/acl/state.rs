//! Connection lifecycle state machine.

use serde::Serialize;

use crate::hci::packet::Status;

/// Which side initiated the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
   Initiator,
   Acceptor,
}

/// Lifecycle state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
   Idle,
   Requesting,
   Accepting,
   Active,
   Disconnecting,
   Closed,
   Failed,
}

/// Inputs that drive [`LinkState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LinkInput {
   /// Application asked for an outbound connection.
   Connect,
   /// Controller reported a peer-initiated request that the policy accepted.
   IncomingRequest,
   /// Connection_Complete with the given status.
   Complete(Status),
   /// Command_Status failure for the create/accept command.
   CommandFailed(Status),
   /// Application cancelled an outbound request.
   Cancel,
   /// Application asked to disconnect.
   Disconnect,
   /// Disconnection_Complete with a failure status.
   DisconnectFailed(Status),
   /// Disconnection_Complete with success.
   DisconnectionComplete,
}

impl LinkState {
   /// Next state for `input`, or `None` when the input is not valid here.
   pub fn next(self, input: LinkInput) -> Option<Self> {
      use LinkInput as I;

      let next = match (self, input) {
         (Self::Idle, I::Connect) => Self::Requesting,
         (Self::Idle, I::IncomingRequest) => Self::Accepting,
         (Self::Requesting | Self::Accepting, I::Complete(status)) => {
            if status.is_success() {
               Self::Active
            } else {
               Self::Failed
            }
         },
         (Self::Requesting | Self::Accepting, I::CommandFailed(_)) => Self::Failed,
         (Self::Requesting, I::Cancel) => Self::Failed,
         (Self::Active, I::Disconnect) => Self::Disconnecting,
         (Self::Disconnecting, I::DisconnectFailed(_)) => Self::Active,
         (Self::Active | Self::Disconnecting, I::DisconnectionComplete) => Self::Closed,
         _ => return None,
      };
      Some(next)
   }

   /// Waiting for the controller to report the outcome of a connection.
   pub const fn is_pending(self) -> bool {
      matches!(self, Self::Requesting | Self::Accepting)
   }

   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Closed | Self::Failed)
   }
}
