use std::collections::HashMap;

use crate::{domain::OperatorId, errors::RelayError, relay::address::RemoteAddress};

/// What the next content-bearing input from an operator means.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PendingSend {
    #[default]
    Idle,
    /// `/send <target>` was accepted; the next content goes to `target`.
    AwaitingContent { target: RemoteAddress },
}

/// Per-operator pending-send state machine.
///
/// The "has a ready session" guard is checked by the caller, which owns the
/// registry; this type only handles address validation and transitions.
#[derive(Debug, Default)]
pub struct PendingSends {
    by_operator: HashMap<OperatorId, PendingSend>,
}

impl PendingSends {
    pub fn state(&self, operator: OperatorId) -> PendingSend {
        self.by_operator
            .get(&operator)
            .cloned()
            .unwrap_or_default()
    }

    /// `Idle | AwaitingContent --request_send--> AwaitingContent(target)`.
    ///
    /// An invalid address leaves the state unchanged. A second `/send` re-targets.
    pub fn request_send(
        &mut self,
        operator: OperatorId,
        raw_target: &str,
    ) -> Result<RemoteAddress, RelayError> {
        let target = RemoteAddress::parse(raw_target)?;
        self.by_operator.insert(
            operator,
            PendingSend::AwaitingContent {
                target: target.clone(),
            },
        );
        Ok(target)
    }

    /// `AwaitingContent --cancel--> Idle`.
    pub fn cancel(&mut self, operator: OperatorId) -> Result<RemoteAddress, RelayError> {
        self.take(operator).ok_or(RelayError::NothingPending)
    }

    /// Consume the pending target for a content delivery, leaving the operator `Idle`
    /// whatever the delivery outcome turns out to be.
    pub fn take(&mut self, operator: OperatorId) -> Option<RemoteAddress> {
        match self.by_operator.remove(&operator)? {
            PendingSend::AwaitingContent { target } => Some(target),
            PendingSend::Idle => None,
        }
    }
}
