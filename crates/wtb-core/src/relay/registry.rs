use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    domain::OperatorId,
    errors::RelayError,
    relay::correlation::CorrelationTable,
    remote::{RemoteClient, SessionEpoch},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// Client started, waiting for the operator to scan the QR code.
    Pairing,
    Ready,
    /// Terminal; only observed on sessions that were just removed.
    Disconnected,
}

/// One WhatsApp connection owned by one operator.
pub struct Session {
    operator: OperatorId,
    epoch: SessionEpoch,
    state: SessionState,
    client: Option<Arc<dyn RemoteClient>>,
    correlations: CorrelationTable,
    ready_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(operator: OperatorId, epoch: SessionEpoch, correlation_capacity: usize) -> Self {
        Self {
            operator,
            epoch,
            state: SessionState::Uninitialized,
            client: None,
            correlations: CorrelationTable::new(correlation_capacity),
            ready_at: None,
        }
    }

    pub fn operator(&self) -> OperatorId {
        self.operator
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Pairing or ready: the states that block a second `open`.
    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Pairing | SessionState::Ready)
    }

    pub fn client(&self) -> Option<Arc<dyn RemoteClient>> {
        self.client.clone()
    }

    pub fn correlations(&self) -> &CorrelationTable {
        &self.correlations
    }

    pub fn correlations_mut(&mut self) -> &mut CorrelationTable {
        &mut self.correlations
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.ready_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("operator", &self.operator)
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .field("has_client", &self.client.is_some())
            .field("correlations", &self.correlations.len())
            .finish()
    }
}

/// Operator → session. At most one session per operator.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<OperatorId, Session>,
    next_epoch: u64,
    correlation_capacity: usize,
}

impl SessionRegistry {
    pub fn new(correlation_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_epoch: 0,
            correlation_capacity,
        }
    }

    /// Create a session for `operator` and move it to `Pairing`.
    ///
    /// The caller starts the remote client and attaches it with
    /// [`SessionRegistry::attach_client`].
    pub fn open(&mut self, operator: OperatorId) -> Result<SessionEpoch, RelayError> {
        if self.sessions.get(&operator).is_some_and(Session::is_live) {
            return Err(RelayError::AlreadyConnected);
        }

        self.next_epoch += 1;
        let epoch = SessionEpoch(self.next_epoch);
        let mut session = Session::new(operator, epoch, self.correlation_capacity);
        session.state = SessionState::Pairing;
        self.sessions.insert(operator, session);
        Ok(epoch)
    }

    /// Returns `false` if the session for `epoch` is gone.
    pub fn attach_client(
        &mut self,
        operator: OperatorId,
        epoch: SessionEpoch,
        client: Arc<dyn RemoteClient>,
    ) -> bool {
        match self.get_current_mut(operator, epoch) {
            Some(s) => {
                s.client = Some(client);
                true
            }
            None => false,
        }
    }

    /// `Pairing --ready--> Ready`. Returns `false` for stale epochs.
    pub fn mark_ready(&mut self, operator: OperatorId, epoch: SessionEpoch) -> bool {
        match self.get_current_mut(operator, epoch) {
            Some(s) => {
                if s.state != SessionState::Ready {
                    s.state = SessionState::Ready;
                    s.ready_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, operator: OperatorId) -> Option<&Session> {
        self.sessions.get(&operator)
    }

    /// The session for `operator`, but only if it is still the one from `epoch`.
    pub fn get_current_mut(
        &mut self,
        operator: OperatorId,
        epoch: SessionEpoch,
    ) -> Option<&mut Session> {
        self.sessions
            .get_mut(&operator)
            .filter(|s| s.epoch == epoch)
    }

    pub fn is_current(&self, operator: OperatorId, epoch: SessionEpoch) -> bool {
        self.sessions
            .get(&operator)
            .is_some_and(|s| s.epoch == epoch)
    }

    /// Client of a ready session.
    pub fn ready_client(&self, operator: OperatorId) -> Result<Arc<dyn RemoteClient>, RelayError> {
        self.sessions
            .get(&operator)
            .filter(|s| s.is_ready())
            .and_then(Session::client)
            .ok_or(RelayError::NotConnected)
    }

    /// Remove the session (and with it the correlation table).
    pub fn close(&mut self, operator: OperatorId) -> Result<Session, RelayError> {
        self.remove(operator).ok_or(RelayError::NotConnected)
    }

    /// Remove the session only if it is still the one from `epoch`.
    pub fn remove_current(&mut self, operator: OperatorId, epoch: SessionEpoch) -> Option<Session> {
        if !self.is_current(operator, epoch) {
            return None;
        }
        self.remove(operator)
    }

    fn remove(&mut self, operator: OperatorId) -> Option<Session> {
        let mut session = self.sessions.remove(&operator)?;
        session.state = SessionState::Disconnected;
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
