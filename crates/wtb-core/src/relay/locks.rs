use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::OperatorId;

/// One async lock per operator.
///
/// Every handler that touches an operator's session, correlation table or pending
/// send holds that operator's lock for its whole duration, so one operator's
/// commands and events apply in order while other operators proceed in parallel.
#[derive(Default)]
pub struct OperatorLocks {
    inner: Mutex<HashMap<OperatorId, Arc<Mutex<()>>>>,
}

impl OperatorLocks {
    pub async fn lock(&self, operator: OperatorId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(operator)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
