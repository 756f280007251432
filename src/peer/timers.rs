use crate::session::SessionInput;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TimerPurpose {
    IceRestart,
    PeerEviction,
    ReconnectBackoff,
}

impl fmt::Display for TimerPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerPurpose::IceRestart => f.write_str("ice-restart"),
            TimerPurpose::PeerEviction => f.write_str("peer-eviction"),
            TimerPurpose::ReconnectBackoff => f.write_str("reconnect-backoff"),
        }
    }
}

struct PendingTimer {
    token: u64,
    handle: JoinHandle<()>,
}

/// Не больше одного ожидающего таймера на каждое назначение.
/// Сработавший таймер только кладёт `TimerFired` в очередь сессии;
/// устаревшие срабатывания отсекаются по токену.
pub struct TimerRegistry {
    tx: mpsc::UnboundedSender<SessionInput>,
    pending: HashMap<TimerPurpose, PendingTimer>,
    next_token: u64,
}

impl TimerRegistry {
    pub fn new(tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            tx,
            pending: HashMap::new(),
            next_token: 0,
        }
    }

    /// Заводит таймер, заменяя уже ожидающий с тем же назначением
    pub fn arm(&mut self, purpose: TimerPurpose, delay: Duration) -> u64 {
        self.cancel(purpose);
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(SessionInput::TimerFired { purpose, token });
        });
        debug!("Armed {purpose} timer for {} ms", delay.as_millis());
        self.pending.insert(purpose, PendingTimer { token, handle });
        token
    }

    pub fn cancel(&mut self, purpose: TimerPurpose) -> bool {
        match self.pending.remove(&purpose) {
            Some(timer) => {
                timer.handle.abort();
                debug!("Cancelled {purpose} timer");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.pending.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_armed(&self, purpose: TimerPurpose) -> bool {
        self.pending.contains_key(&purpose)
    }

    /// Принимает срабатывание. true, только если токен совпал с текущим таймером.
    pub fn take_fired(&mut self, purpose: TimerPurpose, token: u64) -> bool {
        match self.pending.get(&purpose) {
            Some(timer) if timer.token == token => {
                self.pending.remove(&purpose);
                true
            }
            _ => {
                debug!("Ignoring stale {purpose} timer (token {token})");
                false
            }
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
