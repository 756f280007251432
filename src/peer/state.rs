use crate::peer::timers::TimerPurpose;
use crate::peer::types::PeerState;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Жизненный цикл звонка с точки зрения пользователя
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Тайминги восстановления соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub ice_restart_delay: Duration,
    pub peer_eviction_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            ice_restart_delay: Duration::from_secs(3),
            peer_eviction_delay: Duration::from_secs(10),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_attempts: 3,
        }
    }
}

impl RecoveryPolicy {
    /// `min(base * 2^(attempt-1), max)`, попытки считаются с единицы
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Применено локальное или удалённое описание
    DescriptionApplied,
    Transport(PeerState),
    TimerFired(TimerPurpose),
    SessionReset,
    Teardown,
}

/// Что сессия должна сделать после перехода
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Arm(TimerPurpose, Duration),
    Cancel(TimerPurpose),
    RestartIce,
    EvictRemotePeer,
    StartQualityMonitor,
    StopQualityMonitor,
    Notify(CallState),
    GiveUp { attempts: u32 },
    ReleaseResources,
}

const ALL_TIMERS: [TimerPurpose; 3] = [
    TimerPurpose::IceRestart,
    TimerPurpose::PeerEviction,
    TimerPurpose::ReconnectBackoff,
];

/// Чистая функция переходов. Ничего не делает сама, только возвращает действия.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: CallState,
    policy: RecoveryPolicy,
    attempts: u32,
    backoff_pending: bool,
    exhausted: bool,
}

impl ConnectionStateMachine {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            state: CallState::New,
            policy,
            attempts: 0,
            backoff_pending: false,
            exhausted: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> Vec<Action> {
        if self.state == CallState::Closed {
            debug!("Ignoring {event:?}: session is closed");
            return Vec::new();
        }

        let actions = match event {
            ConnectionEvent::DescriptionApplied => self.on_description_applied(),
            ConnectionEvent::Transport(peer_state) => self.on_transport(peer_state),
            ConnectionEvent::TimerFired(purpose) => self.on_timer(purpose),
            ConnectionEvent::SessionReset => self.on_reset(),
            ConnectionEvent::Teardown => self.on_teardown(),
        };
        if !actions.is_empty() {
            debug!("{event:?} -> {:?}: {actions:?}", self.state);
        }
        actions
    }

    fn transition(&mut self, to: CallState, actions: &mut Vec<Action>) {
        if self.state == to {
            return;
        }
        if self.state == CallState::Connected {
            actions.push(Action::StopQualityMonitor);
        }
        info!("Call state {:?} -> {:?}", self.state, to);
        self.state = to;
        if to == CallState::Connected {
            actions.push(Action::StartQualityMonitor);
        }
        actions.push(Action::Notify(to));
    }

    fn on_description_applied(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == CallState::New {
            self.transition(CallState::Connecting, &mut actions);
        }
        actions
    }

    fn on_transport(&mut self, peer_state: PeerState) -> Vec<Action> {
        let mut actions = Vec::new();
        match peer_state {
            PeerState::Connecting if self.state == CallState::New => {
                self.transition(CallState::Connecting, &mut actions);
            }
            PeerState::Connected if self.state != CallState::Connected => {
                for purpose in ALL_TIMERS {
                    actions.push(Action::Cancel(purpose));
                }
                self.attempts = 0;
                self.backoff_pending = false;
                self.exhausted = false;
                self.transition(CallState::Connected, &mut actions);
            }
            PeerState::Disconnected if self.state == CallState::Connected => {
                actions.push(Action::Arm(
                    TimerPurpose::IceRestart,
                    self.policy.ice_restart_delay,
                ));
                actions.push(Action::Arm(
                    TimerPurpose::PeerEviction,
                    self.policy.peer_eviction_delay,
                ));
                self.transition(CallState::Disconnected, &mut actions);
            }
            PeerState::Failed => self.on_failed(&mut actions),
            other => debug!("Transport reported {other:?} while {:?}, no transition", self.state),
        }
        actions
    }

    fn on_failed(&mut self, actions: &mut Vec<Action>) {
        if self.exhausted || self.backoff_pending {
            return;
        }
        actions.push(Action::Cancel(TimerPurpose::IceRestart));
        self.transition(CallState::Failed, actions);
        self.schedule_attempt(actions);
    }

    fn schedule_attempt(&mut self, actions: &mut Vec<Action>) {
        if self.attempts >= self.policy.max_attempts {
            warn!("Reconnect attempts exhausted after {}", self.attempts);
            self.exhausted = true;
            actions.push(Action::GiveUp {
                attempts: self.attempts,
            });
            return;
        }
        self.attempts += 1;
        self.backoff_pending = true;
        let delay = self.policy.backoff_delay(self.attempts);
        info!(
            "Scheduling reconnect attempt {}/{} in {} ms",
            self.attempts,
            self.policy.max_attempts,
            delay.as_millis()
        );
        actions.push(Action::Arm(TimerPurpose::ReconnectBackoff, delay));
    }

    fn on_timer(&mut self, purpose: TimerPurpose) -> Vec<Action> {
        let mut actions = Vec::new();
        match purpose {
            TimerPurpose::IceRestart if self.state == CallState::Disconnected => {
                actions.push(Action::RestartIce);
            }
            TimerPurpose::PeerEviction
                if matches!(self.state, CallState::Disconnected | CallState::Failed) =>
            {
                actions.push(Action::EvictRemotePeer);
            }
            TimerPurpose::ReconnectBackoff if self.state == CallState::Failed => {
                self.backoff_pending = false;
                actions.push(Action::RestartIce);
            }
            _ => debug!("{purpose} timer fired while {:?}, ignoring", self.state),
        }
        actions
    }

    fn on_reset(&mut self) -> Vec<Action> {
        let mut actions: Vec<Action> = ALL_TIMERS.iter().map(|p| Action::Cancel(*p)).collect();
        self.attempts = 0;
        self.backoff_pending = false;
        self.exhausted = false;
        self.transition(CallState::New, &mut actions);
        actions
    }

    fn on_teardown(&mut self) -> Vec<Action> {
        let mut actions: Vec<Action> = ALL_TIMERS.iter().map(|p| Action::Cancel(*p)).collect();
        actions.push(Action::ReleaseResources);
        self.transition(CallState::Closed, &mut actions);
        actions
    }
}
