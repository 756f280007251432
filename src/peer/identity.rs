use tracing::{debug, info};

/// Что означает очередное сообщение `ready`/`offer` от удалённой стороны
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerObservation {
    /// Пира ещё не было
    First,
    /// offer от того же пира
    Same,
    /// Повторный ready от того же пира: он перезашёл
    Rejoined,
    /// Сообщение от другого участника
    Replaced { previous: String },
}

impl PeerObservation {
    pub fn requires_reset(&self) -> bool {
        matches!(self, PeerObservation::Rejoined | PeerObservation::Replaced { .. })
    }
}

#[derive(Debug, Default)]
pub struct PeerIdentityTracker {
    current: Option<String>,
}

impl PeerIdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn is_current(&self, id: &str) -> bool {
        self.current.as_deref() == Some(id)
    }

    pub fn observe_ready(&mut self, from: &str) -> PeerObservation {
        let observation = match self.current.as_deref() {
            None => PeerObservation::First,
            Some(current) if current == from => PeerObservation::Rejoined,
            Some(current) => PeerObservation::Replaced {
                previous: current.to_owned(),
            },
        };
        self.track(from, &observation);
        observation
    }

    pub fn observe_offer(&mut self, from: &str) -> PeerObservation {
        let observation = match self.current.as_deref() {
            None => PeerObservation::First,
            Some(current) if current == from => PeerObservation::Same,
            Some(current) => PeerObservation::Replaced {
                previous: current.to_owned(),
            },
        };
        self.track(from, &observation);
        observation
    }

    pub fn clear(&mut self) -> Option<String> {
        let previous = self.current.take();
        if let Some(id) = &previous {
            debug!("Forgetting remote peer {id}");
        }
        previous
    }

    fn track(&mut self, from: &str, observation: &PeerObservation) {
        match observation {
            PeerObservation::Same => {}
            PeerObservation::Replaced { previous } => {
                info!("Remote peer changed: {previous} -> {from}");
            }
            _ => info!("Remote peer {from}: {observation:?}"),
        }
        self.current = Some(from.to_owned());
    }
}
