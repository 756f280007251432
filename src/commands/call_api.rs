use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::events::{CallEvent, CallSnapshot, EventBus};
use crate::session::{spawn_session, Command, Reply, Session, SessionDeps, SessionInput};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Пульт звонка для UI. Все запросы уходят в очередь сессии.
pub struct CallHandle {
    room_id: String,
    local_id: String,
    inputs: mpsc::UnboundedSender<SessionInput>,
    bus: EventBus,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl CallHandle {
    pub fn start(
        room_id: impl Into<String>,
        local_id: impl Into<String>,
        config: CallConfig,
        deps: SessionDeps,
    ) -> Self {
        let room_id = room_id.into();
        let local_id = local_id.into();
        let (inputs, rx) = mpsc::unbounded_channel();
        let bus = EventBus::new();
        let session = Session::new(
            room_id.clone(),
            local_id.clone(),
            config,
            deps,
            inputs.clone(),
            bus.clone(),
        );
        let shutdown = Arc::new(Notify::new());
        let task = spawn_session(session, rx, shutdown.clone());
        debug!("Call handle started for {local_id} in {room_id}");
        Self {
            room_id,
            local_id,
            inputs,
            bus,
            shutdown,
            task: Some(task),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inputs
            .send(SessionInput::Command(make(tx)))
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }

    pub async fn join(&self) -> Result<()> {
        self.request(Command::Join).await
    }

    /// Новое состояние микрофона
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.request(Command::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(Command::ToggleVideo).await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(Command::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(Command::StopScreenShare).await
    }

    pub async fn share_location(&self, location: Value) -> Result<()> {
        self.request(|reply| Command::ShareLocation(location, reply))
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.bus.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.bus.watch()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.bus.snapshot()
    }

    /// Завершает звонок и ждёт освобождения ресурсов. Повторный вызов
    /// ничего не делает.
    pub async fn end(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(e) = task.await {
            debug!("Session task ended abnormally: {e}");
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown.notify_one();
        }
    }
}
