// Локальная проверка: два участника в одной комнате через LocalRelay,
// синтетические источники, настоящий webrtc стек.

use anyhow::{bail, Context};
use ssc_call::commands::CallHandle;
use ssc_call::config::CallConfig;
use ssc_call::events::CallEvent;
use ssc_call::logger::init_logging;
use ssc_call::media::devices_for;
use ssc_call::peer::{CallState, RtcTransportFactory};
use ssc_call::session::SessionDeps;
use ssc_call::signaling::LocalRelay;
use ssc_call::utils::random_id;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONFIG_ENV: &str = "SSC_CALL_CONFIG";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CALL_SECONDS: u64 = 5;

fn load_config() -> anyhow::Result<CallConfig> {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => CallConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.to_string_lossy()))?,
        None => CallConfig::default(),
    };
    config.apply_query("?test=1");
    config.validate()?;
    Ok(config)
}

fn participant(relay: &LocalRelay, room_id: &str, config: &CallConfig) -> anyhow::Result<CallHandle> {
    let id = random_id();
    let deps = SessionDeps {
        signaling: Arc::new(relay.channel(room_id, id.clone())),
        transports: Arc::new(RtcTransportFactory::new(config)),
        devices: devices_for(config, None).context("demo has no hardware capture")?,
    };
    Ok(CallHandle::start(room_id, id, config.clone(), deps))
}

async fn wait_for_state(call: &CallHandle, state: CallState) -> anyhow::Result<()> {
    let mut snapshot = call.watch();
    let reached = tokio::time::timeout(CONNECT_TIMEOUT, async {
        snapshot.wait_for(|s| s.state == state).await.map(|_| ())
    })
    .await;
    match reached {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => bail!("session {} stopped", call.local_id()),
        Err(_) => bail!(
            "{} did not reach {state:?} within {}s",
            call.local_id(),
            CONNECT_TIMEOUT.as_secs()
        ),
    }
}

fn log_events(call: &CallHandle) -> JoinHandle<()> {
    let mut events = call.subscribe();
    let who = call.local_id().to_owned();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::Quality { sample, bucket }) => info!(
                    "[{who}] quality {bucket:?}: {:.0} kbps, rtt {:.0} ms, lost {}",
                    sample.bitrate_kbps, sample.round_trip_ms, sample.packet_loss_count
                ),
                Ok(event) => debug!("[{who}] {event:?}"),
                Err(RecvError::Lagged(n)) => warn!("[{who}] skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = load_config()?;
    let seconds = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("call length must be a number of seconds, got '{arg}'"))?,
        None => DEFAULT_CALL_SECONDS,
    };

    let relay = LocalRelay::new();
    let room_id = random_id();
    let mut alice = participant(&relay, &room_id, &config)?;
    let mut bob = participant(&relay, &room_id, &config)?;
    let loggers = [log_events(&alice), log_events(&bob)];
    info!("Room {room_id}: {} and {}", alice.local_id(), bob.local_id());

    alice.join().await.context("first participant failed to join")?;
    bob.join().await.context("second participant failed to join")?;

    wait_for_state(&alice, CallState::Connected).await?;
    wait_for_state(&bob, CallState::Connected).await?;
    info!("Both participants connected");

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    alice.start_screen_share().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    alice.stop_screen_share().await?;
    let audio = bob.toggle_audio().await?;
    info!("Second participant microphone enabled: {audio}");
    tokio::time::sleep(Duration::from_secs(1)).await;

    let summary = serde_json::to_string_pretty(&alice.snapshot())?;
    info!("Final snapshot:\n{summary}");

    alice.end().await;
    bob.end().await;
    for logger in loggers {
        logger.abort();
    }
    info!("Demo finished");
    Ok(())
}
