use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, warn};

use crate::client::{AriConfig, ControlPlane};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// One signalling message off the event stream. Only the fields we
/// dispatch on are decoded, everything else is ignored.
#[derive(Deserialize, Debug)]
pub struct AriEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub dialstatus: Option<String>,
    pub digit: Option<String>,
    pub peer: Option<EventChannel>,
    pub channel: Option<EventChannel>,
    pub args: Option<Vec<String>>,
    pub playback: Option<EventPlayback>,
}

#[derive(Deserialize, Debug)]
pub struct EventChannel {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct EventPlayback {
    pub target_uri: String,
}

impl AriEvent {
    /// The channel a message belongs to. Precedence: the peer leg,
    /// then the channel itself, then the stasis args, then the
    /// playback target (`...channel:<id>`).
    pub fn channel_id(&self) -> Option<String> {
        if let Some(peer) = &self.peer {
            return Some(peer.id.clone());
        }
        if let Some(channel) = &self.channel {
            return Some(channel.id.clone());
        }
        if let Some(args) = &self.args {
            return args.first().cloned();
        }
        if let Some(playback) = &self.playback {
            return playback
                .target_uri
                .split_once("channel:")
                .map(|(_, id)| id.to_string());
        }
        None
    }
}

/// Registered once at session startup; every recognized event type
/// maps to exactly one method. Handler failures are logged by the
/// session and never abort the receive loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_start(&self, channel_id: &str) -> Result<()>;
    async fn on_status_change(&self, status: &str, channel_id: &str) -> Result<()>;
    async fn on_dtmf_received(&self, channel_id: &str, digit: &str) -> Result<()>;
    async fn on_playback_finished(&self, channel_id: &str) -> Result<()>;
    async fn on_channel_destroyed(&self, channel_id: &str) -> Result<()>;
}

/// The one logical event connection to the control plane. Reconnects
/// with a fixed backoff on transport loss, and probes the application
/// registration every minute so a silent server-side deregistration
/// forces a fresh connection.
pub struct EventSession {
    url: String,
    control: Arc<dyn ControlPlane>,
    handler: Arc<dyn EventHandler>,
    stop: watch::Sender<bool>,
    rewire: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventSession {
    pub fn new(
        config: &AriConfig,
        control: Arc<dyn ControlPlane>,
        handler: Arc<dyn EventHandler>,
    ) -> EventSession {
        let (stop, _) = watch::channel(false);
        EventSession {
            url: config.events_url(),
            control,
            handler,
            stop,
            rewire: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Self::receive_loop(
            self.url.clone(),
            self.handler.clone(),
            self.stop.subscribe(),
            self.rewire.clone(),
        )));
        tasks.push(tokio::spawn(Self::health_loop(
            self.control.clone(),
            self.stop.subscribe(),
            self.rewire.clone(),
        )));
    }

    /// Cooperative shutdown: mark the session non-running, nudge the
    /// receive loop off the socket and wait for both background tasks
    /// so nothing is leaked.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        self.rewire.notify_waiters();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    async fn receive_loop(
        url: String,
        handler: Arc<dyn EventHandler>,
        mut stop: watch::Receiver<bool>,
        rewire: Arc<Notify>,
    ) {
        loop {
            if *stop.borrow() {
                break;
            }
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!("event session connected");
                    let (_, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(tungstenite::Message::Text(text))) => {
                                    match serde_json::from_str::<AriEvent>(&text) {
                                        Ok(event) => dispatch(handler.as_ref(), event).await,
                                        Err(e) => warn!("undecodable event: {e}"),
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("event transport error: {e}");
                                    break;
                                }
                                None => {
                                    warn!("event stream closed by control plane");
                                    break;
                                }
                            },
                            _ = rewire.notified() => {
                                info!("event session dropping connection to re-establish");
                                break;
                            }
                            _ = stop.changed() => break,
                        }
                    }
                }
                Err(e) => warn!("event session connect failed: {e}"),
            }
            if *stop.borrow() {
                break;
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
        info!("event session receive loop exited");
    }

    async fn health_loop(
        control: Arc<dyn ControlPlane>,
        mut stop: watch::Receiver<bool>,
        rewire: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_INTERVAL) => {
                    if !control.get_application().await {
                        warn!("application no longer registered with the control plane, forcing reconnect");
                        rewire.notify_waiters();
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }
}

/// Route one decoded event to its handler. Each invocation is
/// isolated: a failing handler is logged and the loop moves on.
async fn dispatch(handler: &dyn EventHandler, event: AriEvent) {
    let Some(channel_id) = event.channel_id() else {
        debug!(kind = %event.kind, "event without a channel id ignored");
        return;
    };
    if let Some(status) = event.dialstatus.as_deref() {
        if let Err(e) = handler.on_status_change(status, &channel_id).await {
            error!(channel = %channel_id, "status change handler failed: {e}");
        }
    }
    match event.kind.as_str() {
        "StasisStart" => {
            if let Err(e) = handler.on_start(&channel_id).await {
                error!(channel = %channel_id, "start handler failed: {e}");
            }
        }
        "ChannelDtmfReceived" => {
            let digit = event.digit.unwrap_or_default();
            if let Err(e) = handler.on_dtmf_received(&channel_id, &digit).await {
                error!(channel = %channel_id, "dtmf handler failed: {e}");
            }
        }
        "PlaybackFinished" => {
            if let Err(e) = handler.on_playback_finished(&channel_id).await {
                error!(channel = %channel_id, "playback handler failed: {e}");
            }
        }
        "ChannelDestroyed" => {
            if let Err(e) = handler.on_channel_destroyed(&channel_id).await {
                error!(channel = %channel_id, "destroy handler failed: {e}");
            }
        }
        other => debug!(kind = %other, "unhandled event type"),
    }
}
