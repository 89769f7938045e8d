use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use ari::client::ControlPlane;
use ari::events::EventHandler;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::callflow::ActionSource;
use crate::channel::{CallSpec, Channel, CreateCall, StatusCallback};

/// The set of live channels, shared between the inbound CRUD path and
/// the event dispatch path. One coarse lock is plenty at signalling
/// volumes.
#[derive(Default)]
pub struct Registry {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Registry {
    pub async fn register(&self, channel: Arc<Channel>) {
        self.channels
            .lock()
            .await
            .insert(channel.id.clone(), channel);
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty()
    }
}

/// Owns the registry and the outbound collaborators, and is the
/// event-session handler: every signalling event resolves to a
/// registered channel (or is dropped) here.
pub struct Switchboard {
    registry: Registry,
    control: Arc<dyn ControlPlane>,
    actions: Arc<dyn ActionSource>,
    callback: Arc<dyn StatusCallback>,
}

impl Switchboard {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        actions: Arc<dyn ActionSource>,
        callback: Arc<dyn StatusCallback>,
    ) -> Switchboard {
        Switchboard {
            registry: Registry::default(),
            control,
            actions,
            callback,
        }
    }

    /// Assign an id, originate the channel and publish it. A channel
    /// the control plane refused never becomes visible.
    pub async fn create_call(&self, call: CreateCall) -> Result<CallSpec> {
        let spec = CallSpec::new(call);
        let channel = Channel::new(
            spec.clone(),
            self.control.clone(),
            self.actions.clone(),
            self.callback.clone(),
        );
        channel.create().await?;
        self.registry.register(channel).await;
        info!(channel = %spec.id, to = %spec.to_number, "outbound call created");
        Ok(spec)
    }

    /// Returns false when the id is unknown, including a call that
    /// already tore itself down.
    pub async fn delete_call(&self, id: &str) -> bool {
        let Some(channel) = self.registry.lookup(id).await else {
            return false;
        };
        channel.destroy().await;
        self.registry.remove(id).await;
        true
    }
}

#[async_trait]
impl EventHandler for Switchboard {
    async fn on_start(&self, channel_id: &str) -> Result<()> {
        if let Some(channel) = self.registry.lookup(channel_id).await {
            channel.start().await;
        }
        Ok(())
    }

    async fn on_status_change(&self, status: &str, channel_id: &str) -> Result<()> {
        if let Some(channel) = self.registry.lookup(channel_id).await {
            let status = if status == "PROGRESS" { "ringing" } else { status };
            channel.notify_status(status).await;
        }
        Ok(())
    }

    async fn on_dtmf_received(&self, channel_id: &str, digit: &str) -> Result<()> {
        if let Some(channel) = self.registry.lookup(channel_id).await {
            channel.append_digit(digit).await;
        }
        Ok(())
    }

    async fn on_playback_finished(&self, channel_id: &str) -> Result<()> {
        if let Some(channel) = self.registry.lookup(channel_id).await {
            channel.run_next_action().await;
        }
        Ok(())
    }

    async fn on_channel_destroyed(&self, channel_id: &str) -> Result<()> {
        if let Some(channel) = self.registry.lookup(channel_id).await {
            channel.destroy().await;
            self.registry.remove(channel_id).await;
        }
        Ok(())
    }
}
