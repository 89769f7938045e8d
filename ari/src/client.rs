use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

#[derive(Deserialize, Clone, Debug)]
pub struct AriConfig {
    pub ari_host: String,
    pub ari_port: u16,
    pub ari_username: String,
    pub ari_password: String,
    pub app_name: String,
}

impl AriConfig {
    pub fn rest_base(&self) -> String {
        format!("http://{}:{}/ari", self.ari_host, self.ari_port)
    }

    pub fn events_url(&self) -> String {
        format!(
            "ws://{}:{}/ari/events?app={}&api_key={}:{}",
            self.ari_host,
            self.ari_port,
            self.app_name,
            self.ari_username,
            self.ari_password
        )
    }
}

/// Contract with the PBX control plane. All operations are
/// at-most-once: a failed create, destroy or play is reported to the
/// caller and never retried, since retrying an originate could place a
/// duplicate real-world call.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_channel(
        &self,
        id: &str,
        trunk: &str,
        to_number: &str,
        from_number: &str,
    ) -> Result<()>;

    async fn destroy_channel(&self, id: &str) -> bool;

    async fn play(&self, id: &str, media_uri: &str) -> bool;

    /// Probes whether the control plane still knows about our
    /// application registration.
    async fn get_application(&self) -> bool;
}

pub struct AriClient {
    config: AriConfig,
    http: reqwest::Client,
}

impl AriClient {
    pub fn new(config: AriConfig) -> AriClient {
        AriClient {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ControlPlane for AriClient {
    async fn create_channel(
        &self,
        id: &str,
        trunk: &str,
        to_number: &str,
        from_number: &str,
    ) -> Result<()> {
        // the channel id doubles as the appArgs so events for this
        // call can be correlated back to it
        let url = format!(
            "{}/channels/{}?endpoint=PJSIP/{}@{}&app={}&appArgs={}&callerId={}",
            self.config.rest_base(),
            id,
            to_number,
            trunk,
            self.config.app_name,
            id,
            from_number
        );
        let res = self
            .http
            .post(&url)
            .basic_auth(&self.config.ari_username, Some(&self.config.ari_password))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!("channel create for {} got {}", id, res.status()));
        }
        Ok(())
    }

    async fn destroy_channel(&self, id: &str) -> bool {
        let url = format!("{}/channels/{}", self.config.rest_base(), id);
        match self
            .http
            .delete(&url)
            .basic_auth(&self.config.ari_username, Some(&self.config.ari_password))
            .send()
            .await
        {
            Ok(res) => res.status().as_u16() == 204,
            Err(e) => {
                warn!(channel = %id, "channel destroy failed: {e}");
                false
            }
        }
    }

    async fn play(&self, id: &str, media_uri: &str) -> bool {
        let url = format!(
            "{}/channels/{}/play?media=sound:{}",
            self.config.rest_base(),
            id,
            media_uri
        );
        match self
            .http
            .post(&url)
            .basic_auth(&self.config.ari_username, Some(&self.config.ari_password))
            .send()
            .await
        {
            Ok(res) => res.status().as_u16() == 201,
            Err(e) => {
                warn!(channel = %id, "play request failed: {e}");
                false
            }
        }
    }

    async fn get_application(&self) -> bool {
        let url = format!(
            "{}/applications/{}",
            self.config.rest_base(),
            self.config.app_name
        );
        match self
            .http
            .get(&url)
            .basic_auth(&self.config.ari_username, Some(&self.config.ari_password))
            .send()
            .await
        {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        }
    }
}
