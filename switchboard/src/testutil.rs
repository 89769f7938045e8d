//! Counting fakes for the three outbound collaborators, shared by the
//! channel and switchboard tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use ari::client::ControlPlane;
use async_trait::async_trait;

use crate::callflow::ActionSource;
use crate::channel::{CallSpec, Channel, StatusCallback};

#[derive(Default)]
pub(crate) struct MockControl {
    pub refuse_create: bool,
    pub creates: Mutex<Vec<(String, String, String, String)>>,
    pub destroys: AtomicUsize,
    pub plays: Mutex<Vec<String>>,
}

#[async_trait]
impl ControlPlane for MockControl {
    async fn create_channel(
        &self,
        id: &str,
        trunk: &str,
        to_number: &str,
        from_number: &str,
    ) -> Result<()> {
        self.creates.lock().unwrap().push((
            id.to_string(),
            trunk.to_string(),
            to_number.to_string(),
            from_number.to_string(),
        ));
        if self.refuse_create {
            bail!("control plane refused the originate");
        }
        Ok(())
    }

    async fn destroy_channel(&self, _id: &str) -> bool {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn play(&self, _id: &str, media_uri: &str) -> bool {
        self.plays.lock().unwrap().push(media_uri.to_string());
        true
    }

    async fn get_application(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub(crate) struct MockActions {
    pub documents: Mutex<HashMap<String, String>>,
    pub fetches: Mutex<Vec<String>>,
}

#[async_trait]
impl ActionSource for MockActions {
    async fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let logged = if query.is_empty() {
            url.to_string()
        } else {
            format!("{}?{}", url, query.join("&"))
        };
        self.fetches.lock().unwrap().push(logged);
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no document at {url}"))
    }
}

#[derive(Default)]
pub(crate) struct MockCallback {
    pub notifications: Mutex<Vec<(String, Option<u64>)>>,
}

#[async_trait]
impl StatusCallback for MockCallback {
    async fn notify(&self, _url: &str, status: &str, duration: Option<u64>) {
        self.notifications
            .lock()
            .unwrap()
            .push((status.to_string(), duration));
    }
}

pub(crate) fn spec(action_url: &str) -> CallSpec {
    CallSpec {
        id: "chan-1".to_string(),
        trunk: "T1".to_string(),
        to_number: "555".to_string(),
        from_number: "100".to_string(),
        action_url: action_url.to_string(),
        status_callback: "http://x/cb".to_string(),
    }
}

/// A channel wired to fresh mocks, with `flow` served at the spec's
/// action URL.
pub(crate) fn harness(
    flow: &str,
) -> (
    Arc<Channel>,
    Arc<MockControl>,
    Arc<MockActions>,
    Arc<MockCallback>,
) {
    let control = Arc::new(MockControl::default());
    let actions = Arc::new(MockActions::default());
    actions
        .documents
        .lock()
        .unwrap()
        .insert("http://x/flow".to_string(), flow.to_string());
    let callback = Arc::new(MockCallback::default());
    let channel = Channel::new(
        spec("http://x/flow"),
        control.clone(),
        actions.clone(),
        callback.clone(),
    );
    (channel, control, actions, callback)
}
