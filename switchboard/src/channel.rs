use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ari::client::ControlPlane;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::callflow::{fetch_actions, Action, ActionSource, Verb};

/// Inbound request body for a new outbound call. The id is assigned
/// by the engine, never by the caller.
#[derive(Deserialize, Clone, Debug)]
pub struct CreateCall {
    pub trunk: String,
    pub to_number: String,
    pub from_number: String,
    pub action_url: String,
    pub status_callback: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct CallSpec {
    pub id: String,
    pub trunk: String,
    pub to_number: String,
    pub from_number: String,
    pub action_url: String,
    pub status_callback: String,
}

impl CallSpec {
    pub fn new(call: CreateCall) -> CallSpec {
        CallSpec {
            id: Uuid::new_v4().to_string(),
            trunk: call.trunk,
            to_number: call.to_number,
            from_number: call.from_number,
            action_url: call.action_url,
            status_callback: call.status_callback,
        }
    }
}

/// Fire-and-forget status notifications to the callback URL the
/// caller supplied. Failures are logged, never propagated.
#[async_trait]
pub trait StatusCallback: Send + Sync {
    async fn notify(&self, url: &str, status: &str, duration: Option<u64>);
}

#[derive(Default)]
pub struct HttpStatusCallback {
    http: reqwest::Client,
}

impl HttpStatusCallback {
    pub fn new() -> HttpStatusCallback {
        HttpStatusCallback::default()
    }
}

#[async_trait]
impl StatusCallback for HttpStatusCallback {
    async fn notify(&self, url: &str, status: &str, duration: Option<u64>) {
        let mut params = vec![("status".to_string(), status.to_string())];
        if let Some(secs) = duration {
            params.push(("CallDuration".to_string(), secs.to_string()));
        }
        if let Err(e) = self.http.get(url).query(&params).send().await {
            warn!("status callback to {url} failed: {e}");
        }
    }
}

struct GatherState {
    action: String,
    num_digits: usize,
    digits: Vec<String>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct ChannelState {
    running: bool,
    answered_at: Option<DateTime<Utc>>,
    hungup_at: Option<DateTime<Utc>>,
    duration: Option<u64>,
    gather: Option<GatherState>,
    queue: VecDeque<Action>,
    current: Option<Action>,
}

/// One live call leg. All mutable state sits behind a single mutex
/// because the event path and the gather timer both reach into it.
pub struct Channel {
    pub id: String,
    spec: CallSpec,
    control: Arc<dyn ControlPlane>,
    actions: Arc<dyn ActionSource>,
    callback: Arc<dyn StatusCallback>,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub fn new(
        spec: CallSpec,
        control: Arc<dyn ControlPlane>,
        actions: Arc<dyn ActionSource>,
        callback: Arc<dyn StatusCallback>,
    ) -> Arc<Channel> {
        Arc::new(Channel {
            id: spec.id.clone(),
            spec,
            control,
            actions,
            callback,
            state: Mutex::new(ChannelState {
                running: true,
                ..Default::default()
            }),
        })
    }

    pub fn spec(&self) -> &CallSpec {
        &self.spec
    }

    /// Originate the channel on the control plane. The caller must
    /// not publish this channel into the registry if this fails.
    pub async fn create(&self) -> Result<()> {
        self.control
            .create_channel(
                &self.id,
                &self.spec.trunk,
                &self.spec.to_number,
                &self.spec.from_number,
            )
            .await
    }

    /// The call was answered: stamp the answer time, fetch the action
    /// document and start executing it.
    pub async fn start(self: Arc<Channel>) {
        {
            let mut state = self.state.lock().await;
            if !state.running {
                return;
            }
            state.answered_at = Some(Utc::now());
        }
        let actions = fetch_actions(self.actions.as_ref(), &self.spec.action_url, &[]).await;
        {
            let mut state = self.state.lock().await;
            state.queue = actions.into();
        }
        self.run_next_action().await;
    }

    /// Advance the pipeline. Say completes synchronously so the loop
    /// keeps going; play and gather suspend until an event or timer
    /// resumes us; an empty queue ends the call.
    pub async fn run_next_action(self: Arc<Channel>) {
        loop {
            let action = {
                let mut state = self.state.lock().await;
                if !state.running {
                    return;
                }
                state.current = state.queue.pop_front();
                state.current.clone()
            };
            let Some(action) = action else {
                self.destroy().await;
                return;
            };
            info!(channel = %self.id, "executing {}", action.verb);
            match action.verb {
                Verb::Play => {
                    // continuation arrives as a playback-finished event
                    if self.control.play(&self.id, &action.text).await {
                        return;
                    }
                    warn!(channel = %self.id, "play failed, skipping to next action");
                }
                Verb::Say => {
                    info!(channel = %self.id, "say: {}", action.text);
                }
                Verb::Gather => {
                    if self.clone().gather(&action).await {
                        return;
                    }
                    self.destroy().await;
                    return;
                }
            }
        }
    }

    /// Arm a gather: digits now accumulate until `numDigits` are in or
    /// the timeout fires and tears the call down. Returns false when
    /// the verb's attributes are unusable.
    async fn gather(self: Arc<Channel>, action: &Action) -> bool {
        let attrs = (
            action.attr("action"),
            action
                .attr("numDigits")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0),
            action
                .attr("timeout")
                .and_then(|t| t.parse::<u64>().ok()),
        );
        let (Some(redirect_to), Some(num_digits), Some(timeout)) = attrs else {
            warn!(channel = %self.id, "gather with missing or invalid attributes");
            return false;
        };

        let mut state = self.state.lock().await;
        if !state.running {
            return true;
        }
        // at most one gather timer per channel
        if let Some(old) = state.gather.take() {
            old.timer.abort();
        }
        let chan = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout)).await;
            // taking the gather first means destroy() won't abort us
            // mid-teardown, and a completed gather means we do nothing
            let expired = chan.state.lock().await.gather.take().is_some();
            if expired {
                info!(channel = %chan.id, "gather timed out");
                chan.destroy().await;
            }
        });
        state.gather = Some(GatherState {
            action: redirect_to.to_string(),
            num_digits,
            digits: Vec::new(),
            timer,
        });
        true
    }

    /// A digit arrived. Digits are appended in arrival order; the
    /// final one cancels the timer and redirects with the joined
    /// string.
    pub async fn append_digit(self: Arc<Channel>, digit: &str) {
        let completed = {
            let mut state = self.state.lock().await;
            if !state.running {
                return;
            }
            let Some(gather) = state.gather.as_mut() else {
                return;
            };
            gather.digits.push(digit.to_string());
            if gather.digits.len() < gather.num_digits {
                None
            } else if let Some(gather) = state.gather.take() {
                gather.timer.abort();
                Some((gather.action, gather.digits.concat()))
            } else {
                None
            }
        };
        if let Some((url, digits)) = completed {
            self.redirect(&url, &[("Digits", digits.as_str())]).await;
        }
    }

    /// Replace the pending queue with a freshly fetched document and
    /// keep executing.
    pub async fn redirect(self: Arc<Channel>, url: &str, params: &[(&str, &str)]) {
        let actions = fetch_actions(self.actions.as_ref(), url, params).await;
        {
            let mut state = self.state.lock().await;
            if !state.running {
                return;
            }
            state.queue = actions.into();
            state.current = None;
        }
        self.run_next_action().await;
    }

    /// Tear the call down. Idempotent: only the first call computes
    /// the duration, destroys the channel on the control plane and
    /// notifies the status callback.
    pub async fn destroy(&self) {
        let duration = {
            let mut state = self.state.lock().await;
            if !state.running {
                return;
            }
            state.running = false;
            if let Some(gather) = state.gather.take() {
                gather.timer.abort();
            }
            let hungup_at = Utc::now();
            state.hungup_at = Some(hungup_at);
            let duration = match state.answered_at {
                Some(answered_at) => {
                    let millis = (hungup_at - answered_at).num_milliseconds().max(0) as u64;
                    millis.div_ceil(1000)
                }
                None => 0,
            };
            state.duration = Some(duration);
            duration
        };
        if !self.control.destroy_channel(&self.id).await {
            warn!(channel = %self.id, "control plane did not confirm channel destroy");
        }
        self.callback
            .notify(&self.spec.status_callback, "completed", Some(duration))
            .await;
    }

    /// Forward an intermediate dial status to the caller's callback.
    pub async fn notify_status(&self, status: &str) {
        self.callback
            .notify(&self.spec.status_callback, status, None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (channel, control, _actions, callback) = harness("<Response/>");
        channel.destroy().await;
        channel.destroy().await;
        assert_eq!(1, control.destroys.load(Ordering::SeqCst));
        let notifications = callback.notifications.lock().unwrap().clone();
        assert_eq!(vec![("completed".to_string(), Some(0))], notifications);
        // never answered, so the duration is zero and set exactly once
        assert_eq!(Some(0), channel.state.lock().await.duration);
    }

    #[tokio::test]
    async fn empty_document_ends_the_call() {
        let (channel, control, _actions, callback) = harness("<Response/>");
        channel.clone().start().await;
        assert_eq!(1, control.destroys.load(Ordering::SeqCst));
        assert_eq!(1, callback.notifications.lock().unwrap().len());
        assert!(channel.state.lock().await.answered_at.is_some());
    }

    #[tokio::test]
    async fn unreachable_document_ends_the_call() {
        let (channel, control, actions, _callback) = harness("<Response/>");
        actions.documents.lock().unwrap().clear();
        channel.clone().start().await;
        assert_eq!(1, control.destroys.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn playback_finished_advances_past_play() {
        let (channel, control, _actions, callback) =
            harness("<Response><Play>a.wav</Play><Say>hi</Say></Response>");
        channel.clone().start().await;
        assert_eq!(
            vec!["a.wav".to_string()],
            control.plays.lock().unwrap().clone()
        );
        assert_eq!(0, control.destroys.load(Ordering::SeqCst));

        // the playback-finished event resumes the pipeline; say
        // completes synchronously and the exhausted queue tears down
        channel.clone().run_next_action().await;
        assert_eq!(1, control.destroys.load(Ordering::SeqCst));
        let notifications = callback.notifications.lock().unwrap().clone();
        assert_eq!(1, notifications.len());
        assert_eq!("completed", notifications[0].0);
    }

    #[tokio::test(start_paused = true)]
    async fn gather_redirects_once_digits_are_in() {
        let (channel, control, actions, _callback) = harness(
            "<Response><Gather action=\"http://x/next\" numDigits=\"3\" timeout=\"5\"/></Response>",
        );
        actions.documents.lock().unwrap().insert(
            "http://x/next".to_string(),
            "<Response><Play>b.wav</Play></Response>".to_string(),
        );
        channel.clone().start().await;
        channel.clone().append_digit("1").await;
        channel.clone().append_digit("2").await;
        assert_eq!(0, control.destroys.load(Ordering::SeqCst));

        channel.clone().append_digit("3").await;
        let fetches = actions.fetches.lock().unwrap().clone();
        assert_eq!(
            vec![
                "http://x/flow".to_string(),
                "http://x/next?Digits=123".to_string(),
            ],
            fetches
        );
        assert_eq!(
            vec!["b.wav".to_string()],
            control.plays.lock().unwrap().clone()
        );

        // the gather timer was cancelled, so time passing changes nothing
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(0, control.destroys.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn gather_timeout_tears_down_without_redirect() {
        let (channel, control, actions, _callback) = harness(
            "<Response><Gather action=\"http://x/next\" numDigits=\"2\" timeout=\"5\"/></Response>",
        );
        channel.clone().start().await;
        channel.clone().append_digit("1").await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(1, control.destroys.load(Ordering::SeqCst));
        // only the initial document was ever fetched
        assert_eq!(
            vec!["http://x/flow".to_string()],
            actions.fetches.lock().unwrap().clone()
        );
    }

    #[tokio::test]
    async fn gather_with_bad_attributes_ends_the_call() {
        let (channel, control, _actions, _callback) =
            harness("<Response><Gather action=\"http://x/next\" numDigits=\"zero\"/></Response>");
        channel.clone().start().await;
        assert_eq!(1, control.destroys.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn digits_outside_a_gather_are_ignored() {
        let (channel, control, _actions, _callback) =
            harness("<Response><Play>a.wav</Play></Response>");
        channel.clone().start().await;
        channel.clone().append_digit("9").await;
        assert_eq!(0, control.destroys.load(Ordering::SeqCst));
        assert!(channel.state.lock().await.gather.is_none());
    }

    #[tokio::test]
    async fn no_dispatch_after_teardown() {
        let (channel, control, _actions, _callback) =
            harness("<Response><Play>a.wav</Play></Response>");
        channel.clone().start().await;
        channel.destroy().await;
        control.plays.lock().unwrap().clear();
        channel.clone().run_next_action().await;
        assert!(control.plays.lock().unwrap().is_empty());
    }

    #[test]
    fn spec_gets_a_fresh_id() {
        let call = CreateCall {
            trunk: "T1".to_string(),
            to_number: "555".to_string(),
            from_number: "100".to_string(),
            action_url: "http://x/flow".to_string(),
            status_callback: "http://x/cb".to_string(),
        };
        let a = CallSpec::new(call.clone());
        let b = CallSpec::new(call);
        assert_ne!(a.id, b.id);
        assert_eq!("T1", a.trunk);
        assert_eq!("555", a.to_number);
    }
}
