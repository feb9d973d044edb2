//! Turn streaming for both backends.
//!
//! The polling backend has no push channel, so a turn is synthesized by
//! polling the activity endpoint until something new arrives or the turn
//! times out. The streaming backend already pushes named events; those are
//! relayed verbatim and only the terminal markers are added.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_proxy_directline::{Activity, DirectLineClient};
use agent_proxy_foundry::AgentsClient;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use crate::conversations::{ensure_token, ConversationRecord};
use crate::events::{BridgeEvent, EVENT_MESSAGE_COMPLETED, EVENT_MESSAGE_DELTA};
use crate::normalize::{completion_payload, delta_payload};

/// Cooperative cancellation shared between an SSE response body and the
/// task feeding it. Polling turns check the flag at the top of every
/// iteration; the streaming relay awaits `cancelled()` so a disconnect
/// interrupts an idle upstream stream immediately.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<CancelInner>);

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::Relaxed);
        // notify_one stores a permit, so a waiter that registers after
        // this call still wakes.
        self.0.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::Relaxed)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }
}

/// Sets the flag when dropped. Held by the SSE stream so that dropping the
/// response body cancels the backing poll task.
#[derive(Debug)]
pub struct CancelOnDrop(pub CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub struct PollingTurn {
    pub client: DirectLineClient,
    pub record: Arc<Mutex<ConversationRecord>>,
    pub poll_interval: Duration,
    pub stream_timeout: Duration,
    pub cancel: CancelFlag,
}

/// Emit an event and its `thread.`-prefixed twin. A closed receiver means
/// the client went away; the caller stops on `false`.
async fn emit(tx: &mpsc::Sender<BridgeEvent>, event: BridgeEvent) -> bool {
    let mirror = event.mirrored();
    if tx.send(event).await.is_err() {
        return false;
    }
    if let Some(mirror) = mirror {
        if tx.send(mirror).await.is_err() {
            return false;
        }
    }
    true
}

/// Terminal markers come mirror-first so subscribers keyed on the
/// `thread.` names see the run end before the unprefixed event lands.
async fn emit_terminal(tx: &mpsc::Sender<BridgeEvent>, status: &str) {
    let completed = BridgeEvent::run_completed(status);
    if let Some(mirror) = completed.mirrored() {
        let _ = tx.send(mirror).await;
    }
    let _ = tx.send(completed).await;
    let _ = tx.send(BridgeEvent::done()).await;
}

/// Run-lifecycle events carry the run object itself; step events
/// (`thread.run.step.*`) carry step state and must not be reported as the
/// final run.
fn is_run_lifecycle_event(name: &str) -> bool {
    name.starts_with("thread.run") && !name.starts_with("thread.run.step")
}

fn is_new_bot_message(activity: &Activity, user_id: &str, delivered: &dyn Fn(&str) -> bool) -> bool {
    let Some(id) = activity.id.as_deref() else {
        return false;
    };
    if delivered(id) {
        return false;
    }
    if !activity
        .activity_type
        .as_deref()
        .unwrap_or("")
        .eq_ignore_ascii_case("message")
    {
        return false;
    }
    match activity.from.as_ref().map(|from| from.id.as_str()) {
        Some(from_id) => from_id != user_id,
        None => true,
    }
}

/// Poll one conversational turn and push its events into `tx`.
///
/// Each iteration takes the record lock once: token check, activity fetch,
/// watermark advance, and delivered-set bookkeeping all happen inside the
/// critical section, so concurrent streams on the same conversation never
/// hand the same activity to two subscribers.
pub async fn run_polling_turn(turn: PollingTurn, tx: mpsc::Sender<BridgeEvent>) {
    let started = Instant::now();

    loop {
        if turn.cancel.is_cancelled() {
            return;
        }

        let fresh = {
            let mut record = turn.record.lock().await;
            if let Err(err) = ensure_token(&turn.client, &mut record).await {
                warn!(conversation_id = %record.id, error = %err, "token refresh failed mid-turn");
                let _ = tx.send(BridgeEvent::error(err.to_string())).await;
                return;
            }
            let set = match turn
                .client
                .activities(
                    &record.endpoint,
                    &record.token,
                    &record.id,
                    record.watermark.as_deref(),
                )
                .await
            {
                Ok(set) => set,
                Err(err) => {
                    warn!(conversation_id = %record.id, error = %err, "activity poll failed");
                    let _ = tx.send(BridgeEvent::error(err.to_string())).await;
                    return;
                }
            };
            if let Some(watermark) = set.watermark {
                record.watermark = Some(watermark);
            }

            let user_id = record.user_id.clone();
            let mut fresh = Vec::new();
            for activity in set.activities {
                let delivered = |id: &str| record.delivered.contains(id);
                if is_new_bot_message(&activity, &user_id, &delivered) {
                    if let Some(id) = activity.id.clone() {
                        record.delivered.insert(id);
                    }
                    fresh.push(activity);
                }
            }
            fresh
        };

        if !fresh.is_empty() {
            debug!(count = fresh.len(), "delivering new activities");
            for activity in &fresh {
                if let Some(delta) = delta_payload(activity) {
                    let data = serde_json::to_value(&delta).unwrap_or_default();
                    if !emit(&tx, BridgeEvent::new(EVENT_MESSAGE_DELTA, data)).await {
                        return;
                    }
                }
                if let Some(completion) = completion_payload(activity) {
                    let data = serde_json::to_value(&completion).unwrap_or_default();
                    if !emit(&tx, BridgeEvent::new(EVENT_MESSAGE_COMPLETED, data)).await {
                        return;
                    }
                }
            }
            emit_terminal(&tx, "completed").await;
            return;
        }

        if started.elapsed() > turn.stream_timeout {
            emit_terminal(&tx, "timeout").await;
            return;
        }

        tokio::time::sleep(turn.poll_interval).await;
    }
}

/// Relay a streaming-backend run: every native event under its native
/// name, then `run.completed` carrying the last seen run state, then
/// `done`. A mid-stream transport failure becomes one `error` event.
pub async fn run_streaming_relay(
    client: AgentsClient,
    thread_id: String,
    agent_id: String,
    cancel: CancelFlag,
    tx: mpsc::Sender<BridgeEvent>,
) {
    let stream = match client.stream_run(&thread_id, &agent_id).await {
        Ok(stream) => stream,
        Err(err) => {
            let details = err
                .upstream_body()
                .and_then(|body| serde_json::from_str(body).ok())
                .unwrap_or(serde_json::Value::Null);
            let _ = tx
                .send(BridgeEvent::error_with_details(err.to_string(), details))
                .await;
            return;
        }
    };
    futures::pin_mut!(stream);

    let mut final_run = serde_json::json!({});
    loop {
        // Dropping the stream on cancellation aborts the upstream request,
        // even while the backend is silent.
        let next = tokio::select! {
            next = stream.next() => next,
            () = cancel.cancelled() => return,
        };
        let Some(next) = next else {
            break;
        };
        match next {
            Ok(event) => {
                if is_run_lifecycle_event(&event.event) {
                    final_run = event.data.clone();
                }
                if tx.send(BridgeEvent::new(event.event, event.data)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(BridgeEvent::error(err.to_string())).await;
                return;
            }
        }
    }

    let _ = tx
        .send(BridgeEvent::new(
            crate::events::EVENT_RUN_COMPLETED,
            final_run,
        ))
        .await;
    let _ = tx.send(BridgeEvent::done()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_proxy_directline::ChannelAccount;

    #[test]
    fn drop_guard_sets_the_flag()  {
        let flag = CancelFlag::new();
        {
            let _guard = CancelOnDrop(flag.clone());
            assert!(!flag.is_cancelled());
        }
        assert!(flag.is_cancelled());
    }

    #[test]
    fn filter_rejects_own_and_delivered_activities() {
        let never = |_: &str| false;
        let always = |_: &str| true;

        let mut activity = Activity {
            id: Some("a1".to_string()),
            activity_type: Some("Message".to_string()),
            from: Some(ChannelAccount {
                id: "bot-1".to_string(),
            }),
            ..Default::default()
        };
        assert!(is_new_bot_message(&activity, "user-1", &never));
        assert!(!is_new_bot_message(&activity, "bot-1", &never));
        assert!(!is_new_bot_message(&activity, "user-1", &always));

        activity.from = None;
        assert!(is_new_bot_message(&activity, "user-1", &never));

        activity.activity_type = Some("typing".to_string());
        assert!(!is_new_bot_message(&activity, "user-1", &never));

        activity.activity_type = Some("message".to_string());
        activity.id = None;
        assert!(!is_new_bot_message(&activity, "user-1", &never));
    }

    #[test]
    fn step_events_are_not_run_lifecycle() {
        assert!(is_run_lifecycle_event("thread.run.created"));
        assert!(is_run_lifecycle_event("thread.run.completed"));
        assert!(!is_run_lifecycle_event("thread.run.step.created"));
        assert!(!is_run_lifecycle_event("thread.run.step.completed"));
        assert!(!is_run_lifecycle_event("thread.message.delta"));
    }

    async fn stalling_run_stream() -> impl axum::response::IntoResponse {
        let first = futures::stream::once(async {
            Ok::<_, std::io::Error>("event: thread.run.created\ndata: {\"id\":\"run-1\"}\n\n")
        });
        let body = axum::body::Body::from_stream(first.chain(futures::stream::pending()));
        ([("content-type", "text/event-stream")], body)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_relay_releases_a_silent_stream() {
        use agent_proxy_foundry::{AgentsClient, StaticTokenCredential};

        let router = axum::Router::new().route(
            "/api/projects/:project/threads/:thread/runs",
            axum::routing::post(stalling_run_stream),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let client = AgentsClient::new(
            reqwest::Client::new(),
            &format!("http://{addr}"),
            "proj-1",
            Arc::new(StaticTokenCredential::new("tok")),
        );
        let cancel = CancelFlag::new();
        let (tx, mut rx) = mpsc::channel(8);
        let relay = tokio::spawn(run_streaming_relay(
            client,
            "thread-1".to_string(),
            "agent-1".to_string(),
            cancel.clone(),
            tx,
        ));

        let first = rx.recv().await.expect("first event");
        assert_eq!(first.event, "thread.run.created");

        // The backend sends nothing more; cancellation alone must end the
        // relay.
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay ended after cancel")
            .expect("relay task");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_turn_emits_nothing() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let record = ConversationRecord::new(
            "c1".to_string(),
            None,
            "tok".to_string(),
            Some(1800),
            "http://127.0.0.1:9".to_string(),
            "user-1".to_string(),
            None,
            None,
        );
        let (tx, mut rx) = mpsc::channel(8);
        run_polling_turn(
            PollingTurn {
                client: DirectLineClient::default(),
                record: Arc::new(Mutex::new(record)),
                poll_interval: Duration::from_millis(10),
                stream_timeout: Duration::from_millis(50),
                cancel,
            },
            tx,
        )
        .await;
        assert!(rx.recv().await.is_none());
    }
}
