//! Shared desktop capture pipeline and its fan-out proxy.
//!
//! One capture pipeline serves every viewer of an OS session. The proxy keeps
//! the subscriber list in subscribe order, stamps frames with a capture
//! sequence so late subscribers never see earlier frames, serializes input
//! injection, and idles the pipeline when the last viewer leaves.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Capture parameters a viewer may adjust.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub frame_interval_ms: u32,
    pub enable_cursor: bool,
}

/// One captured artifact. Pixels are opaque to the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesktopFrame {
    pub screen_id: u32,
    pub sequence: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub id: u32,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardEvent {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Opaque injected input (already encoded for the injector collaborator).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    pub data: Vec<u8>,
}

/// Requests a viewer may issue against the shared pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesktopControl {
    SetConfig(CaptureConfig),
    InjectInput(InputEvent),
    SetClipboard(ClipboardEvent),
    SelectScreen { screen_id: u32 },
}

/// Events fanned out to subscribed viewers.
#[derive(Clone, Debug)]
pub enum DesktopEvent {
    Frame(Arc<DesktopFrame>),
    ScreenList(Vec<ScreenInfo>),
    Clipboard(ClipboardEvent),
}

/// The capture/input/clipboard drivers behind the proxy.
///
/// Real implementations talk to OS capture drivers and input injectors;
/// they live outside the core.
pub trait CapturePipeline: Send + Sync {
    fn start(&self);
    fn suspend(&self);
    fn resume(&self);
    fn stop(&self);
    fn set_config(&self, config: &CaptureConfig);
    fn inject_input(&self, event: &InputEvent);
    fn set_clipboard(&self, event: &ClipboardEvent);
    fn select_screen(&self, screen_id: u32);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CaptureState {
    Running,
    Idle,
    Stopped,
}

struct Subscriber {
    client_id: u32,
    /// Capture sequence at subscribe time; frames at or before it are
    /// withheld from this subscriber.
    joined_seq: u64,
    clipboard_allowed: bool,
    admin: bool,
    tx: mpsc::UnboundedSender<DesktopEvent>,
}

struct ProxyInner {
    subscribers: Vec<Subscriber>,
    sequence: u64,
    input_owner: Option<u32>,
    capture: CaptureState,
    /// Bumped on every subscribe; stale idle timers see a newer value and
    /// stand down.
    idle_generation: u64,
}

/// Fan-out point between one capture pipeline and N viewers.
///
/// Shared by the owning user session and every desktop client session; the
/// proxy outlives whichever holder is last.
pub struct DesktopSessionProxy {
    inner: Mutex<ProxyInner>,
    pipeline: Arc<dyn CapturePipeline>,
    idle_grace: Duration,
    weak_self: Weak<Self>,
}

impl DesktopSessionProxy {
    pub fn new(pipeline: Arc<dyn CapturePipeline>, idle_grace: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            inner: Mutex::new(ProxyInner {
                subscribers: Vec::new(),
                sequence: 0,
                input_owner: None,
                capture: CaptureState::Stopped,
                idle_generation: 0,
            }),
            pipeline,
            idle_grace,
            weak_self: weak_self.clone(),
        })
    }

    /// Add a viewer. Events arrive on the returned receiver, starting with
    /// the first frame captured after this call.
    pub fn subscribe(
        &self,
        client_id: u32,
        clipboard_allowed: bool,
        admin: bool,
    ) -> mpsc::UnboundedReceiver<DesktopEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("desktop proxy poisoned");
        inner.idle_generation += 1;
        match inner.capture {
            CaptureState::Stopped => self.pipeline.start(),
            CaptureState::Idle => self.pipeline.resume(),
            CaptureState::Running => {}
        }
        inner.capture = CaptureState::Running;
        let joined_seq = inner.sequence;
        inner.subscribers.push(Subscriber {
            client_id,
            joined_seq,
            clipboard_allowed,
            admin,
            tx,
        });
        rx
    }

    /// Remove a viewer. When the last one leaves, capture is suspended and a
    /// grace timer decides whether to stop it entirely.
    pub fn unsubscribe(&self, client_id: u32) {
        let mut inner = self.inner.lock().expect("desktop proxy poisoned");
        inner.subscribers.retain(|s| s.client_id != client_id);
        if inner.input_owner == Some(client_id) {
            inner.input_owner = None;
        }
        if inner.subscribers.is_empty() && inner.capture == CaptureState::Running {
            self.pipeline.suspend();
            inner.capture = CaptureState::Idle;
            let generation = inner.idle_generation;
            let weak = self.weak_self.clone();
            let grace = self.idle_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(proxy) = weak.upgrade() {
                    proxy.stop_if_still_idle(generation);
                }
            });
        }
    }

    fn stop_if_still_idle(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("desktop proxy poisoned");
        if inner.capture == CaptureState::Idle && inner.idle_generation == generation {
            self.pipeline.stop();
            inner.capture = CaptureState::Stopped;
            debug!("capture stopped after idle grace");
        }
    }

    /// Stop the pipeline unconditionally. Used on user-session teardown.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("desktop proxy poisoned");
        if inner.capture != CaptureState::Stopped {
            self.pipeline.stop();
            inner.capture = CaptureState::Stopped;
        }
        inner.subscribers.clear();
        inner.input_owner = None;
    }

    /// Reserve the sequence number for a frame at its capture instant.
    ///
    /// The capture worker calls this before encoding and hands the sequence
    /// back with the finished frame, so subscribe/frame ordering reflects
    /// capture time rather than delivery time.
    pub fn begin_capture(&self) -> u64 {
        let mut inner = self.inner.lock().expect("desktop proxy poisoned");
        inner.sequence += 1;
        inner.sequence
    }

    /// Fan a finished frame out to every subscriber that joined before it
    /// was captured, in subscribe order.
    pub fn handle_frame(&self, sequence: u64, screen_id: u32, data: Vec<u8>) {
        let frame = Arc::new(DesktopFrame {
            screen_id,
            sequence,
            data,
        });
        let inner = self.inner.lock().expect("desktop proxy poisoned");
        for sub in &inner.subscribers {
            if sub.joined_seq < sequence {
                let _ = sub.tx.send(DesktopEvent::Frame(frame.clone()));
            }
        }
    }

    /// Forward a clipboard capture to subscribers that are allowed to see it.
    pub fn handle_clipboard(&self, event: ClipboardEvent) {
        let inner = self.inner.lock().expect("desktop proxy poisoned");
        for sub in &inner.subscribers {
            if sub.clipboard_allowed {
                let _ = sub.tx.send(DesktopEvent::Clipboard(event.clone()));
            }
        }
    }

    pub fn handle_screen_list(&self, screens: Vec<ScreenInfo>) {
        let inner = self.inner.lock().expect("desktop proxy poisoned");
        for sub in &inner.subscribers {
            let _ = sub.tx.send(DesktopEvent::ScreenList(screens.clone()));
        }
    }

    /// Apply a viewer request to the pipeline, enforcing the per-viewer
    /// input and clipboard rules.
    pub fn control(&self, client_id: u32, request: DesktopControl) {
        let mut inner = self.inner.lock().expect("desktop proxy poisoned");
        let Some(position) = inner.subscribers.iter().position(|s| s.client_id == client_id) else {
            debug!(client_id, "control request from non-subscriber dropped");
            return;
        };
        match request {
            DesktopControl::InjectInput(event) => {
                let admin = inner.subscribers[position].admin;
                let owned = match inner.input_owner {
                    None => {
                        inner.input_owner = Some(client_id);
                        true
                    }
                    Some(owner) if owner == client_id => true,
                    Some(_) if admin => {
                        inner.input_owner = Some(client_id);
                        true
                    }
                    Some(_) => false,
                };
                if owned {
                    self.pipeline.inject_input(&event);
                } else {
                    debug!(client_id, "input dropped, another viewer holds the input slot");
                }
            }
            DesktopControl::SetClipboard(event) => {
                if inner.subscribers[position].clipboard_allowed {
                    self.pipeline.set_clipboard(&event);
                }
            }
            DesktopControl::SetConfig(config) => self.pipeline.set_config(&config),
            DesktopControl::SelectScreen { screen_id } => self.pipeline.select_screen(screen_id),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("desktop proxy poisoned").subscribers.len()
    }

    /// Weak handle for timers and capture workers.
    pub fn downgrade(&self) -> Weak<Self> {
        self.weak_self.clone()
    }
}

/// Pipeline that drives nothing. Stands in for the OS capture drivers when
/// the service runs headless and in tests.
#[derive(Default)]
pub struct NullCapturePipeline {
    calls: Mutex<Vec<&'static str>>,
}

impl NullCapturePipeline {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("call log poisoned").push(call);
    }
}

impl CapturePipeline for NullCapturePipeline {
    fn start(&self) {
        self.record("start");
    }
    fn suspend(&self) {
        self.record("suspend");
    }
    fn resume(&self) {
        self.record("resume");
    }
    fn stop(&self) {
        self.record("stop");
    }
    fn set_config(&self, _config: &CaptureConfig) {
        self.record("set_config");
    }
    fn inject_input(&self, _event: &InputEvent) {
        self.record("inject_input");
    }
    fn set_clipboard(&self, _event: &ClipboardEvent) {
        self.record("set_clipboard");
    }
    fn select_screen(&self, _screen_id: u32) {
        self.record("select_screen");
    }
}

/// Builds a capture pipeline for one OS session.
pub trait DesktopPipelineFactory: Send + Sync {
    fn create(&self, session_id: fv_types::SessionId) -> Arc<dyn CapturePipeline>;
}

/// Factory for the [`NullCapturePipeline`].
#[derive(Default)]
pub struct NullPipelineFactory;

impl DesktopPipelineFactory for NullPipelineFactory {
    fn create(&self, _session_id: fv_types::SessionId) -> Arc<dyn CapturePipeline> {
        Arc::new(NullCapturePipeline::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_with_log(grace: Duration) -> (Arc<DesktopSessionProxy>, Arc<NullCapturePipeline>) {
        let pipeline = Arc::new(NullCapturePipeline::default());
        let proxy = DesktopSessionProxy::new(pipeline.clone(), grace);
        (proxy, pipeline)
    }

    #[tokio::test]
    async fn frames_fan_out_in_subscribe_order() {
        let (proxy, _) = proxy_with_log(Duration::from_secs(30));
        let mut first = proxy.subscribe(1, true, false);
        let mut second = proxy.subscribe(2, true, false);
        let mut third = proxy.subscribe(3, true, false);

        let seq = proxy.begin_capture();
        proxy.handle_frame(seq, 0, vec![0xAB]);

        for rx in [&mut first, &mut second, &mut third] {
            match rx.recv().await.unwrap() {
                DesktopEvent::Frame(f) => {
                    assert_eq!(f.sequence, seq);
                    assert_eq!(f.data, vec![0xAB]);
                }
                other => panic!("unexpected event {other:?}"),
            }
            assert!(rx.try_recv().is_err(), "frame delivered more than once");
        }
    }

    #[tokio::test]
    async fn late_subscriber_never_sees_an_earlier_capture() {
        let (proxy, _) = proxy_with_log(Duration::from_secs(30));
        let mut early = proxy.subscribe(1, true, false);

        // Capture begins, then a viewer joins, then the frame lands.
        let seq = proxy.begin_capture();
        let mut late = proxy.subscribe(2, true, false);
        proxy.handle_frame(seq, 0, vec![1]);

        assert!(matches!(early.recv().await, Some(DesktopEvent::Frame(_))));
        assert!(late.try_recv().is_err());

        // The next capture reaches both.
        let seq2 = proxy.begin_capture();
        proxy.handle_frame(seq2, 0, vec![2]);
        assert!(matches!(late.recv().await, Some(DesktopEvent::Frame(_))));
    }

    #[tokio::test]
    async fn input_slot_is_first_come_with_admin_override() {
        let (proxy, pipeline) = proxy_with_log(Duration::from_secs(30));
        let _a = proxy.subscribe(1, true, false);
        let _b = proxy.subscribe(2, true, false);
        let _c = proxy.subscribe(3, true, true);

        let event = InputEvent { data: vec![1] };
        proxy.control(1, DesktopControl::InjectInput(event.clone()));
        proxy.control(2, DesktopControl::InjectInput(event.clone()));
        proxy.control(3, DesktopControl::InjectInput(event.clone()));

        let injections = pipeline.calls().iter().filter(|c| **c == "inject_input").count();
        assert_eq!(injections, 2, "owner and admin inject, bystander is dropped");
    }

    #[tokio::test]
    async fn clipboard_respects_subscriber_capability() {
        let (proxy, _) = proxy_with_log(Duration::from_secs(30));
        let mut allowed = proxy.subscribe(1, true, false);
        let mut denied = proxy.subscribe(2, false, false);

        proxy.handle_clipboard(ClipboardEvent {
            mime_type: "text/plain".into(),
            data: b"secret".to_vec(),
        });

        assert!(matches!(allowed.recv().await, Some(DesktopEvent::Clipboard(_))));
        assert!(denied.try_recv().is_err());
    }

    #[tokio::test]
    async fn capture_idles_then_stops_after_grace() {
        let (proxy, pipeline) = proxy_with_log(Duration::from_millis(20));
        let rx = proxy.subscribe(1, true, false);
        drop(rx);
        proxy.unsubscribe(1);

        assert!(pipeline.calls().contains(&"suspend"));
        assert!(!pipeline.calls().contains(&"stop"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pipeline.calls().contains(&"stop"));
    }

    #[tokio::test]
    async fn resubscribe_during_grace_resumes_instead_of_stopping() {
        let (proxy, pipeline) = proxy_with_log(Duration::from_millis(40));
        let rx = proxy.subscribe(1, true, false);
        drop(rx);
        proxy.unsubscribe(1);

        let _rx2 = proxy.subscribe(2, true, false);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(pipeline.calls().contains(&"resume"));
        assert!(!pipeline.calls().contains(&"stop"), "stale idle timer must stand down");
    }
}
