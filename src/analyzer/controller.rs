use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::settings::LiveFeedSettings;

use super::live_loop::{live_feed_loop, LiveLoopContext};
use super::{
    AnalysisError, AnalysisEvent, AnalysisResult, Classifier, ImageSource, SensorSample,
    SessionMode, SessionPhase, SessionState,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

/// Gates analysis behind a signed-in user.
pub trait AuthGate: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Receives completed analyses for persistence. Calls are fire-and-forget
/// from the session's perspective; failures are logged, never surfaced
/// back into session state.
#[async_trait::async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, user_id: &str, event: &AnalysisEvent) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AnalyzerEvent {
    StateChanged { state: SessionState },
    AnalysisCompleted { event: AnalysisEvent },
}

struct LiveFeed {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives the analysis workflow: acquire an image, run the classifier,
/// publish the outcome. Owns the session state exclusively and the
/// recurring live-capture loop.
///
/// Completions are applied in whatever order they arrive; the visible
/// state always reflects the most recently *completed* cycle. Every
/// completion path compares the epoch captured at cycle start against the
/// current one (bumped by `reset()`/`stop()`) and discards stale results.
#[derive(Clone)]
pub struct AnalyzerController {
    state: Arc<Mutex<SessionState>>,
    epoch: Arc<AtomicU64>,
    image_source: Arc<dyn ImageSource>,
    classifier: Arc<dyn Classifier>,
    auth: Arc<dyn AuthGate>,
    history: Arc<dyn HistorySink>,
    live: Arc<Mutex<Option<LiveFeed>>>,
    live_settings: LiveFeedSettings,
    events: broadcast::Sender<AnalyzerEvent>,
    last_emitted_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl AnalyzerController {
    pub fn new(
        image_source: Arc<dyn ImageSource>,
        classifier: Arc<dyn Classifier>,
        auth: Arc<dyn AuthGate>,
        history: Arc<dyn HistorySink>,
        live_settings: LiveFeedSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            state: Arc::new(Mutex::new(SessionState::default())),
            epoch: Arc::new(AtomicU64::new(0)),
            image_source,
            classifier,
            auth,
            history,
            live: Arc::new(Mutex::new(None)),
            live_settings,
            events,
            last_emitted_at: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalyzerEvent> {
        self.events.subscribe()
    }

    pub async fn get_state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// One manual analysis: read and decode the file, then hand the bytes
    /// to the classifier. The outcome lands in session state; a failure of
    /// the cycle itself is not an error of this method.
    pub async fn start_upload(&self, path: &Path) -> Result<()> {
        let user_id = self.require_user()?;
        let epoch = self.epoch.load(Ordering::SeqCst);

        {
            let mut state = self.state.lock().await;
            if state.phase != SessionPhase::Idle {
                bail!("analysis session already active");
            }
            state.mode = SessionMode::Upload;
            state.begin_loading();
            self.emit_state(&state);
        }

        let captured = match self.image_source.acquire_from_upload(path).await {
            Ok(captured) => captured,
            Err(err) => {
                self.apply_cycle_error(epoch, err).await;
                return Ok(());
            }
        };

        {
            let mut state = self.state.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                log_info!("upload superseded by reset before analysis started");
                return Ok(());
            }
            state.begin_analysis(captured.display_ref.clone());
            self.emit_state(&state);
        }

        self.spawn_analysis(epoch, user_id, captured.bytes, captured.display_ref);
        Ok(())
    }

    /// Connect to the simulated device feed and begin recurring
    /// capture-analyze cycles. Returns once the loop is armed; the
    /// handshake and cycles run in the background.
    pub async fn start_live(&self) -> Result<()> {
        let user_id = self.require_user()?;

        let mut live = self.live.lock().await;
        if live.is_some() {
            bail!("live feed already running");
        }

        {
            let mut state = self.state.lock().await;
            if state.phase != SessionPhase::Idle {
                bail!("analysis session already active");
            }
            state.mode = SessionMode::Live;
            state.begin_connecting();
            self.emit_state(&state);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let cancel_token = CancellationToken::new();
        let context = LiveLoopContext {
            controller: self.clone(),
            image_source: Arc::clone(&self.image_source),
            user_id,
            epoch,
            settings: self.live_settings.clone(),
        };

        let handle = tokio::spawn(live_feed_loop(context, cancel_token.clone()));
        *live = Some(LiveFeed {
            cancel_token,
            handle,
        });
        Ok(())
    }

    /// Live-mode exit: cancel the recurring loop, clear connection state,
    /// keep the selected mode. In-flight analyses are not cancelled; their
    /// late completions are discarded by the epoch check.
    pub async fn stop(&self) -> Result<()> {
        if !self.cancel_live().await? {
            bail!("live feed is not running");
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        state.disconnect();
        self.emit_state(&state);
        Ok(())
    }

    /// Clears all transient state and returns to mode selection.
    /// Idempotent; safe to call with or without a live loop armed.
    pub async fn reset(&self) -> Result<()> {
        self.cancel_live().await?;
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        state.reset();
        self.emit_state(&state);
        Ok(())
    }

    pub(crate) fn spawn_analysis(
        &self,
        epoch: u64,
        user_id: String,
        bytes: Vec<u8>,
        image: String,
    ) {
        let controller = self.clone();
        tokio::spawn(async move {
            match controller.classifier.analyze(&bytes).await {
                Ok(result) => {
                    controller
                        .apply_cycle_result(epoch, &user_id, result, image)
                        .await;
                }
                Err(err) => controller.apply_cycle_error(epoch, err).await,
            }
        });
    }

    pub(crate) async fn apply_live_capture(
        &self,
        epoch: u64,
        sample: SensorSample,
        image: String,
    ) -> bool {
        let mut state = self.state.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        state.set_sample(sample);
        state.begin_analysis(image);
        self.emit_state(&state);
        true
    }

    pub(crate) async fn mark_connected(&self, epoch: u64) {
        let mut state = self.state.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        state.mark_connected();
        self.emit_state(&state);
    }

    pub(crate) async fn apply_cycle_error(&self, epoch: u64, error: AnalysisError) {
        let mut state = self.state.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            log_info!("discarding stale cycle error: {error}");
            return;
        }
        state.apply_error(error);
        self.emit_state(&state);
    }

    async fn apply_cycle_result(
        &self,
        epoch: u64,
        user_id: &str,
        result: AnalysisResult,
        image: String,
    ) {
        let event = {
            let mut state = self.state.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                log_info!("discarding stale analysis result");
                return;
            }
            state.apply_result(result.clone());
            self.emit_state(&state);

            AnalysisEvent {
                id: Uuid::new_v4().to_string(),
                result,
                image,
                timestamp: self.next_event_timestamp().await,
            }
        };

        let _ = self.events.send(AnalyzerEvent::AnalysisCompleted {
            event: event.clone(),
        });

        let history = Arc::clone(&self.history);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = history.record(&user_id, &event).await {
                log_error!("failed to record analysis event: {err:#}");
            }
        });
    }

    /// Completion timestamps are strictly increasing within a session;
    /// same-instant completions are nudged forward a millisecond.
    async fn next_event_timestamp(&self) -> DateTime<Utc> {
        let mut guard = self.last_emitted_at.lock().await;
        let mut now = Utc::now();
        if let Some(last) = *guard {
            if now <= last {
                now = last + ChronoDuration::milliseconds(1);
            }
        }
        *guard = Some(now);
        now
    }

    /// Cancels the recurring live loop and waits for it to wind down, so
    /// no new cycle can start after this returns. Returns whether a loop
    /// was actually running.
    async fn cancel_live(&self) -> Result<bool> {
        let feed = self.live.lock().await.take();
        let Some(feed) = feed else {
            return Ok(false);
        };
        feed.cancel_token.cancel();
        feed.handle
            .await
            .context("live feed loop failed to join")?;
        Ok(true)
    }

    fn require_user(&self) -> Result<String> {
        self.auth
            .current_user_id()
            .ok_or_else(|| anyhow!("no user is signed in"))
    }

    fn emit_state(&self, state: &SessionState) {
        let _ = self.events.send(AnalyzerEvent::StateChanged {
            state: state.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::CapturedImage;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, timeout, Duration};

    struct StubImageSource;

    #[async_trait::async_trait]
    impl ImageSource for StubImageSource {
        async fn acquire_from_upload(&self, _path: &Path) -> Result<CapturedImage, AnalysisError> {
            Ok(CapturedImage {
                bytes: vec![1, 2, 3],
                display_ref: "data:image/jpeg;base64,AQID".into(),
            })
        }

        async fn acquire_from_live_feed(&self) -> Result<CapturedImage, AnalysisError> {
            Ok(CapturedImage {
                bytes: vec![4, 5, 6],
                display_ref: "https://feed.local/frame".into(),
            })
        }
    }

    struct FailingImageSource;

    #[async_trait::async_trait]
    impl ImageSource for FailingImageSource {
        async fn acquire_from_upload(&self, path: &Path) -> Result<CapturedImage, AnalysisError> {
            Err(AnalysisError::Read(format!("{}: unreadable", path.display())))
        }

        async fn acquire_from_live_feed(&self) -> Result<CapturedImage, AnalysisError> {
            Err(AnalysisError::Capture("feed offline".into()))
        }
    }

    type ScriptedOutcome = (Duration, Result<AnalysisResult, AnalysisError>);

    /// Replays scripted (delay, outcome) pairs in call order, then falls
    /// back to an instant healthy result.
    struct StubClassifier {
        script: StdMutex<VecDeque<ScriptedOutcome>>,
    }

    impl StubClassifier {
        fn scripted(outcomes: Vec<ScriptedOutcome>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(outcomes.into()),
            })
        }

        fn always_ok(result: AnalysisResult) -> Arc<Self> {
            Self::scripted(vec![(Duration::ZERO, Ok(result))])
        }
    }

    #[async_trait::async_trait]
    impl Classifier for StubClassifier {
        async fn analyze(&self, _bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some((delay, outcome)) => {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    outcome
                }
                None => Ok(diagnosis("Healthy Plant")),
            }
        }
    }

    struct StubAuth(Option<String>);

    impl AuthGate for StubAuth {
        fn current_user_id(&self) -> Option<String> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        records: StdMutex<Vec<(String, AnalysisEvent)>>,
    }

    impl RecordingSink {
        fn len(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl HistorySink for RecordingSink {
        async fn record(&self, user_id: &str, event: &AnalysisEvent) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .push((user_id.to_string(), event.clone()));
            Ok(())
        }
    }

    fn diagnosis(issue: &str) -> AnalysisResult {
        AnalysisResult {
            is_healthy: issue == "Healthy Plant",
            issue_name: issue.into(),
            description: format!("Diagnosis: {issue}."),
            recommendations: vec!["Water twice a week".into()],
        }
    }

    fn fast_live_settings() -> LiveFeedSettings {
        LiveFeedSettings {
            url: "https://feed.local/frame".into(),
            connect_delay_ms: 100,
            capture_interval_secs: 5,
            capture_timeout_secs: 10,
        }
    }

    fn controller_with(
        image_source: Arc<dyn ImageSource>,
        classifier: Arc<dyn Classifier>,
        sink: Arc<RecordingSink>,
    ) -> AnalyzerController {
        AnalyzerController::new(
            image_source,
            classifier,
            Arc::new(StubAuth(Some("user-1".into()))),
            sink,
            fast_live_settings(),
        )
    }

    async fn next_completed(events: &mut broadcast::Receiver<AnalyzerEvent>) -> AnalysisEvent {
        loop {
            match timeout(Duration::from_secs(120), events.recv()).await {
                Ok(Ok(AnalyzerEvent::AnalysisCompleted { event })) => return event,
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(err)) => panic!("event channel closed: {err}"),
                Err(_) => panic!("timed out waiting for a completed analysis"),
            }
        }
    }

    async fn wait_for_phase(controller: &AnalyzerController, expected: SessionPhase) {
        for _ in 0..200 {
            if controller.get_state().await.phase == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {expected:?}");
    }

    async fn wait_for_records(sink: &RecordingSink, expected: usize) {
        for _ in 0..200 {
            if sink.len() >= expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("history sink never received {expected} events");
    }

    #[tokio::test(start_paused = true)]
    async fn upload_success_emits_exactly_one_event() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::always_ok(diagnosis("Leaf Spot"));
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));
        let mut events = controller.subscribe();

        controller.start_upload(Path::new("plant.jpg")).await.unwrap();

        let event = next_completed(&mut events).await;
        assert_eq!(event.result.issue_name, "Leaf Spot");
        assert_eq!(event.image, "data:image/jpeg;base64,AQID");

        let state = controller.get_state().await;
        assert_eq!(state.phase, SessionPhase::Complete);
        assert_eq!(state.current_result, Some(diagnosis("Leaf Spot")));
        assert!(state.current_error.is_none());

        wait_for_records(&sink, 1).await;
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records.lock().unwrap()[0].0, "user-1");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_image_result_flows_through_unchanged() {
        let rejected = AnalysisResult {
            is_healthy: false,
            issue_name: "Invalid Image".into(),
            description: "The uploaded image is not a real photograph of a plant.".into(),
            recommendations: Vec::new(),
        };
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::always_ok(rejected.clone());
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));
        let mut events = controller.subscribe();

        controller.start_upload(Path::new("cartoon.jpg")).await.unwrap();

        let event = next_completed(&mut events).await;
        assert_eq!(event.result, rejected);
        assert!(event.result.recommendations.is_empty());
        assert_eq!(controller.get_state().await.phase, SessionPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_failure_surfaces_and_records_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::scripted(vec![(
            Duration::from_secs(1),
            Err(AnalysisError::Provider),
        )]);
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));

        controller.start_upload(Path::new("plant.jpg")).await.unwrap();
        wait_for_phase(&controller, SessionPhase::Error).await;

        let state = controller.get_state().await;
        assert_eq!(state.current_error, Some(AnalysisError::Provider));
        assert!(state.current_result.is_none());
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_upload_ends_in_read_error() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::always_ok(diagnosis("Leaf Spot"));
        let controller =
            controller_with(Arc::new(FailingImageSource), classifier, Arc::clone(&sink));

        controller.start_upload(Path::new("broken.jpg")).await.unwrap();
        wait_for_phase(&controller, SessionPhase::Error).await;

        let state = controller.get_state().await;
        assert!(matches!(state.current_error, Some(AnalysisError::Read(_))));
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn signed_out_user_cannot_start() {
        let controller = AnalyzerController::new(
            Arc::new(StubImageSource),
            StubClassifier::always_ok(diagnosis("Leaf Spot")),
            Arc::new(StubAuth(None)),
            Arc::new(RecordingSink::default()),
            fast_live_settings(),
        );

        assert!(controller.start_upload(Path::new("plant.jpg")).await.is_err());
        assert!(controller.start_live().await.is_err());
        assert_eq!(controller.get_state().await.phase, SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::always_ok(diagnosis("Leaf Spot"));
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));
        let mut events = controller.subscribe();

        controller.start_upload(Path::new("plant.jpg")).await.unwrap();
        next_completed(&mut events).await;

        controller.reset().await.unwrap();
        controller.reset().await.unwrap();

        let state = controller.get_state().await;
        assert_eq!(state.phase, SessionPhase::Idle);
        assert!(state.current_image.is_none());
        assert!(state.current_result.is_none());
        assert!(state.current_error.is_none());
        assert!(state.latest_sample.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_completion_after_reset_is_discarded() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::scripted(vec![(
            Duration::from_secs(60),
            Ok(diagnosis("Leaf Spot")),
        )]);
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));
        let mut events = controller.subscribe();

        controller.start_upload(Path::new("plant.jpg")).await.unwrap();
        wait_for_phase(&controller, SessionPhase::Analyzing).await;

        controller.reset().await.unwrap();

        // Let the in-flight classifier call finish well past its delay.
        sleep(Duration::from_secs(120)).await;

        let state = controller.get_state().await;
        assert_eq!(state.phase, SessionPhase::Idle);
        assert!(state.current_result.is_none());
        assert_eq!(sink.len(), 0);

        let mut saw_completion = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AnalyzerEvent::AnalysisCompleted { .. }) {
                saw_completion = true;
            }
        }
        assert!(!saw_completion, "stale completion must not be published");
    }

    #[tokio::test(start_paused = true)]
    async fn live_mode_emits_one_event_per_cycle() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::scripted(vec![
            (Duration::ZERO, Ok(diagnosis("Cycle One"))),
            (Duration::ZERO, Ok(diagnosis("Cycle Two"))),
            (Duration::ZERO, Ok(diagnosis("Cycle Three"))),
        ]);
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));
        let mut events = controller.subscribe();

        controller.start_live().await.unwrap();

        let first = next_completed(&mut events).await;
        let second = next_completed(&mut events).await;
        let third = next_completed(&mut events).await;
        controller.stop().await.unwrap();

        assert_eq!(first.result.issue_name, "Cycle One");
        assert_eq!(third.result.issue_name, "Cycle Three");
        assert!(first.timestamp < second.timestamp);
        assert!(second.timestamp < third.timestamp);

        wait_for_records(&sink, 3).await;
        assert_eq!(sink.len(), 3);

        let state = controller.get_state().await;
        assert_eq!(state.phase, SessionPhase::Idle);
        assert_eq!(state.mode, SessionMode::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn display_reflects_completion_order_not_start_order() {
        // Cycle two outlives cycle three's entire run but still completes
        // first; cycle three is the last writer and wins the display.
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::scripted(vec![
            (Duration::ZERO, Ok(diagnosis("Cycle One"))),
            (Duration::from_secs(7), Ok(diagnosis("Cycle Two"))),
            (Duration::from_secs(3), Ok(diagnosis("Cycle Three"))),
        ]);
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));
        let mut events = controller.subscribe();

        controller.start_live().await.unwrap();

        let completions = [
            next_completed(&mut events).await,
            next_completed(&mut events).await,
            next_completed(&mut events).await,
        ];
        let state = controller.get_state().await;
        controller.stop().await.unwrap();

        assert_eq!(completions[0].result.issue_name, "Cycle One");
        assert_eq!(completions[1].result.issue_name, "Cycle Two");
        assert_eq!(completions[2].result.issue_name, "Cycle Three");

        assert_eq!(
            state.current_result.as_ref().map(|r| r.issue_name.as_str()),
            Some("Cycle Three")
        );

        wait_for_records(&sink, 3).await;
        let recorded: Vec<String> = sink
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.result.issue_name.clone())
            .collect();
        assert!(recorded.contains(&"Cycle Two".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn live_loop_self_heals_after_a_failed_cycle() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::scripted(vec![
            (Duration::ZERO, Err(AnalysisError::Provider)),
            (Duration::ZERO, Ok(diagnosis("Cycle Two"))),
        ]);
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));
        let mut events = controller.subscribe();

        controller.start_live().await.unwrap();
        wait_for_phase(&controller, SessionPhase::Error).await;

        let recovered = next_completed(&mut events).await;
        controller.stop().await.unwrap();

        assert_eq!(recovered.result.issue_name, "Cycle Two");
        wait_for_records(&sink, 1).await;
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_live_loop_is_an_error() {
        let sink = Arc::new(RecordingSink::default());
        let classifier = StubClassifier::always_ok(diagnosis("Leaf Spot"));
        let controller =
            controller_with(Arc::new(StubImageSource), classifier, Arc::clone(&sink));

        assert!(controller.stop().await.is_err());
    }
}
