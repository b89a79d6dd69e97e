use serde::{Deserialize, Serialize};

use super::{AnalysisError, AnalysisResult, SensorSample};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionMode {
    Upload,
    Live,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Upload
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Loading,
    Connecting,
    Connected,
    Analyzing,
    Complete,
    Error,
}

impl Default for SessionPhase {
    fn default() -> Self {
        SessionPhase::Idle
    }
}

/// Snapshot of one analysis session. The controller is the only writer;
/// `current_result` and `current_error` are never both set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub mode: SessionMode,
    pub phase: SessionPhase,
    pub current_image: Option<String>,
    pub current_result: Option<AnalysisResult>,
    pub current_error: Option<AnalysisError>,
    pub latest_sample: Option<SensorSample>,
}

impl SessionState {
    pub fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn begin_loading(&mut self) {
        self.phase = SessionPhase::Loading;
        self.current_image = None;
        self.current_result = None;
        self.current_error = None;
    }

    pub fn begin_connecting(&mut self) {
        self.phase = SessionPhase::Connecting;
        self.current_image = None;
        self.current_result = None;
        self.current_error = None;
        self.latest_sample = None;
    }

    pub fn mark_connected(&mut self) {
        self.phase = SessionPhase::Connected;
    }

    pub fn begin_analysis(&mut self, image: String) {
        self.phase = SessionPhase::Analyzing;
        self.current_image = Some(image);
        self.current_error = None;
    }

    pub fn set_sample(&mut self, sample: SensorSample) {
        self.latest_sample = Some(sample);
    }

    /// In upload mode a result is terminal; in live mode the session drops
    /// back to `Connected` and the loop keeps going.
    pub fn apply_result(&mut self, result: AnalysisResult) {
        self.current_result = Some(result);
        self.current_error = None;
        self.phase = match self.mode {
            SessionMode::Upload => SessionPhase::Complete,
            SessionMode::Live => SessionPhase::Connected,
        };
    }

    pub fn apply_error(&mut self, error: AnalysisError) {
        self.current_result = None;
        self.current_error = Some(error);
        self.phase = SessionPhase::Error;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// `stop()` keeps the selected mode; everything else clears.
    pub fn disconnect(&mut self) {
        *self = Self::new(self.mode);
    }
}
