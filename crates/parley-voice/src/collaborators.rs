//! Contracts the orchestrator requires from its external collaborators.
//!
//! Implementations are shared across calls (pooled or singleton services) and must be safe for
//! concurrent use; per-call state is keyed by `call_id`. The orchestrator never assumes exclusive
//! ownership of a collaborator beyond the session or stream it acquires for one call.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_core::Variables;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One encoded audio frame as produced by the telephony side or the synthesizer.
pub type AudioChunk = Vec<u8>;

/// Audio bytes produced by a synthesis stream.
pub type AudioStream = BoxStream<'static, VoiceResult<AudioChunk>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub text: String,
    pub is_final: bool,
    pub stability: f32,
    pub utterance_index: u32,
}

impl RecognitionResult {
    pub fn partial(text: impl Into<String>, utterance_index: u32) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            stability: 0.5,
            utterance_index,
        }
    }

    pub fn final_text(text: impl Into<String>, utterance_index: u32) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            stability: 1.0,
            utterance_index,
        }
    }
}

/// Element of the recognizer's event queue. The queue closing marks the end of recognition.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Result(RecognitionResult),
    Error(String),
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Begin recognizing the audio arriving on `audio_in`; a closed `audio_in` is end of audio.
    async fn start(
        &self,
        call_id: &str,
        audio_in: mpsc::Receiver<AudioChunk>,
    ) -> VoiceResult<mpsc::Receiver<RecognitionEvent>>;

    async fn stop(&self, call_id: &str) -> VoiceResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentResult {
    pub intent_id: String,
    pub score: f32,
    /// Extracted entities; the slot value, when present, is under `value`.
    pub entities: Variables,
    pub current_leader: String,
}

impl IntentResult {
    pub fn new(intent_id: impl Into<String>, score: f32) -> Self {
        let intent_id = intent_id.into();
        Self {
            current_leader: intent_id.clone(),
            intent_id,
            score,
            entities: Variables::new(),
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.entities.insert("value".to_string(), value);
        self
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        self.entities.get("value")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaqResult {
    pub question_id: String,
    pub answer_text: String,
    pub score: f32,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Match `text` against the intents accepted in the current state.
    ///
    /// `previous_leader` is the stability hint: a classifier may decline to commit to a leader
    /// that differs from the one seen on the previous partial result.
    async fn classify(
        &self,
        text: &str,
        expected_intents: &[String],
        previous_leader: Option<&str>,
    ) -> VoiceResult<Option<IntentResult>>;

    async fn find_faq(&self, text: &str) -> VoiceResult<Option<FaqResult>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationChunk {
    pub text_chunk: String,
    pub is_final_chunk: bool,
    pub is_safe: bool,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn process_turn(
        &self,
        call_id: &str,
        text: &str,
    ) -> VoiceResult<BoxStream<'static, VoiceResult<GenerationChunk>>>;

    /// Abort the generation currently running for `call_id`.
    async fn cancel(&self, call_id: &str) -> VoiceResult<()>;

    /// Release everything held for `call_id`.
    async fn shutdown(&self, call_id: &str) -> VoiceResult<()>;
}

/// Bidirectional synthesis session. Dropping `text_in` ends the text; `audio_out` closes once the
/// last audio has been produced.
#[derive(Debug)]
pub struct SynthesisSession {
    pub text_in: mpsc::Sender<String>,
    pub audio_out: mpsc::Receiver<AudioChunk>,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn stream_static(&self, text: &str) -> VoiceResult<AudioStream>;

    async fn start_stream_session(&self) -> VoiceResult<SynthesisSession>;
}

#[async_trait]
pub trait AudioCache: Send + Sync {
    async fn get(&self, key: &str) -> VoiceResult<Option<Vec<AudioChunk>>>;
}

/// Outbound audio stream of one call.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn write(&self, chunk: AudioChunk) -> VoiceResult<()>;
}

#[async_trait]
impl AudioSink for mpsc::Sender<AudioChunk> {
    async fn write(&self, chunk: AudioChunk) -> VoiceResult<()> {
        self.send(chunk)
            .await
            .map_err(|_| VoiceError::ChannelSend("outbound audio closed".to_string()))
    }
}

/// Shared collaborators injected into every orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn Recognizer>,
    pub classifier: Arc<dyn Classifier>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub cache: Arc<dyn AudioCache>,
}
