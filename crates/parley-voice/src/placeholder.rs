//! In-process collaborators for tests and the call simulator.
//!
//! None of these talk to a real vendor. Audio is the UTF-8 text it stands for, which keeps
//! assertions on the outbound stream readable.

use crate::collaborators::{
    AudioCache, AudioChunk, AudioSink, AudioStream, Classifier, FaqResult, GenerationChunk, Generator, IntentResult,
    RecognitionEvent, Recognizer, SynthesisSession, Synthesizer,
};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use parley_core::{DialogueMap, PlaylistItem};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

// -----------------------------------------------------------------------------
// Cache
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, Vec<AudioChunk>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, chunks: Vec<AudioChunk>) {
        self.entries.insert(key.into(), chunks);
    }

    /// Seed one chunk per cache key referenced by the dialogue map; the chunk is the key itself.
    pub fn seed_from_dialogue(&self, dialogue: &DialogueMap) {
        for (_, state) in dialogue.states() {
            for item in state.playlist() {
                if let PlaylistItem::Cache { key } = item {
                    self.entries
                        .entry(key.clone())
                        .or_insert_with(|| vec![key.clone().into_bytes()]);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AudioCache for InMemoryCache {
    async fn get(&self, key: &str) -> VoiceResult<Option<Vec<AudioChunk>>> {
        Ok(self.entries.get(key).map(|chunks| chunks.value().clone()))
    }
}

// -----------------------------------------------------------------------------
// Recognizer
// -----------------------------------------------------------------------------

/// Replays a per-call script of recognition events while draining the call's audio.
#[derive(Debug, Default)]
pub struct ScriptedRecognizer {
    scripts: DashMap<String, Vec<RecognitionEvent>>,
    stopped: DashMap<String, usize>,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, call_id: impl Into<String>, events: Vec<RecognitionEvent>) {
        self.scripts.insert(call_id.into(), events);
    }

    pub fn was_stopped(&self, call_id: &str) -> bool {
        self.stopped.contains_key(call_id)
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn start(
        &self,
        call_id: &str,
        mut audio_in: mpsc::Receiver<AudioChunk>,
    ) -> VoiceResult<mpsc::Receiver<RecognitionEvent>> {
        let script = self.scripts.remove(call_id).map(|(_, events)| events).unwrap_or_default();
        debug!(call_id, events = script.len(), "scripted recognition started");

        tokio::spawn(async move { while audio_in.recv().await.is_some() {} });

        let (event_tx, event_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for event in script {
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(event_rx)
    }

    async fn stop(&self, call_id: &str) -> VoiceResult<()> {
        *self.stopped.entry(call_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Classifier
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct KeywordRule {
    intent: String,
    keywords: Vec<String>,
    value: Option<Value>,
}

#[derive(Debug, Clone)]
struct FaqEntry {
    question_id: String,
    keywords: Vec<String>,
    answer: String,
}

/// Substring matcher over the expected intents.
///
/// A number in the text resolves to `provide_number` (carrying the number as the entity value)
/// whenever that intent is expected. Keyword matches are exact, so the stability hint is unused.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    rules: Vec<KeywordRule>,
    faq: Vec<FaqEntry>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, intent: &str, keywords: &[&str]) -> Self {
        self.rules.push(KeywordRule {
            intent: intent.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            value: None,
        });
        self
    }

    /// Like [`rule`](Self::rule), also reporting `value` as the extracted entity.
    pub fn rule_with_value(mut self, intent: &str, keywords: &[&str], value: Value) -> Self {
        self = self.rule(intent, keywords);
        if let Some(rule) = self.rules.last_mut() {
            rule.value = Some(value);
        }
        self
    }

    pub fn faq(mut self, question_id: &str, keywords: &[&str], answer: &str) -> Self {
        self.faq.push(FaqEntry {
            question_id: question_id.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            answer: answer.to_string(),
        });
        self
    }
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("number pattern is valid"))
}

fn extract_number(text: &str) -> Option<Value> {
    let digits = number_regex().find(text)?.as_str().replace(',', ".");
    match digits.parse::<i64>() {
        Ok(n) => Some(json!(n)),
        Err(_) => digits.parse::<f64>().ok().map(|f| json!(f)),
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(
        &self,
        text: &str,
        expected_intents: &[String],
        _previous_leader: Option<&str>,
    ) -> VoiceResult<Option<IntentResult>> {
        let expects = |intent: &str| expected_intents.iter().any(|e| e == intent);

        if expects("provide_number") {
            if let Some(number) = extract_number(text) {
                return Ok(Some(IntentResult::new("provide_number", 0.95).with_value(number)));
            }
        }

        let lowered = text.to_lowercase();
        let matched = self
            .rules
            .iter()
            .filter(|rule| expects(&rule.intent))
            .find(|rule| rule.keywords.iter().any(|k| lowered.contains(k.as_str())));

        Ok(matched.map(|rule| {
            let result = IntentResult::new(rule.intent.clone(), 1.0);
            match &rule.value {
                Some(value) => result.with_value(value.clone()),
                None => result,
            }
        }))
    }

    async fn find_faq(&self, text: &str) -> VoiceResult<Option<FaqResult>> {
        let lowered = text.to_lowercase();
        Ok(self
            .faq
            .iter()
            .find(|entry| entry.keywords.iter().any(|k| lowered.contains(k.as_str())))
            .map(|entry| FaqResult {
                question_id: entry.question_id.clone(),
                answer_text: entry.answer.clone(),
                score: 1.0,
            }))
    }
}

// -----------------------------------------------------------------------------
// Generator
// -----------------------------------------------------------------------------

/// Streams a fixed reply word by word for every turn.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    reply: Vec<String>,
    first_chunk_safe: bool,
    chunk_delay: Option<Duration>,
    turns: DashMap<String, usize>,
    cancelled: DashMap<String, usize>,
    released: DashMap<String, usize>,
}

impl ScriptedGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.split_whitespace().map(str::to_string).collect(),
            first_chunk_safe: true,
            ..Self::default()
        }
    }

    /// A reply whose first chunk is flagged unsafe.
    pub fn unsafe_reply(reply: &str) -> Self {
        Self {
            first_chunk_safe: false,
            ..Self::replying(reply)
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn turns(&self, call_id: &str) -> usize {
        self.turns.get(call_id).map(|n| *n).unwrap_or(0)
    }

    pub fn was_cancelled(&self, call_id: &str) -> bool {
        self.cancelled.contains_key(call_id)
    }

    pub fn was_released(&self, call_id: &str) -> bool {
        self.released.contains_key(call_id)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn process_turn(
        &self,
        call_id: &str,
        _text: &str,
    ) -> VoiceResult<BoxStream<'static, VoiceResult<GenerationChunk>>> {
        *self.turns.entry(call_id.to_string()).or_insert(0) += 1;

        let last = self.reply.len().saturating_sub(1);
        let first_chunk_safe = self.first_chunk_safe;
        let chunks: Vec<GenerationChunk> = self
            .reply
            .iter()
            .enumerate()
            .map(|(i, word)| GenerationChunk {
                text_chunk: word.clone(),
                is_final_chunk: i == last,
                is_safe: i > 0 || first_chunk_safe,
            })
            .collect();

        let delay = self.chunk_delay;
        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            })
            .boxed())
    }

    async fn cancel(&self, call_id: &str) -> VoiceResult<()> {
        *self.cancelled.entry(call_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn shutdown(&self, call_id: &str) -> VoiceResult<()> {
        *self.released.entry(call_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Synthesizer
// -----------------------------------------------------------------------------

/// "Synthesizes" one audio chunk per word.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderSynthesizer {
    unavailable: bool,
    chunk_delay: Option<Duration>,
}

impl PlaceholderSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every request, as a synthesis pool with no free connection would.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            chunk_delay: None,
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    fn check_available(&self) -> VoiceResult<()> {
        if self.unavailable {
            return Err(VoiceError::Synthesis("no synthesis connection available".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Synthesizer for PlaceholderSynthesizer {
    async fn stream_static(&self, text: &str) -> VoiceResult<AudioStream> {
        self.check_available()?;
        let words: Vec<AudioChunk> = text.split_whitespace().map(|w| w.as_bytes().to_vec()).collect();
        let delay = self.chunk_delay;
        Ok(stream::iter(words)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            })
            .boxed())
    }

    async fn start_stream_session(&self) -> VoiceResult<SynthesisSession> {
        self.check_available()?;
        let (text_tx, mut text_rx) = mpsc::channel::<String>(16);
        let (audio_tx, audio_rx) = mpsc::channel(16);
        let delay = self.chunk_delay;
        tokio::spawn(async move {
            while let Some(text) = text_rx.recv().await {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if audio_tx.send(text.into_bytes()).await.is_err() {
                    break;
                }
            }
        });
        Ok(SynthesisSession {
            text_in: text_tx,
            audio_out: audio_rx,
        })
    }
}

// -----------------------------------------------------------------------------
// Outbound sink
// -----------------------------------------------------------------------------

/// Records every chunk written to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    chunks: Mutex<Vec<AudioChunk>>,
    write_delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Written chunks decoded as text.
    pub fn texts(&self) -> Vec<String> {
        self.chunks
            .lock()
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn write(&self, chunk: AudioChunk) -> VoiceResult<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.chunks.lock().push(chunk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(intents: &[&str]) -> Vec<String> {
        intents.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn number_pattern_compiles() {
        assert_eq!(extract_number("about 5000000"), Some(serde_json::json!(5000000)));
    }

    #[tokio::test]
    async fn numbers_win_when_provide_number_is_expected() {
        let classifier = KeywordClassifier::new().rule("confirm_yes", &["yes"]);
        let result = classifier
            .classify("yes, about 5000000", &expected(&["confirm_yes", "provide_number"]), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.intent_id, "provide_number");
        assert_eq!(result.value(), Some(&json!(5000000)));

        let result = classifier
            .classify("yes, about 5000000", &expected(&["confirm_yes"]), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.intent_id, "confirm_yes");
    }

    #[tokio::test]
    async fn unexpected_intents_are_not_matched() {
        let classifier = KeywordClassifier::new()
            .rule("ask_robot", &["robot"])
            .faq("hours", &["open"], "We work around the clock.");
        assert!(classifier
            .classify("are you a robot", &expected(&["confirm_yes"]), None)
            .await
            .unwrap()
            .is_none());
        let faq = classifier.find_faq("when are you open").await.unwrap().unwrap();
        assert_eq!(faq.question_id, "hours");
    }

    #[test]
    fn decimal_commas_parse_as_floats() {
        assert_eq!(extract_number("1,5 million"), Some(json!(1.5)));
        assert_eq!(extract_number("nothing here"), None);
    }
}
