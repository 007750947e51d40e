//! # parley-voice - async dialogue orchestration
//!
//! Drives one live call: audio in, recognition, classification, the flow state machine from
//! `parley-core`, and interruptible playback out.
//!
//! ```text
//! inbound audio ─► bounded buffer (100) ─► Recognizer ─► events
//!                                                         │
//!               ┌─────────────── DialogueOrchestrator ◄───┘
//!               │    Classifier ─► FlowEngine ─► SessionState
//!               ▼
//!   PlaylistPlayer (cache / TTS lanes, ordered writer)   UnscriptedPipe (Generator ─► Synthesizer)
//!               └──────────────► outbound audio ◄────────────────┘
//!                                  ▲
//!                        PlaybackSlot (barge-in)
//! ```

pub mod collaborators;
pub mod error;
pub mod orchestrator;
pub mod placeholder;
pub mod playback;
pub mod playlist;
pub mod retry;
pub mod unscripted;

pub use collaborators::{
    AudioCache, AudioChunk, AudioSink, AudioStream, Classifier, Collaborators, FaqResult, GenerationChunk, Generator,
    IntentResult, RecognitionEvent, RecognitionResult, Recognizer, SynthesisSession, Synthesizer,
};
pub use error::{VoiceError, VoiceResult};
pub use orchestrator::DialogueOrchestrator;
pub use placeholder::{
    InMemoryCache, KeywordClassifier, PlaceholderSynthesizer, RecordingSink, ScriptedGenerator, ScriptedRecognizer,
};
pub use playback::{PlaybackSlot, SlotGuard};
pub use playlist::{PlaybackOutcome, PlaylistPlayer};
pub use retry::RetryPolicy;
pub use unscripted::{UnscriptedOutcome, UnscriptedPipe};
