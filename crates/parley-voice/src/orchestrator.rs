//! Dialogue Orchestrator - the per-call control loop
//!
//! Sequences recognition, classification, the flow state machine and playback for one call.
//! The orchestrator owns its [`SessionState`] outright; every mutation happens between awaits
//! on this task, and concurrent units (inbound pump, recognizer, playback group) only hand values
//! back to it.

use crate::collaborators::{
    AudioChunk, AudioSink, Collaborators, FaqResult, IntentResult, RecognitionEvent, RecognitionResult,
};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::PlaybackSlot;
use crate::playlist::{PlaybackOutcome, PlaylistPlayer};
use crate::retry::RetryPolicy;
use crate::unscripted::UnscriptedPipe;
use futures::{Stream, StreamExt};
use parley_core::{CallSettings, FlowEngine, PlaylistItem, SessionState, TurnState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct DialogueOrchestrator {
    session: SessionState,
    engine: FlowEngine,
    collaborators: Collaborators,
    settings: CallSettings,
    player: PlaylistPlayer,
    pipe: UnscriptedPipe,
    classifier_retry: RetryPolicy,
    call_ended: bool,
}

impl DialogueOrchestrator {
    pub fn new(call_id: impl Into<String>, engine: FlowEngine, collaborators: Collaborators, settings: CallSettings) -> Self {
        let session = SessionState::new(call_id, settings.start_state.clone());
        let player = PlaylistPlayer::new(
            collaborators.cache.clone(),
            collaborators.synthesizer.clone(),
            PlaybackSlot::new(),
            &settings,
        );
        let pipe = UnscriptedPipe::new(
            collaborators.generator.clone(),
            collaborators.synthesizer.clone(),
            player.clone(),
        );
        Self {
            session,
            engine,
            classifier_retry: RetryPolicy::for_classifier(&settings),
            collaborators,
            settings,
            player,
            pipe,
            call_ended: false,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn call_id(&self) -> &str {
        &self.session.call_id
    }

    /// Handle an external barge-in trigger can use while [`run`](Self::run) is in progress.
    pub fn barge_in_handle(&self) -> PlaybackSlot {
        self.player.slot().clone()
    }

    /// Drive the call until it ends or recognition finishes.
    ///
    /// Shutdown (recognizer stop, generator release, inbound pump cancellation) runs on every
    /// exit path, including errors. Errors returned from here are fatal to the call.
    pub async fn run<S>(&mut self, inbound: S, outbound: Arc<dyn AudioSink>) -> VoiceResult<()>
    where
        S: Stream<Item = AudioChunk> + Send + 'static,
    {
        info!(call_id = %self.call_id(), start_state = %self.session.current_state, "call started");
        let (audio_tx, audio_rx) = mpsc::channel(self.settings.inbound_buffer_capacity.max(1));
        let inbound_pump = tokio::spawn(pump_inbound(inbound, audio_tx));

        let result = self.converse(audio_rx, &outbound).await;

        self.shutdown().await;
        inbound_pump.abort();
        let _ = inbound_pump.await;

        match &result {
            Ok(()) => info!(
                call_id = %self.call_id(),
                final_state = %self.session.current_state,
                turns = self.session.history.len(),
                "call finished"
            ),
            Err(err) => warn!(call_id = %self.call_id(), error = %err, "call failed"),
        }
        result
    }

    async fn converse(&mut self, audio_rx: mpsc::Receiver<AudioChunk>, outbound: &Arc<dyn AudioSink>) -> VoiceResult<()> {
        let call_id = self.session.call_id.clone();
        let mut events = self.collaborators.recognizer.start(&call_id, audio_rx).await?;

        self.session.turn = TurnState::BotTurn;
        let greeting = self.engine.dialogue().playlist(&self.session.current_state).to_vec();
        self.play(&greeting, outbound).await?;

        let limit = self.settings.recognition_error_limit;
        let mut consecutive_errors = 0u32;
        while !self.call_ended {
            self.session.turn = TurnState::UserTurn;
            let Some(event) = events.recv().await else {
                debug!(call_id = %call_id, "recognition stream ended");
                break;
            };

            match event {
                RecognitionEvent::Error(err) => {
                    consecutive_errors += 1;
                    warn!(call_id = %call_id, error = %err, consecutive_errors, "recognition error, skipping turn");
                    if limit > 0 && consecutive_errors >= limit {
                        return Err(VoiceError::RecognitionErrorLimit { limit });
                    }
                }
                RecognitionEvent::Result(result) => {
                    consecutive_errors = 0;
                    self.handle_result(result, outbound).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_result(&mut self, result: RecognitionResult, outbound: &Arc<dyn AudioSink>) -> VoiceResult<()> {
        let expected = self.engine.dialogue().expected_intents(&self.session.current_state);

        if !result.is_final {
            if let Some(partial) = self.classify(&result.text, &expected).await? {
                self.session.previous_leader = Some(partial.current_leader);
            }
            return Ok(());
        }

        debug!(call_id = %self.call_id(), text = %result.text, utterance = result.utterance_index, "final result");
        let matched = self.classify(&result.text, &expected).await?;

        let playlist = match &matched {
            Some(intent) => {
                self.fill_slot(intent);
                let flow = self.engine.process_event(&self.session, &intent.intent_id)?;
                info!(
                    call_id = %self.call_id(),
                    from = %self.session.current_state,
                    to = %flow.next_state,
                    intent = %intent.intent_id,
                    guide_back = flow.should_guide_back,
                    depth = flow.task_stack.len(),
                    "transition"
                );
                self.session.apply(flow);
                self.engine.dialogue().playlist(&self.session.current_state).to_vec()
            }
            None => match self.find_faq(&result.text).await? {
                Some(faq) => {
                    debug!(call_id = %self.call_id(), question = %faq.question_id, "answering from FAQ");
                    vec![PlaylistItem::Text { text: faq.answer_text }]
                }
                None => {
                    self.session.turn = TurnState::BotTurn;
                    let call_id = self.session.call_id.clone();
                    let outcome = self.pipe.handle(&call_id, &result.text, outbound.clone()).await?;
                    debug!(call_id = %call_id, ?outcome, "unscripted turn done");
                    return Ok(());
                }
            },
        };

        if !playlist.is_empty() {
            self.session.turn = TurnState::BotTurn;
            self.play(&playlist, outbound).await?;
        }

        if self.engine.dialogue().ends_call(&self.session.current_state) {
            info!(call_id = %self.call_id(), state = %self.session.current_state, "end of call requested");
            self.call_ended = true;
        }

        self.session.previous_leader = matched.map(|m| m.current_leader);
        Ok(())
    }

    /// Store the entity value under the parameter the current state asks for.
    fn fill_slot(&mut self, intent: &IntentResult) {
        let Some(value) = intent.value() else {
            return;
        };
        let Some(name) = self.engine.parameter_for_state(&self.session).map(|p| p.name.clone()) else {
            return;
        };
        debug!(call_id = %self.call_id(), parameter = %name, %value, "slot filled");
        self.session.set_variable(name, value.clone());
    }

    async fn classify(&self, text: &str, expected: &[String]) -> VoiceResult<Option<IntentResult>> {
        let classifier = self.collaborators.classifier.as_ref();
        let previous = self.session.previous_leader.as_deref();
        self.classifier_retry
            .run("classify", move || classifier.classify(text, expected, previous))
            .await
    }

    async fn find_faq(&self, text: &str) -> VoiceResult<Option<FaqResult>> {
        let classifier = self.collaborators.classifier.as_ref();
        self.classifier_retry
            .run("find_faq", move || classifier.find_faq(text))
            .await
    }

    /// Play a scripted playlist; a failed playback falls back to the cached response.
    async fn play(&self, playlist: &[PlaylistItem], outbound: &Arc<dyn AudioSink>) -> VoiceResult<PlaybackOutcome> {
        let call_id = self.call_id();
        match self
            .player
            .play(call_id, playlist, &self.session.variables, outbound.clone())
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(call_id, error = %err, "playback failed, playing fallback");
                self.player.play_fallback(call_id, outbound.clone()).await
            }
        }
    }

    async fn shutdown(&mut self) {
        let call_id = self.session.call_id.clone();
        self.player.slot().cancel();
        if let Err(err) = self.collaborators.recognizer.stop(&call_id).await {
            warn!(call_id = %call_id, error = %err, "recognizer stop failed");
        }
        if let Err(err) = self.collaborators.generator.shutdown(&call_id).await {
            warn!(call_id = %call_id, error = %err, "generator shutdown failed");
        }
        debug!(call_id = %call_id, "call resources released");
    }
}

/// Copy inbound audio into the bounded recognizer buffer. Blocks while the buffer is full;
/// dropping the sender on return is the end-of-audio sentinel.
pub(crate) async fn pump_inbound<S>(inbound: S, audio_tx: mpsc::Sender<AudioChunk>)
where
    S: Stream<Item = AudioChunk>,
{
    let mut inbound = std::pin::pin!(inbound);
    while let Some(chunk) = inbound.next().await {
        if audio_tx.send(chunk).await.is_err() {
            break;
        }
    }
}
