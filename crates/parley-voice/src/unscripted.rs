//! Unscripted turns: generated text piped into a streaming synthesis session.
//!
//! Two tasks run per turn. The pump forwards generated text into the synthesizer's text input
//! and gates on the safety flag of the first chunk; the drain copies synthesized audio to the
//! outbound stream. Both are joined in one spawned group, and that group is what barge-in
//! cancels, so the pump never outlives cancelled playback.

use crate::collaborators::{AudioChunk, AudioSink, GenerationChunk, Generator, SynthesisSession, Synthesizer};
use crate::error::{VoiceError, VoiceResult};
use crate::playlist::PlaylistPlayer;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnscriptedOutcome {
    /// Generated text was spoken to the end.
    Spoken,
    /// The cached fallback response was played instead.
    Fallback,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    Forwarded,
    Unsafe,
}

#[derive(Clone)]
pub struct UnscriptedPipe {
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    player: PlaylistPlayer,
}

impl UnscriptedPipe {
    pub fn new(generator: Arc<dyn Generator>, synthesizer: Arc<dyn Synthesizer>, player: PlaylistPlayer) -> Self {
        Self {
            generator,
            synthesizer,
            player,
        }
    }

    pub async fn handle(&self, call_id: &str, text: &str, outbound: Arc<dyn AudioSink>) -> VoiceResult<UnscriptedOutcome> {
        let SynthesisSession { text_in, audio_out } = match self.synthesizer.start_stream_session().await {
            Ok(session) => session,
            Err(err) => {
                warn!(call_id, error = %err, "synthesis session unavailable, playing fallback");
                self.player.play_fallback(call_id, outbound).await?;
                return Ok(UnscriptedOutcome::Fallback);
            }
        };

        let generation = self.generator.process_turn(call_id, text).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let pump = pump_generation(call_id.to_string(), generation, text_in, self.generator.clone(), stop_tx);
        let drain = drain_audio(audio_out, outbound.clone(), stop_rx);

        let group = tokio::spawn(async move {
            let (pumped, ()) = tokio::try_join!(pump, drain)?;
            Ok::<PumpOutcome, VoiceError>(pumped)
        });
        let joined = {
            let _guard = self.player.slot().install(group.abort_handle());
            group.await
        };

        match joined {
            Ok(Ok(PumpOutcome::Forwarded)) => Ok(UnscriptedOutcome::Spoken),
            Ok(Ok(PumpOutcome::Unsafe)) => {
                warn!(call_id, "first generated chunk flagged unsafe, playing fallback");
                self.player.play_fallback(call_id, outbound).await?;
                Ok(UnscriptedOutcome::Fallback)
            }
            Ok(Err(err)) => Err(err),
            Err(err) if err.is_cancelled() => {
                debug!(call_id, "unscripted turn cancelled");
                Ok(UnscriptedOutcome::Cancelled)
            }
            Err(err) => Err(VoiceError::Playback(err.to_string())),
        }
    }
}

/// Forward generated text until the stream ends. Dropping `text_in` on return ends synthesis.
async fn pump_generation(
    call_id: String,
    mut generation: BoxStream<'static, VoiceResult<GenerationChunk>>,
    text_in: mpsc::Sender<String>,
    generator: Arc<dyn Generator>,
    stop: oneshot::Sender<()>,
) -> VoiceResult<PumpOutcome> {
    let mut first = true;
    while let Some(chunk) = generation.next().await {
        let chunk = chunk?;
        if std::mem::take(&mut first) && !chunk.is_safe {
            if let Err(err) = generator.cancel(&call_id).await {
                warn!(call_id = %call_id, error = %err, "failed to cancel generation");
            }
            let _ = stop.send(());
            return Ok(PumpOutcome::Unsafe);
        }
        if text_in.send(chunk.text_chunk).await.is_err() {
            debug!(call_id = %call_id, "synthesis input closed early");
            break;
        }
        if chunk.is_final_chunk {
            break;
        }
    }
    Ok(PumpOutcome::Forwarded)
}

/// Copy synthesized audio out until the session closes or the pump asks to stop.
async fn drain_audio(
    mut audio_out: mpsc::Receiver<AudioChunk>,
    outbound: Arc<dyn AudioSink>,
    stop: oneshot::Receiver<()>,
) -> VoiceResult<()> {
    let mut stop = stop.fuse();
    loop {
        tokio::select! {
            biased;
            signal = &mut stop => {
                if signal.is_ok() {
                    break;
                }
            }
            chunk = audio_out.recv() => match chunk {
                Some(chunk) => outbound.write(chunk).await?,
                None => break,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::{InMemoryCache, PlaceholderSynthesizer, RecordingSink, ScriptedGenerator};
    use crate::playback::PlaybackSlot;
    use parley_core::CallSettings;
    use std::time::Duration;

    fn pipe(generator: Arc<ScriptedGenerator>, synthesizer: PlaceholderSynthesizer) -> UnscriptedPipe {
        let cache = InMemoryCache::new();
        cache.insert("non_secure_response", vec![b"fallback".to_vec()]);
        let synthesizer = Arc::new(synthesizer);
        let player = PlaylistPlayer::new(
            Arc::new(cache),
            synthesizer.clone(),
            PlaybackSlot::new(),
            &CallSettings::default(),
        );
        UnscriptedPipe::new(generator, synthesizer, player)
    }

    #[tokio::test]
    async fn speaks_generated_text() {
        let generator = Arc::new(ScriptedGenerator::replying("we insure country houses too"));
        let pipe = pipe(generator.clone(), PlaceholderSynthesizer::new());
        let sink = Arc::new(RecordingSink::new());

        let outcome = pipe.handle("c1", "do you insure dachas", sink.clone()).await.unwrap();
        assert_eq!(outcome, UnscriptedOutcome::Spoken);
        assert_eq!(sink.texts().join(" "), "we insure country houses too");
        assert!(!generator.was_cancelled("c1"));
    }

    #[tokio::test]
    async fn unsafe_first_chunk_cancels_generation_and_plays_fallback() {
        let generator = Arc::new(ScriptedGenerator::unsafe_reply("something we must not say"));
        let pipe = pipe(generator.clone(), PlaceholderSynthesizer::new());
        let sink = Arc::new(RecordingSink::new());

        let outcome = pipe.handle("c1", "tell me a secret", sink.clone()).await.unwrap();
        assert_eq!(outcome, UnscriptedOutcome::Fallback);
        assert_eq!(sink.texts(), vec!["fallback"]);
        assert!(generator.was_cancelled("c1"));
    }

    #[tokio::test]
    async fn unavailable_synthesis_falls_back_without_generating() {
        let generator = Arc::new(ScriptedGenerator::replying("never spoken"));
        let pipe = pipe(generator.clone(), PlaceholderSynthesizer::unavailable());
        let sink = Arc::new(RecordingSink::new());

        let outcome = pipe.handle("c1", "hello?", sink.clone()).await.unwrap();
        assert_eq!(outcome, UnscriptedOutcome::Fallback);
        assert_eq!(sink.texts(), vec!["fallback"]);
        assert_eq!(generator.turns("c1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_stops_pump_and_drain_together() {
        let words = (0..40).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let generator = Arc::new(ScriptedGenerator::replying(&words).with_chunk_delay(Duration::from_millis(10)));
        let pipe = pipe(generator, PlaceholderSynthesizer::new());
        let sink = Arc::new(RecordingSink::new());
        let slot = pipe.player.slot().clone();

        let running = {
            let pipe = pipe.clone();
            let sink = sink.clone();
            tokio::spawn(async move { pipe.handle("c1", "talk to me", sink).await })
        };
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(slot.cancel());

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, UnscriptedOutcome::Cancelled);
        let written = sink.len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.len(), written);
        assert!(written < 40);
    }
}
