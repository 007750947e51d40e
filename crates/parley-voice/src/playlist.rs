//! Audio playlist player.
//!
//! Every item of a playlist is fetched (cache) or synthesized (TTS) concurrently, but chunks
//! reach the outbound stream strictly in playlist order: each item fills its own bounded lane
//! and a single writer drains the lanes one after another. The producers and the writer run as
//! one spawned group whose abort handle sits in the call's [`PlaybackSlot`] while it plays.

use crate::collaborators::{AudioCache, AudioChunk, AudioSink, Synthesizer};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::PlaybackSlot;
use futures::future::try_join_all;
use futures::StreamExt;
use parley_core::{template, CallSettings, PlaylistItem, Variables};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How a playback ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    /// Barge-in aborted the group; partially written audio is not replayed.
    Cancelled,
}

/// A playlist item with its template already rendered.
#[derive(Debug)]
enum Source {
    Cached(String),
    Spoken(String),
}

#[derive(Clone)]
pub struct PlaylistPlayer {
    cache: Arc<dyn AudioCache>,
    synthesizer: Arc<dyn Synthesizer>,
    slot: PlaybackSlot,
    fallback_key: String,
    lane_capacity: usize,
}

impl PlaylistPlayer {
    pub fn new(
        cache: Arc<dyn AudioCache>,
        synthesizer: Arc<dyn Synthesizer>,
        slot: PlaybackSlot,
        settings: &CallSettings,
    ) -> Self {
        Self {
            cache,
            synthesizer,
            slot,
            fallback_key: settings.fallback_cache_key.clone(),
            lane_capacity: settings.lane_capacity.max(1),
        }
    }

    pub fn slot(&self) -> &PlaybackSlot {
        &self.slot
    }

    /// Play `playlist` to `outbound` as one cancellable unit.
    ///
    /// Cancellation through the slot is reported as [`PlaybackOutcome::Cancelled`], never as an
    /// error. Cache and synthesis failures abort the remaining items and are returned.
    pub async fn play(
        &self,
        call_id: &str,
        playlist: &[PlaylistItem],
        variables: &Variables,
        outbound: Arc<dyn AudioSink>,
    ) -> VoiceResult<PlaybackOutcome> {
        if playlist.is_empty() {
            return Ok(PlaybackOutcome::Completed);
        }

        let mut producers = Vec::with_capacity(playlist.len());
        let mut lanes = Vec::with_capacity(playlist.len());
        for item in playlist {
            let source = match item {
                PlaylistItem::Cache { key } => Source::Cached(key.clone()),
                PlaylistItem::Tts { text_template } => Source::Spoken(template::render(text_template, variables)),
                PlaylistItem::Text { text } => Source::Spoken(text.clone()),
            };
            let (lane_tx, lane_rx) = mpsc::channel(self.lane_capacity);
            producers.push(produce(source, self.cache.clone(), self.synthesizer.clone(), lane_tx));
            lanes.push(lane_rx);
        }
        let writer = write_in_order(lanes, outbound);

        let group = tokio::spawn(async move {
            futures::try_join!(try_join_all(producers), writer)?;
            Ok::<(), VoiceError>(())
        });
        let _guard = self.slot.install(group.abort_handle());
        debug!(call_id, items = playlist.len(), "playlist started");

        match group.await {
            Ok(Ok(())) => {
                debug!(call_id, "playlist finished");
                Ok(PlaybackOutcome::Completed)
            }
            Ok(Err(err)) => Err(err),
            Err(err) if err.is_cancelled() => {
                debug!(call_id, "playlist cancelled");
                Ok(PlaybackOutcome::Cancelled)
            }
            Err(err) => Err(VoiceError::Playback(err.to_string())),
        }
    }

    /// Play the cached fallback response.
    pub async fn play_fallback(&self, call_id: &str, outbound: Arc<dyn AudioSink>) -> VoiceResult<PlaybackOutcome> {
        let playlist = [PlaylistItem::Cache {
            key: self.fallback_key.clone(),
        }];
        self.play(call_id, &playlist, &Variables::new(), outbound).await
    }
}

async fn produce(
    source: Source,
    cache: Arc<dyn AudioCache>,
    synthesizer: Arc<dyn Synthesizer>,
    lane: mpsc::Sender<AudioChunk>,
) -> VoiceResult<()> {
    match source {
        Source::Cached(key) => match cache.get(&key).await? {
            Some(chunks) => {
                for chunk in chunks {
                    if lane.send(chunk).await.is_err() {
                        break;
                    }
                }
            }
            None => warn!(key = %key, "audio cache miss"),
        },
        Source::Spoken(text) => {
            let mut audio = synthesizer.stream_static(&text).await?;
            while let Some(chunk) = audio.next().await {
                if lane.send(chunk?).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn write_in_order(lanes: Vec<mpsc::Receiver<AudioChunk>>, outbound: Arc<dyn AudioSink>) -> VoiceResult<()> {
    for mut lane in lanes {
        while let Some(chunk) = lane.recv().await {
            outbound.write(chunk).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::{InMemoryCache, PlaceholderSynthesizer, RecordingSink};
    use serde_json::json;
    use std::time::Duration;

    fn player(cache: InMemoryCache, synthesizer: PlaceholderSynthesizer) -> PlaylistPlayer {
        PlaylistPlayer::new(
            Arc::new(cache),
            Arc::new(synthesizer),
            PlaybackSlot::new(),
            &CallSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn writes_items_in_playlist_order() {
        let cache = InMemoryCache::new();
        cache.insert("intro", vec![b"intro".to_vec()]);
        cache.insert("outro", vec![b"outro".to_vec()]);
        // Synthesis is slow, cache is instant: order must still follow the playlist.
        let player = player(cache, PlaceholderSynthesizer::new().with_chunk_delay(Duration::from_millis(40)));
        let sink = Arc::new(RecordingSink::new());

        let mut vars = Variables::new();
        vars.insert("amount".into(), json!(5000000));
        let playlist = vec![
            PlaylistItem::Cache { key: "intro".into() },
            PlaylistItem::Tts { text_template: "{{ amount }} rubles".into() },
            PlaylistItem::Cache { key: "outro".into() },
        ];

        let outcome = player.play("c1", &playlist, &vars, sink.clone()).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(sink.texts(), vec!["intro", "5000000", "rubles", "outro"]);
        assert!(!player.slot().is_active());
    }

    #[tokio::test]
    async fn cache_miss_is_skipped() {
        let cache = InMemoryCache::new();
        cache.insert("known", vec![b"a".to_vec(), b"b".to_vec()]);
        let player = player(cache, PlaceholderSynthesizer::new());
        let sink = Arc::new(RecordingSink::new());

        let playlist = vec![
            PlaylistItem::Cache { key: "missing".into() },
            PlaylistItem::Cache { key: "known".into() },
        ];
        let outcome = player.play("c1", &playlist, &Variables::new(), sink.clone()).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(sink.texts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn text_items_are_spoken_verbatim() {
        let player = player(InMemoryCache::new(), PlaceholderSynthesizer::new());
        let sink = Arc::new(RecordingSink::new());
        let mut vars = Variables::new();
        vars.insert("code".into(), json!("ignored"));
        let playlist = vec![PlaylistItem::Text {
            text: "dial {code} then {{ code }}".into(),
        }];

        player.play("c1", &playlist, &vars, sink.clone()).await.unwrap();
        assert_eq!(sink.texts(), vec!["dial", "{code}", "then", "{{", "code", "}}"]);
    }

    #[tokio::test]
    async fn synthesis_failure_clears_slot_and_propagates() {
        let player = player(InMemoryCache::new(), PlaceholderSynthesizer::unavailable());
        let sink = Arc::new(RecordingSink::new());
        let playlist = vec![PlaylistItem::Tts { text_template: "hello".into() }];

        let err = player.play("c1", &playlist, &Variables::new(), sink).await.unwrap_err();
        assert!(matches!(err, VoiceError::Synthesis(_)));
        assert!(!player.slot().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_cancels_the_whole_group() {
        let cache = InMemoryCache::new();
        cache.insert("long", (0..50).map(|i| format!("chunk{i}").into_bytes()).collect());
        let player = player(cache, PlaceholderSynthesizer::new());
        let sink = Arc::new(RecordingSink::new().with_write_delay(Duration::from_millis(10)));
        let slot = player.slot().clone();

        let playing = {
            let player = player.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let playlist = vec![PlaylistItem::Cache { key: "long".into() }];
                player.play("c1", &playlist, &Variables::new(), sink).await
            })
        };

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(slot.cancel());
        let outcome = playing.await.unwrap().unwrap();

        assert_eq!(outcome, PlaybackOutcome::Cancelled);
        assert!(sink.len() < 50);
        assert!(!slot.is_active());
        assert!(!slot.cancel());
    }
}
