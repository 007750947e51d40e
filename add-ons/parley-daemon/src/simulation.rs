//! Simulated calls: scripted callers talking to the placeholder collaborators.

use futures::stream;
use parley_core::{Catalogs, FlowEngine, ParleyConfig};
use parley_voice::{
    Collaborators, DialogueOrchestrator, InMemoryCache, KeywordClassifier, PlaceholderSynthesizer, RecognitionEvent,
    RecognitionResult, RecordingSink, ScriptedGenerator, ScriptedRecognizer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// 20 ms of 8 kHz 16-bit silence.
const SILENCE_FRAME: usize = 320;
const FRAMES_PER_CALL: usize = 50;

/// One caller's lines, in order.
struct CallerScript {
    name: &'static str,
    lines: &'static [&'static str],
}

static SCRIPTS: &[CallerScript] = &[
    CallerScript {
        name: "cooperative",
        lines: &["go ahead", "I am Alex", "about 5000000", "yes", "1000000", "Lenina street 5", "yes"],
    },
    CallerScript {
        name: "digressive",
        lines: &["go ahead", "Alex here", "wait, are you a robot?", "ok, back to the point", "too expensive for me"],
    },
    CallerScript {
        name: "impatient",
        lines: &["start", "Alex", "just tell me the final cost", "3000000", "nope", "Lenina street", "yes"],
    },
    CallerScript {
        name: "curious",
        lines: &["go ahead", "what are your opening hours?", "tell me something fun"],
    },
];

/// Collaborators shared by every simulated call, plus the handles needed to script them.
pub struct Placeholders {
    recognizer: Arc<ScriptedRecognizer>,
    collaborators: Collaborators,
}

impl Placeholders {
    pub fn new(catalogs: &Catalogs, config: &ParleyConfig) -> Self {
        let cache = InMemoryCache::new();
        cache.seed_from_dialogue(&catalogs.dialogue);
        let fallback = config.call.fallback_cache_key.clone();
        cache.insert(fallback.clone(), vec![fallback.into_bytes()]);

        let recognizer = Arc::new(ScriptedRecognizer::new());
        let collaborators = Collaborators {
            recognizer: recognizer.clone(),
            classifier: Arc::new(insurance_classifier()),
            generator: Arc::new(
                ScriptedGenerator::replying("I am not sure, but our manager will call you back")
                    .with_chunk_delay(Duration::from_millis(5)),
            ),
            synthesizer: Arc::new(PlaceholderSynthesizer::new().with_chunk_delay(Duration::from_millis(2))),
            cache: Arc::new(cache),
        };
        Self {
            recognizer,
            collaborators,
        }
    }
}

fn insurance_classifier() -> KeywordClassifier {
    KeywordClassifier::new()
        .rule("start_dialogue", &["start", "go ahead"])
        .rule_with_value("provide_name", &["alex"], json!("Alex"))
        .rule("ask_robot", &["robot"])
        .rule("ask_company", &["company"])
        .rule("government_compensation", &["compensation", "government"])
        .rule("demand_final_answer_cost", &["final cost", "how much"])
        .rule("return_to_main_goal", &["back to"])
        .rule("provide_reject_reason", &["expensive", "not interested"])
        .rule_with_value("confirm_yes", &["yes", "sure"], json!(true))
        .rule_with_value("confirm_no", &["no"], json!(false))
        .rule_with_value("provide_address", &["street"], json!("Lenina street"))
        .faq("office_hours", &["hours"], "We are open every day from nine to six")
}

fn recognition_events(lines: &[&str]) -> Vec<RecognitionEvent> {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| RecognitionEvent::Result(RecognitionResult::final_text(*line, i as u32)))
        .collect()
}

#[derive(Debug)]
pub struct CallReport {
    pub call_id: String,
    pub script: &'static str,
    pub final_state: String,
    pub turns: usize,
    pub chunks_out: usize,
    pub elapsed: Duration,
    pub failed: bool,
}

/// Run `calls` simulated calls concurrently and collect one report per call.
pub async fn run_calls(
    calls: usize,
    catalogs: &Catalogs,
    config: &ParleyConfig,
    placeholders: &Placeholders,
) -> Vec<CallReport> {
    let mut handles = Vec::with_capacity(calls);
    for index in 0..calls {
        let script = &SCRIPTS[index % SCRIPTS.len()];
        let call_id = Uuid::new_v4().to_string();
        placeholders
            .recognizer
            .script(call_id.clone(), recognition_events(script.lines));

        let engine = FlowEngine::new(catalogs.goals.clone(), catalogs.dialogue.clone(), config.flow.clone());
        let mut orchestrator = DialogueOrchestrator::new(
            call_id.clone(),
            engine,
            placeholders.collaborators.clone(),
            config.call.clone(),
        );

        handles.push(tokio::spawn(async move {
            let sink = Arc::new(RecordingSink::new());
            let inbound = stream::iter(std::iter::repeat(vec![0u8; SILENCE_FRAME]).take(FRAMES_PER_CALL));
            let started = Instant::now();
            let result = orchestrator.run(inbound, sink.clone()).await;
            let session = orchestrator.session();
            CallReport {
                call_id,
                script: script.name,
                final_state: session.current_state.clone(),
                turns: session.history.len(),
                chunks_out: sink.len(),
                elapsed: started.elapsed(),
                failed: result.is_err(),
            }
        }));
    }

    let mut reports = Vec::with_capacity(calls);
    for handle in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(err) => warn!(error = %err, "call task panicked"),
        }
    }
    reports
}

pub fn log_summary(reports: &[CallReport]) {
    for report in reports {
        info!(
            call_id = %report.call_id,
            script = report.script,
            final_state = %report.final_state,
            turns = report.turns,
            chunks_out = report.chunks_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            failed = report.failed,
            "call report"
        );
    }
    let failed = reports.iter().filter(|r| r.failed).count();
    let avg_ms = if reports.is_empty() {
        0.0
    } else {
        reports.iter().map(|r| r.elapsed.as_secs_f64() * 1000.0).sum::<f64>() / reports.len() as f64
    };
    info!(
        total = reports.len(),
        failed,
        avg_ms = avg_ms.round() as u64,
        "simulation finished"
    );
}
