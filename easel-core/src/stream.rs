//! Relays progress from a blocking generation to an async event stream.
//!
//! The generation runs on the blocking pool and pushes [`ProgressEvent`]s
//! into a bounded channel, followed by an explicit [`BridgeMessage::Done`].
//! The consumer side ends right after the first terminal event, so nothing
//! queued before it is lost.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    GenerationRequest, ImageToImageRequest, Orchestrator, ProgressEvent, ProgressScale, TaskKind,
};

const NO_RESULT: &str = "Generation completed but no result found";
const WORKER_LOST: &str = "Generation worker stopped unexpectedly";

#[derive(Debug, Clone)]
pub enum GenerationJob {
    TextToImage(GenerationRequest),
    ImageToImage(ImageToImageRequest),
}

impl GenerationJob {
    pub fn task(&self) -> TaskKind {
        match self {
            GenerationJob::TextToImage(_) => TaskKind::TextToImage,
            GenerationJob::ImageToImage(_) => TaskKind::ImageToImage,
        }
    }

    fn requested_steps(&self) -> usize {
        match self {
            GenerationJob::TextToImage(r) => r.num_inference_steps as usize,
            GenerationJob::ImageToImage(r) => r.num_inference_steps as usize,
        }
    }

    fn initial_stage(&self) -> &'static str {
        match self {
            GenerationJob::TextToImage(_) => "Initializing",
            GenerationJob::ImageToImage(_) => "Initializing img2img",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    /// How long the consumer waits for the next event before re-polling.
    pub poll_interval: Duration,
    /// Emit a heartbeat event on every empty poll.
    pub heartbeat: bool,
    pub capacity: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            heartbeat: true,
            capacity: 64,
        }
    }
}

#[derive(Debug)]
pub enum BridgeMessage {
    Event(ProgressEvent),
    Done,
}

/// Start `job` on the blocking pool and return its progress stream.
///
/// Must be called from within a Tokio runtime. Dropping the stream does not
/// cancel the generation; the worker finishes and its remaining events are
/// discarded.
pub fn stream_generation(
    orchestrator: Arc<Orchestrator>,
    job: GenerationJob,
    options: BridgeOptions,
) -> impl Stream<Item = ProgressEvent> + Send + 'static {
    let scale = ProgressScale::for_task(job.task());
    let initial = scale.event(0, job.requested_steps(), job.initial_stage());
    let (tx, rx) = mpsc::channel(options.capacity.max(1));

    tokio::task::spawn_blocking(move || run_job(&orchestrator, job, scale, tx));

    stream::iter([initial]).chain(relay(rx, options))
}

fn run_job(
    orchestrator: &Orchestrator,
    job: GenerationJob,
    scale: ProgressScale,
    tx: mpsc::Sender<BridgeMessage>,
) {
    let mut sink = |step: usize, total: usize, stage: &str| {
        // A closed channel means the client went away; keep generating.
        let _ = tx.blocking_send(BridgeMessage::Event(scale.event(step, total, stage)));
    };

    let outcome = match &job {
        GenerationJob::TextToImage(request) => orchestrator.generate(request, &mut sink),
        GenerationJob::ImageToImage(request) => orchestrator.generate_img2img(request, &mut sink),
    };

    let terminal = match outcome {
        Ok(artifact) => ProgressEvent::Complete {
            filename: artifact.filename,
            image_url: artifact.image_url,
            generation_time: artifact.generation_time,
        },
        Err(e) => ProgressEvent::Error {
            message: e.to_string(),
        },
    };
    if tx.blocking_send(BridgeMessage::Event(terminal)).is_err() {
        debug!(task = %job.task(), "progress stream closed before the result was delivered");
    }
    let _ = tx.blocking_send(BridgeMessage::Done);
}

/// Turn bridge messages into progress events, ending after the first
/// terminal event.
pub fn relay(
    rx: mpsc::Receiver<BridgeMessage>,
    options: BridgeOptions,
) -> impl Stream<Item = ProgressEvent> + Send + 'static {
    stream::unfold(Some(rx), move |rx| async move {
        let Some(mut rx) = rx else {
            return None;
        };
        loop {
            match timeout(options.poll_interval, rx.recv()).await {
                Ok(Some(BridgeMessage::Event(event))) => {
                    let next = (!event.is_terminal()).then_some(rx);
                    return Some((event, next));
                }
                Ok(Some(BridgeMessage::Done)) => {
                    warn!("generation finished without a result");
                    return Some((error_event(NO_RESULT), None));
                }
                Ok(None) => {
                    warn!("generation worker went away without finishing");
                    return Some((error_event(WORKER_LOST), None));
                }
                Err(_) if options.heartbeat => return Some((ProgressEvent::Heartbeat, Some(rx))),
                Err(_) => continue,
            }
        }
    })
}

fn error_event(message: &str) -> ProgressEvent {
    ProgressEvent::Error {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::test::FakeFactory;
    use crate::registry::test::add_model;
    use crate::{EaselError, OrchestratorConfig};
    use std::fs;
    use tempfile::TempDir;

    fn quiet() -> BridgeOptions {
        BridgeOptions {
            poll_interval: Duration::from_millis(20),
            heartbeat: false,
            capacity: 4,
        }
    }

    fn setup(factory: FakeFactory) -> (TempDir, Arc<Orchestrator>) {
        let dir = TempDir::new().unwrap();
        let models = dir.path().join("models");
        add_model(&models, "sdxl-turbo", Some("StableDiffusionXLPipeline"));
        let config = OrchestratorConfig::new(models, dir.path().join("outputs"));
        let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(factory)));
        (dir, orchestrator)
    }

    fn terminal_count(events: &[ProgressEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test]
    async fn successful_generation_streams_to_completion() {
        let (_dir, orch) = setup(FakeFactory::default());
        let mut request = GenerationRequest::new("harbor at night");
        request.num_inference_steps = 3;

        let events: Vec<_> =
            stream_generation(orch, GenerationJob::TextToImage(request), quiet())
                .collect()
                .await;

        assert_eq!(
            events.first(),
            Some(&ProgressEvent::Progress {
                step: 0,
                total_steps: 3,
                stage: "Initializing".into(),
                progress: 0.0,
            })
        );
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
        assert_eq!(terminal_count(&events), 1);

        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert_eq!(percents.len(), 7);
        assert_eq!(&percents[..3], &[0.0, 5.0, 10.0]);
        assert_eq!(&percents[5..], &[90.0, 95.0]);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn failure_mid_flight_ends_with_one_error() {
        let (_dir, orch) = setup(FakeFactory {
            fail_with: Some(|| EaselError::NotFound("model_index.json".into())),
            ..FakeFactory::default()
        });
        let mut request = GenerationRequest::new("doomed");
        request.num_inference_steps = 4;

        let events: Vec<_> =
            stream_generation(orch, GenerationJob::TextToImage(request), quiet())
                .collect()
                .await;

        assert_eq!(terminal_count(&events), 1);
        match events.last() {
            Some(ProgressEvent::Error { message }) => assert!(message.contains("model_index.json")),
            other => panic!("expected a trailing error, got {other:?}"),
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Progress { stage, .. } if stage.starts_with("Generating"))));
    }

    #[tokio::test]
    async fn img2img_stream_starts_with_its_own_label() {
        let (_dir, orch) = setup(FakeFactory::default());
        let request = ImageToImageRequest::new("sketch", "%%%");

        let events: Vec<_> =
            stream_generation(orch, GenerationJob::ImageToImage(request), quiet())
                .collect()
                .await;

        assert!(matches!(
            events.first(),
            Some(ProgressEvent::Progress { stage, total_steps: 20, .. }) if stage == "Initializing img2img"
        ));
        assert!(matches!(events.last(), Some(ProgressEvent::Error { .. })));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn slow_builds_emit_heartbeats() {
        let (_dir, orch) = setup(FakeFactory {
            delay: Some(Duration::from_millis(200)),
            ..FakeFactory::default()
        });
        let options = BridgeOptions {
            poll_interval: Duration::from_millis(10),
            heartbeat: true,
            capacity: 4,
        };

        let events: Vec<_> = stream_generation(
            orch,
            GenerationJob::TextToImage(GenerationRequest::new("patience")),
            options,
        )
        .collect()
        .await;

        assert!(events.contains(&ProgressEvent::Heartbeat));
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn dropped_stream_lets_the_worker_finish() {
        let (dir, orch) = setup(FakeFactory::default());
        let outputs = dir.path().join("outputs");

        let mut events = Box::pin(stream_generation(
            orch,
            GenerationJob::TextToImage(GenerationRequest::new("abandoned")),
            quiet(),
        ));
        events.next().await;
        drop(events);

        let mut saved = false;
        for _ in 0..100 {
            if fs::read_dir(&outputs).map(|mut d| d.next().is_some()).unwrap_or(false) {
                saved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(saved);
    }

    #[tokio::test]
    async fn done_without_result_is_an_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(BridgeMessage::Event(ProgressScale::for_task(TaskKind::TextToImage).event(
            1,
            2,
            "Generating (step 1/2)",
        )))
        .await
        .unwrap();
        tx.send(BridgeMessage::Done).await.unwrap();

        let events: Vec<_> = relay(rx, quiet()).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], error_event(NO_RESULT));
    }

    #[tokio::test]
    async fn vanished_worker_is_an_error() {
        let (tx, rx) = mpsc::channel::<BridgeMessage>(4);
        drop(tx);
        let events: Vec<_> = relay(rx, quiet()).collect().await;
        assert_eq!(events, vec![error_event(WORKER_LOST)]);
    }
}
