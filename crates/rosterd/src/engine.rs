use roster_core::stats::TrainingStatistics;
use roster_core::{imaging, FacePipeline, Recognition, RecognizeError, TrainError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image error: {0}")]
    Image(#[from] imaging::ImageError),
    #[error("recognition error: {0}")]
    Recognize(#[from] RecognizeError),
    #[error("training error: {0}")]
    Train(#[from] TrainError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("recognition worker panicked")]
    WorkerPanicked,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Progress of the most recent training request, polled via `Status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainStatus {
    Idle,
    Queued { dataset: String },
    Training { dataset: String },
    Succeeded { dataset: String, total_faces: usize, total_people: usize },
    Failed { dataset: String, error: String },
}

/// Messages sent from D-Bus handlers to the training thread.
enum EngineRequest {
    Train {
        ticket: u64,
        dataset: PathBuf,
        reply: Option<oneshot::Sender<Result<TrainingStatistics, EngineError>>>,
    },
}

/// Clone-safe handle to the engine.
///
/// Training runs one request at a time on a dedicated OS thread. Recognition
/// runs on the blocking pool against whatever model is currently published,
/// so it keeps answering while a retrain is in flight.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    pipeline: Arc<FacePipeline>,
    status: Arc<Mutex<StatusBoard>>,
}

/// Status of the newest training request. Each request takes a ticket; only
/// the holder of the newest ticket may write, so a run that finishes after a
/// later request was queued cannot overwrite that request's `Queued`.
#[derive(Debug)]
struct StatusBoard {
    latest: u64,
    status: TrainStatus,
}

impl StatusBoard {
    fn issue(&mut self, dataset: &Path) -> u64 {
        self.latest += 1;
        self.status = TrainStatus::Queued { dataset: dataset.display().to_string() };
        self.latest
    }
}

impl EngineHandle {
    pub fn pipeline(&self) -> &FacePipeline {
        &self.pipeline
    }

    pub fn train_status(&self) -> TrainStatus {
        lock(&self.status).status.clone()
    }

    /// Queue a training run and return once it is accepted.
    pub async fn queue_train(&self, dataset: PathBuf) -> Result<(), EngineError> {
        let ticket = lock(&self.status).issue(&dataset);
        self.tx
            .send(EngineRequest::Train { ticket, dataset, reply: None })
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Train and wait for the outcome.
    pub async fn train(&self, dataset: PathBuf) -> Result<TrainingStatistics, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let ticket = lock(&self.status).issue(&dataset);
        self.tx
            .send(EngineRequest::Train {
                ticket,
                dataset,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Load the image at `path` and recognize every face in it.
    pub async fn recognize(&self, path: PathBuf) -> Result<Vec<Recognition>, EngineError> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || run_recognize(&pipeline, &path))
            .await
            .map_err(|_| EngineError::WorkerPanicked)?
    }
}

fn lock(board: &Mutex<StatusBoard>) -> MutexGuard<'_, StatusBoard> {
    board.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record `next` unless a newer request has been queued since `ticket`.
fn set_status(board: &Mutex<StatusBoard>, ticket: u64, next: TrainStatus) {
    let mut board = lock(board);
    if board.latest == ticket {
        board.status = next;
    }
}

/// Spawn the training thread.
pub fn spawn_engine(pipeline: Arc<FacePipeline>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let status = Arc::new(Mutex::new(StatusBoard { latest: 0, status: TrainStatus::Idle }));

    let worker_pipeline = Arc::clone(&pipeline);
    let worker_status = Arc::clone(&status);
    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Train { ticket, dataset, reply } => {
                        let result = run_train(&worker_pipeline, &worker_status, ticket, &dataset);
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, pipeline, status })
}

fn run_train(
    pipeline: &FacePipeline,
    status: &Mutex<StatusBoard>,
    ticket: u64,
    dataset: &Path,
) -> Result<TrainingStatistics, EngineError> {
    let name = dataset.display().to_string();
    set_status(status, ticket, TrainStatus::Training { dataset: name.clone() });

    match pipeline.train(dataset) {
        Ok(stats) => {
            set_status(
                status,
                ticket,
                TrainStatus::Succeeded {
                    dataset: name,
                    total_faces: stats.total_faces,
                    total_people: stats.total_people,
                },
            );
            Ok(stats)
        }
        Err(e) => {
            tracing::warn!(dataset = %name, error = %e, "training failed");
            set_status(status, ticket, TrainStatus::Failed { dataset: name, error: e.to_string() });
            Err(e.into())
        }
    }
}

fn run_recognize(pipeline: &FacePipeline, path: &Path) -> Result<Vec<Recognition>, EngineError> {
    let image = imaging::load(path)?;
    let results = pipeline.recognize(&image)?;
    tracing::info!(
        path = %path.display(),
        faces = results.len(),
        known = results.iter().filter(|r| r.is_known()).count(),
        "recognition complete"
    );
    Ok(results)
}
