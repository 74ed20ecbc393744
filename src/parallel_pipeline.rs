// THEORY:
// The `parallel_pipeline` module runs the per-image half of `ColonyPipeline`
// on a fixed pool of workers and feeds the per-run half with the results.
//
// Key architectural principles:
// 1.  **Descriptors in, analyses out**: a task carries an `ImageDescriptor`
//     and a oneshot sender, nothing else. The worker loads the pixels itself,
//     processes them on a blocking thread and drops them before it reports.
//     A worker handles one task at a time, so at most `worker_count` pixel
//     buffers are alive at once however many images are queued.
// 2.  **One shared queue**: every worker pulls its next task from the same
//     receiver, so a slow image only ever holds up the worker that took it.
// 3.  **Completion order is irrelevant**: results are collected as they
//     finish and the run-level half sorts them by capture time before any
//     matching happens.
// 4.  **Containment**: a missing plate, an unreadable file or a panic inside
//     a worker turns into a `SkippedImage`. Siblings keep running.
// 5.  **Observation only**: the `ProgressObserver` is told when an image
//     starts and completes. Nothing it does, panicking included, can change
//     the result.

use crate::config::AnalysisConfig;
use crate::core_modules::frame::ImageDescriptor;
use crate::error::{ColonyError, ColonyResult};
use crate::pipeline::{AnalysisReport, ColonyPipeline, ImageAnalysis, SkippedImage, capture_order};
use crate::source::ImageLoader;
use futures::stream::{FuturesUnordered, StreamExt};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

/// How one image ended, as reported to a `ProgressObserver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Processed {
        plates: usize,
        colonies: usize,
        missing_plates: usize,
    },
    Skipped {
        reason: String,
    },
}

impl ImageStatus {
    fn from_result(result: &TaskResult) -> Self {
        match result {
            Ok(analysis) => ImageStatus::Processed {
                plates: analysis.timepoints.len(),
                colonies: analysis.colony_count(),
                missing_plates: analysis.missing_plates.len(),
            },
            Err(error) => ImageStatus::Skipped {
                reason: error.to_string(),
            },
        }
    }
}

/// Side-effect-only progress notifications. All methods default to no-ops.
///
/// Called from worker tasks, possibly concurrently. A panic inside a callback
/// is caught and logged.
pub trait ProgressObserver: Send + Sync {
    /// The run is about to dispatch `total_images` images.
    fn run_started(&self, _total_images: usize) {}

    /// A worker is about to load `descriptor`.
    fn image_started(&self, _descriptor: &ImageDescriptor) {}

    /// A worker finished with `descriptor` and has released its pixels.
    fn image_completed(&self, _descriptor: &ImageDescriptor, _status: &ImageStatus) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Observer that logs each completed image with a running count.
#[derive(Debug, Default)]
pub struct LoggingProgress {
    total: AtomicUsize,
    completed: AtomicUsize,
}

impl LoggingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}

impl ProgressObserver for LoggingProgress {
    fn run_started(&self, total_images: usize) {
        self.total.store(total_images, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        info!(total_images, "processing images");
    }

    fn image_completed(&self, descriptor: &ImageDescriptor, status: &ImageStatus) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total.load(Ordering::Relaxed);
        match status {
            ImageStatus::Processed {
                plates,
                colonies,
                missing_plates,
            } => info!(
                completed,
                total,
                plates,
                colonies,
                missing_plates,
                path = %descriptor.path.display(),
                "image processed"
            ),
            ImageStatus::Skipped { reason } => warn!(
                completed,
                total,
                %reason,
                path = %descriptor.path.display(),
                "image skipped"
            ),
        }
    }
}

/// Runs one observer callback, swallowing any panic it raises.
fn notify(callback: &'static str, notification: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(notification)).is_err() {
        warn!(callback, "progress observer panicked; notification dropped");
    }
}

pub type TaskResult = ColonyResult<ImageAnalysis>;

pub struct ImageTask {
    pub descriptor: ImageDescriptor,
    pub result_sender: oneshot::Sender<TaskResult>,
}

/// Everything a worker needs, shared read-only by all of them.
#[derive(Clone)]
struct WorkerContext {
    pipeline: Arc<ColonyPipeline>,
    loader: Arc<dyn ImageLoader>,
    observer: Arc<dyn ProgressObserver>,
}

/// A fixed set of workers pulling from one shared task queue.
pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<ImageTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` workers on the current runtime.
    pub fn new(
        worker_count: usize,
        pipeline: Arc<ColonyPipeline>,
        loader: Arc<dyn ImageLoader>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, task_receiver) = mpsc::unbounded_channel::<ImageTask>();
        let task_receiver = Arc::new(Mutex::new(task_receiver));
        let context = WorkerContext {
            pipeline,
            loader,
            observer,
        };

        let workers = (0..worker_count)
            .map(|worker_id| {
                let context = context.clone();
                let task_receiver = Arc::clone(&task_receiver);
                tokio::spawn(async move {
                    loop {
                        // The lock is held only while waiting for the next task.
                        let next = task_receiver.lock().await.recv().await;
                        let Some(task) = next else { break };
                        let result = Self::process_image_worker(&context, &task.descriptor).await;
                        debug!(worker_id, path = %task.descriptor.path.display(), ok = result.is_ok(), "task finished");
                        let _ = task.result_sender.send(result);
                    }
                })
            })
            .collect();

        Self { task_sender, workers }
    }

    async fn process_image_worker(context: &WorkerContext, descriptor: &ImageDescriptor) -> TaskResult {
        notify("image_started", || context.observer.image_started(descriptor));

        let pipeline = Arc::clone(&context.pipeline);
        let loader = Arc::clone(&context.loader);
        let owned = descriptor.clone();
        // Pixels live only inside this closure.
        let result = tokio::task::spawn_blocking(move || {
            let image = loader.load(&owned).map_err(|error| {
                ColonyError::WorkerTaskFailure(format!("cannot load {}: {error}", owned.path.display()))
            })?;
            pipeline.process_image(&image)
        })
        .await
        .unwrap_or_else(|join_error| {
            Err(ColonyError::WorkerTaskFailure(format!(
                "worker panicked while processing {}: {join_error}",
                descriptor.path.display()
            )))
        });

        let status = ImageStatus::from_result(&result);
        notify("image_completed", || context.observer.image_completed(descriptor, &status));
        result
    }

    /// Queues one image. The receiver resolves once a worker has processed it,
    /// or fails if the pool shut down first.
    pub fn submit(&self, descriptor: ImageDescriptor) -> oneshot::Receiver<TaskResult> {
        let (result_sender, result_receiver) = oneshot::channel();
        let _ = self.task_sender.send(ImageTask {
            descriptor,
            result_sender,
        });
        result_receiver
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue and waits for every worker to drain it.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            if let Err(error) = worker.await {
                warn!(%error, "worker ended abnormally");
            }
        }
    }
}

/// Drives a whole run: parallel per-image processing, then sequential
/// matching and aggregation.
pub struct ProcessingOrchestrator {
    pipeline: Arc<ColonyPipeline>,
    worker_count: usize,
}

impl ProcessingOrchestrator {
    pub fn new(config: AnalysisConfig) -> ColonyResult<Self> {
        let worker_count = config.workers.resolved_worker_count();
        let pipeline = ColonyPipeline::new(config)?;
        Ok(Self {
            pipeline: Arc::new(pipeline),
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Processes every descriptor and returns the growth report.
    ///
    /// Fails with `EmptyColonySet` when no image yields a colony, and with
    /// `OutOfOrderTimepoint` only if matching is handed an unsorted sequence,
    /// which the sort here rules out.
    pub async fn run(
        &self,
        descriptors: Vec<ImageDescriptor>,
        loader: Arc<dyn ImageLoader>,
        observer: Arc<dyn ProgressObserver>,
    ) -> ColonyResult<AnalysisReport> {
        let total = descriptors.len();
        info!(images = total, workers = self.worker_count, "starting run");
        notify("run_started", || observer.run_started(total));

        let pipeline = if self.pipeline.config().plate.align_to_reference {
            Arc::new(self.anchor(&descriptors, &loader).await)
        } else {
            Arc::clone(&self.pipeline)
        };

        let pool = WorkerPool::new(self.worker_count, Arc::clone(&pipeline), loader, observer);
        let mut pending: FuturesUnordered<_> = descriptors
            .into_iter()
            .map(|descriptor| {
                let receiver = pool.submit(descriptor.clone());
                async move { (descriptor, receiver.await) }
            })
            .collect();

        let mut timepoints = Vec::new();
        let mut skipped: Vec<(Duration, SkippedImage)> = Vec::new();
        while let Some((descriptor, received)) = pending.next().await {
            let result = received.unwrap_or_else(|_| {
                Err(ColonyError::WorkerTaskFailure(
                    "worker exited before reporting a result".to_string(),
                ))
            });
            match result {
                Ok(analysis) => {
                    skipped.extend(
                        analysis
                            .skipped_plates(&descriptor.path)
                            .map(|entry| (descriptor.timestamp, entry)),
                    );
                    timepoints.extend(analysis.timepoints);
                }
                Err(error) => {
                    warn!(path = %descriptor.path.display(), %error, "image skipped");
                    skipped.push((descriptor.timestamp, SkippedImage::image(&descriptor.path, &error)));
                }
            }
        }
        pool.shutdown().await;

        skipped.sort_by(|(a_time, a), (b_time, b)| {
            a_time
                .cmp(b_time)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.plate_id.cmp(&b.plate_id))
        });
        let skipped = skipped.into_iter().map(|(_, entry)| entry).collect();
        pipeline.analyse(timepoints, skipped)
    }

    /// Loads candidates in capture order until one can anchor the pipeline.
    /// Only one reference image is resident at a time.
    async fn anchor(&self, descriptors: &[ImageDescriptor], loader: &Arc<dyn ImageLoader>) -> ColonyPipeline {
        let mut ordered: Vec<&ImageDescriptor> = descriptors.iter().collect();
        ordered.sort_by(|a, b| capture_order(a, b));
        for descriptor in ordered {
            let pipeline = Arc::clone(&self.pipeline);
            let loader = Arc::clone(loader);
            let owned = descriptor.clone();
            let anchored = tokio::task::spawn_blocking(move || {
                let image = loader.load(&owned)?;
                pipeline.anchored_to(&image)
            })
            .await;
            match anchored {
                Ok(Ok(pipeline)) => return pipeline,
                Ok(Err(error)) => warn!(path = %descriptor.path.display(), %error, "unusable alignment reference"),
                Err(join_error) => warn!(path = %descriptor.path.display(), %join_error, "alignment reference panicked"),
            }
        }
        warn!("no image can serve as alignment reference; processing unaligned");
        self.pipeline.as_ref().clone()
    }
}
