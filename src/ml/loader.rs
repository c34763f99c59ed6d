//! Sample decoding and the bounded producer/consumer batch pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use image::imageops::FilterType;
use thiserror::Error;

use crate::dataset::Sample;

/// Per-sample load failure. Recovered by the pipeline, never propagated.
#[derive(Debug, Error)]
pub enum SampleLoadError {
    #[error("No image folder configured for source '{0}'")]
    UnknownSource(String),
    #[error("Image not found at {0}")]
    Missing(PathBuf),
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Loader produced {found} values, expected {expected}")]
    Length { expected: usize, found: usize },
}

/// A loader worker stopped before delivering all of its batches.
///
/// Unlike [`SampleLoadError`] this is not recoverable: the epoch would be missing samples.
#[derive(Debug, Error)]
#[error("Loader worker {worker} stopped before delivering batch {batch} of {total}: {reason}")]
pub struct PipelineError {
    pub worker: usize,
    pub batch: usize,
    pub total: usize,
    pub reason: String,
}

/// Turns one sample into a flat input vector of [`SampleLoader::input_len`] values.
pub trait SampleLoader: Send + Sync {
    fn input_len(&self) -> usize;
    fn load(&self, sample: &Sample) -> Result<Vec<f32>, SampleLoadError>;
}

/// Decodes RGB images, resizes them to `size x size` and normalizes per channel.
///
/// Output layout is channel-major (`[3][size][size]`).
#[derive(Debug, Clone)]
pub struct ImageSampleLoader {
    roots: BTreeMap<String, PathBuf>,
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl ImageSampleLoader {
    pub fn new(roots: BTreeMap<String, PathBuf>, size: u32, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            roots,
            size,
            mean,
            std,
        }
    }

    fn path_for(&self, sample: &Sample) -> Result<PathBuf, SampleLoadError> {
        self.roots
            .get(&sample.source)
            .map(|root| root.join(&sample.blob))
            .ok_or_else(|| SampleLoadError::UnknownSource(sample.source.clone()))
    }
}

impl SampleLoader for ImageSampleLoader {
    fn input_len(&self) -> usize {
        3 * (self.size as usize) * (self.size as usize)
    }

    fn load(&self, sample: &Sample) -> Result<Vec<f32>, SampleLoadError> {
        let path = self.path_for(sample)?;
        if !path.is_file() {
            return Err(SampleLoadError::Missing(path));
        }
        let image = image::open(&path)
            .map_err(|source| SampleLoadError::Decode {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        let resized = image::imageops::resize(&image, self.size, self.size, FilterType::Triangle);
        let plane = (self.size as usize) * (self.size as usize);
        let mut out = vec![0.0f32; 3 * plane];
        for (idx, pixel) in resized.pixels().enumerate() {
            for channel in 0..3 {
                let value = pixel.0[channel] as f32 / 255.0;
                out[channel * plane + idx] = (value - self.mean[channel]) / self.std[channel];
            }
        }
        Ok(out)
    }
}

/// A sample that could not be loaded and was replaced by zeros.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFailure {
    pub sample_id: String,
    pub reason: String,
}

/// One batch in consumption order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub inputs: Vec<Vec<f32>>,
    pub targets: Vec<usize>,
    pub failures: Vec<LoadFailure>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Samples with their class indices, shared read-only with the workers.
#[derive(Debug, Clone)]
pub struct LabeledSamples {
    samples: Arc<Vec<Sample>>,
    targets: Arc<Vec<usize>>,
}

impl LabeledSamples {
    pub fn new(samples: Vec<Sample>, targets: Vec<usize>) -> Self {
        Self {
            samples: Arc::new(samples),
            targets: Arc::new(targets),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn targets(&self) -> &[usize] {
        &self.targets
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub num_workers: usize,
    /// Batches each worker may have ready ahead of the consumer.
    pub prefetch_batches: usize,
}

/// Fixed worker pool producing batches into bounded channels.
///
/// Worker `w` builds batches `w, w + W, w + 2W, ...` and owns one bounded
/// channel; the consumer reads them round-robin, so batches arrive in order and
/// no worker runs more than `prefetch_batches` ahead. Dropping the pipeline
/// stops the workers. A worker that dies mid-epoch yields one [`PipelineError`]
/// and ends the iteration.
pub struct BatchPipeline {
    receivers: Vec<Receiver<Batch>>,
    handles: Vec<Option<JoinHandle<()>>>,
    next: usize,
    total: usize,
    cancel: Arc<AtomicBool>,
}

impl BatchPipeline {
    /// Start loading `order` (indices into `data`) in batches.
    pub fn spawn(
        loader: Arc<dyn SampleLoader>,
        data: &LabeledSamples,
        order: Vec<usize>,
        options: PipelineOptions,
    ) -> Self {
        let batch_size = options.batch_size.max(1);
        let total = order.len().div_ceil(batch_size);
        let workers = options.num_workers.max(1).min(total.max(1));
        let order = Arc::new(order);
        let cancel = Arc::new(AtomicBool::new(false));

        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = sync_channel::<Batch>(options.prefetch_batches.max(1));
            receivers.push(rx);
            let job = WorkerJob {
                loader: Arc::clone(&loader),
                data: data.clone(),
                order: Arc::clone(&order),
                cancel: Arc::clone(&cancel),
                batch_size,
                first: worker,
                stride: workers,
                total,
            };
            handles.push(Some(thread::spawn(move || job.run(tx))));
        }

        Self {
            receivers,
            handles,
            next: 0,
            total,
            cancel,
        }
    }

    pub fn batch_count(&self) -> usize {
        self.total
    }
}

impl BatchPipeline {
    fn worker_failure(&mut self, worker: usize) -> PipelineError {
        let reason = match self.handles.get_mut(worker).and_then(Option::take) {
            Some(handle) => match handle.join() {
                Ok(()) => "worker exited early".to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            },
            None => "worker already reported".to_string(),
        };
        PipelineError {
            worker,
            batch: self.next,
            total: self.total,
            reason,
        }
    }
}

impl Iterator for BatchPipeline {
    type Item = Result<Batch, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let worker = self.next % self.receivers.len();
        let received = self.receivers[worker].recv();
        match received {
            Ok(batch) => {
                self.next += 1;
                Some(Ok(batch))
            }
            Err(_) => {
                let err = self.worker_failure(worker);
                self.next = self.total;
                self.cancel.store(true, Ordering::Relaxed);
                Some(Err(err))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

impl Drop for BatchPipeline {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

struct WorkerJob {
    loader: Arc<dyn SampleLoader>,
    data: LabeledSamples,
    order: Arc<Vec<usize>>,
    cancel: Arc<AtomicBool>,
    batch_size: usize,
    first: usize,
    stride: usize,
    total: usize,
}

impl WorkerJob {
    fn run(self, tx: SyncSender<Batch>) {
        let mut index = self.first;
        while index < self.total {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }
            let batch = self.build(index);
            if tx.send(batch).is_err() {
                return;
            }
            index += self.stride;
        }
    }

    fn build(&self, index: usize) -> Batch {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.order.len());
        let expected = self.loader.input_len();
        let mut batch = Batch {
            index,
            inputs: Vec::with_capacity(end - start),
            targets: Vec::with_capacity(end - start),
            failures: Vec::new(),
        };
        for &sample_idx in &self.order[start..end] {
            let sample = &self.data.samples()[sample_idx];
            let loaded = self.loader.load(sample).and_then(|values| {
                if values.len() == expected {
                    Ok(values)
                } else {
                    Err(SampleLoadError::Length {
                        expected,
                        found: values.len(),
                    })
                }
            });
            let input = loaded.unwrap_or_else(|err| {
                batch.failures.push(LoadFailure {
                    sample_id: sample.id.clone(),
                    reason: err.to_string(),
                });
                vec![0.0; expected]
            });
            batch.inputs.push(input);
            batch.targets.push(self.data.targets()[sample_idx]);
        }
        batch
    }
}
