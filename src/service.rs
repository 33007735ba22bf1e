//! Replica pool fanning batched requests out to futures.
//!
//! Each worker thread owns one [`WhisperDriver`]; requests are posted to a
//! shared queue and every batch item resolves through its own oneshot
//! future once the replica finishes the batch.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use candle::Tensor;
use tokio::sync::oneshot;

use crate::driver::{WhisperDriver, WhisperGenerationResult, WhisperOptions};
use crate::error::{Error, Result};

type Job = Box<dyn FnOnce(&mut WhisperDriver) + Send>;

pub struct WhisperService {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
    multilingual: bool,
}

impl WhisperService {
    /// Starts one worker thread per replica. The replicas share the
    /// immutable model; their decoder states never are.
    pub fn new(replicas: Vec<WhisperDriver>) -> Result<Self> {
        let multilingual = replicas
            .first()
            .map(WhisperDriver::is_multilingual)
            .ok_or_else(|| Error::invalid_argument("the service requires at least one replica"))?;

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = replicas
            .into_iter()
            .map(|mut driver| {
                let receiver = receiver.clone();
                thread::spawn(move || loop {
                    let job = match receiver.lock().unwrap().recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    };
                    job(&mut driver);
                })
            })
            .collect();

        Ok(Self {
            sender: Some(sender),
            workers,
            multilingual,
        })
    }

    pub fn is_multilingual(&self) -> bool {
        self.multilingual
    }

    /// Submits a batch and returns one future per batch item, in input
    /// order.
    pub fn generate(
        &self,
        features: Tensor,
        prompts: Vec<Vec<u32>>,
        options: WhisperOptions,
    ) -> Result<Vec<oneshot::Receiver<Result<WhisperGenerationResult>>>> {
        let batch_size = prompts.len();
        self.post_batch(batch_size, move |driver| {
            driver.generate(&features, &prompts, &options)
        })
    }

    /// Token-string variant of [`WhisperService::generate`].
    pub fn generate_from_tokens(
        &self,
        features: Tensor,
        prompts: Vec<Vec<String>>,
        options: WhisperOptions,
    ) -> Result<Vec<oneshot::Receiver<Result<WhisperGenerationResult>>>> {
        let batch_size = prompts.len();
        self.post_batch(batch_size, move |driver| {
            driver.generate_from_tokens(&features, &prompts, &options)
        })
    }

    /// Ranks languages for each batch item of the features.
    pub fn detect_language(
        &self,
        features: Tensor,
    ) -> Result<Vec<oneshot::Receiver<Result<Vec<(String, f32)>>>>> {
        let batch_size = features.dim(0)?;
        self.post_batch(batch_size, move |driver| driver.detect_language(&features))
    }

    fn post_batch<T, F>(
        &self,
        batch_size: usize,
        run: F,
    ) -> Result<Vec<oneshot::Receiver<Result<T>>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut WhisperDriver) -> Result<Vec<T>> + Send + 'static,
    {
        let mut senders = Vec::with_capacity(batch_size);
        let mut receivers = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let (tx, rx) = oneshot::channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let job: Job = Box::new(move |driver| match run(driver) {
            Ok(results) if results.len() == senders.len() => {
                for (sender, result) in senders.into_iter().zip(results) {
                    let _ = sender.send(Ok(result));
                }
            }
            Ok(results) => {
                let msg = format!(
                    "the replica returned {} results for a batch of {}",
                    results.len(),
                    senders.len()
                );
                for sender in senders {
                    let _ = sender.send(Err(Error::runtime(msg.clone())));
                }
            }
            Err(err) => {
                let msg = err.to_string();
                for sender in senders {
                    let _ = sender.send(Err(Error::runtime(msg.clone())));
                }
            }
        });

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::runtime("the service is shut down"))?;
        sender
            .send(job)
            .map_err(|_| Error::runtime("the service workers are gone"))?;
        Ok(receivers)
    }
}

impl Drop for WhisperService {
    fn drop(&mut self) {
        // Closing the queue lets the workers drain and exit.
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
