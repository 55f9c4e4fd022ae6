//! Bounded hand-off between the network receive loop and the playback thread.
//!
//! The producer side is async and suspends while the channel is full, so a
//! slow device pushes back on the socket instead of losing audio. The consumer
//! side blocks, and is meant to run on a dedicated blocking thread.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Default number of chunks the pipeline buffers before applying backpressure.
pub const DEFAULT_CAPACITY: usize = 64;

/// What the consumer gets out of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineItem {
    Chunk(Bytes),
    EndOfStream,
}

/// The consumer has gone away; nothing pushed will be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Audio pipeline consumer is gone")]
pub struct PipelineClosed;

/// Creates a fresh pipeline for one turn.
pub fn audio_pipeline(capacity: usize) -> (AudioProducer, AudioConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        AudioProducer { tx: Some(tx) },
        AudioConsumer {
            rx,
            exhausted: false,
        },
    )
}

#[derive(Debug)]
pub struct AudioProducer {
    tx: Option<mpsc::Sender<PipelineItem>>,
}

impl AudioProducer {
    /// Queues a chunk, waiting for room if the pipeline is full.
    pub async fn push(&self, chunk: Bytes) -> Result<(), PipelineClosed> {
        let tx = self.tx.as_ref().ok_or(PipelineClosed)?;
        tx.send(PipelineItem::Chunk(chunk))
            .await
            .map_err(|_| PipelineClosed)
    }

    /// Queues the end-of-stream marker. Only the first call has any effect.
    pub async fn push_end_of_stream(&mut self) {
        if let Some(tx) = self.tx.take() {
            if tx.send(PipelineItem::EndOfStream).await.is_err() {
                debug!("Playback consumer already stopped; end-of-stream not delivered.");
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.tx.is_none()
    }
}

#[derive(Debug)]
pub struct AudioConsumer {
    rx: mpsc::Receiver<PipelineItem>,
    exhausted: bool,
}

impl AudioConsumer {
    /// Blocks until the next chunk or the end-of-stream marker arrives.
    ///
    /// Must not be called from within an async context. A producer dropped
    /// without sending the marker is reported as end-of-stream.
    pub fn take(&mut self) -> PipelineItem {
        if self.exhausted {
            return PipelineItem::EndOfStream;
        }
        let item = self.rx.blocking_recv();
        self.settle(item)
    }

    /// Async counterpart of [`AudioConsumer::take`].
    pub async fn take_async(&mut self) -> PipelineItem {
        if self.exhausted {
            return PipelineItem::EndOfStream;
        }
        let item = self.rx.recv().await;
        self.settle(item)
    }

    fn settle(&mut self, item: Option<PipelineItem>) -> PipelineItem {
        match item {
            Some(PipelineItem::Chunk(chunk)) => PipelineItem::Chunk(chunk),
            Some(PipelineItem::EndOfStream) | None => {
                self.exhausted = true;
                self.rx.close();
                PipelineItem::EndOfStream
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::time::Duration;

    fn chunk(i: u32) -> Bytes {
        Bytes::copy_from_slice(&i.to_le_bytes())
    }

    #[tokio::test]
    async fn test_fifo_then_end_of_stream() {
        let (mut producer, mut consumer) = audio_pipeline(8);
        for i in 0..5 {
            producer.push(chunk(i)).await.unwrap();
        }
        producer.push_end_of_stream().await;

        for i in 0..5 {
            assert_eq!(consumer.take_async().await, PipelineItem::Chunk(chunk(i)));
        }
        assert_eq!(consumer.take_async().await, PipelineItem::EndOfStream);
        assert!(consumer.is_exhausted());
        assert_eq!(consumer.take_async().await, PipelineItem::EndOfStream);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_idempotent() {
        let (mut producer, mut consumer) = audio_pipeline(4);
        producer.push(chunk(1)).await.unwrap();
        producer.push_end_of_stream().await;
        producer.push_end_of_stream().await;

        assert!(producer.is_ended());
        assert_eq!(producer.push(chunk(2)).await, Err(PipelineClosed));
        assert_eq!(consumer.take_async().await, PipelineItem::Chunk(chunk(1)));
        assert_eq!(consumer.take_async().await, PipelineItem::EndOfStream);
        assert_eq!(consumer.take_async().await, PipelineItem::EndOfStream);
    }

    #[tokio::test]
    async fn test_dropped_producer_reads_as_end_of_stream() {
        let (producer, mut consumer) = audio_pipeline(4);
        producer.push(chunk(7)).await.unwrap();
        drop(producer);

        assert_eq!(consumer.take_async().await, PipelineItem::Chunk(chunk(7)));
        assert_eq!(consumer.take_async().await, PipelineItem::EndOfStream);
    }

    #[tokio::test]
    async fn test_push_fails_once_consumer_is_gone() {
        let (producer, consumer) = audio_pipeline(4);
        drop(consumer);

        assert_eq!(producer.push(chunk(1)).await, Err(PipelineClosed));
    }

    #[tokio::test]
    async fn test_full_pipeline_applies_backpressure() {
        let (producer, mut consumer) = audio_pipeline(1);
        producer.push(chunk(0)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), producer.push(chunk(1))).await;
        assert!(blocked.is_err(), "push should wait while the pipeline is full");

        assert_eq!(consumer.take_async().await, PipelineItem::Chunk(chunk(0)));
        producer.push(chunk(1)).await.unwrap();
        assert_eq!(consumer.take_async().await, PipelineItem::Chunk(chunk(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fifo_under_random_interleavings() {
        for round in 0..20u64 {
            let capacity = rand::rng().random_range(1..6);
            let count: u32 = rand::rng().random_range(0..200);
            let (mut producer, mut consumer) = audio_pipeline(capacity);

            let reader = tokio::task::spawn_blocking(move || {
                let mut rng = rand::rng();
                let mut seen = Vec::new();
                loop {
                    if rng.random_bool(0.2) {
                        std::thread::sleep(Duration::from_micros(rng.random_range(0..300)));
                    }
                    match consumer.take() {
                        PipelineItem::Chunk(bytes) => {
                            seen.push(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
                        }
                        PipelineItem::EndOfStream => break seen,
                    }
                }
            });

            for i in 0..count {
                let pause = {
                    let mut rng = rand::rng();
                    rng.random_bool(0.2).then(|| rng.random_range(0..300))
                };
                if let Some(micros) = pause {
                    tokio::time::sleep(Duration::from_micros(micros)).await;
                }
                producer.push(chunk(i)).await.unwrap();
            }
            producer.push_end_of_stream().await;

            let seen = reader.await.unwrap();
            assert_eq!(seen, (0..count).collect::<Vec<_>>(), "round {round}");
        }
    }
}
