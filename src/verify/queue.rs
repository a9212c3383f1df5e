use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, info_span, trace, Instrument};

use super::{Verdict, Verifier};

struct VerifyRequest {
    id: u64,
    jpeg: Vec<u8>,
    confidence: f32,
}

#[derive(Debug, PartialEq, Clone)]
pub struct VerifyResult {
    pub id: u64,
    pub verdict: Verdict,
    pub elapsed: Duration,
}

/// Bounded hand-off to a single verification worker.
///
/// Submissions never wait: when the queue is full the request is dropped.
pub struct VerificationQueue {
    tx: mpsc::Sender<VerifyRequest>,
    next_id: u64,
    dropped: u64,
}

impl VerificationQueue {
    pub fn spawn(
        verifier: Arc<dyn Verifier>,
        depth: usize,
    ) -> (VerificationQueue, mpsc::UnboundedReceiver<VerifyResult>) {
        let (tx, mut rx) = mpsc::channel::<VerifyRequest>(depth.max(1));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let span = info_span!("Verifier", name=%verifier.name());
        tokio::spawn(
            async move {
                let mut completed = 0u32;
                let mut total = Duration::ZERO;
                while let Some(req) = rx.recv().await {
                    let started = Instant::now();
                    let verdict = verifier.verify(&req.jpeg, req.confidence).await;
                    let elapsed = started.elapsed();
                    completed += 1;
                    total += elapsed;
                    debug!(
                        id = req.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        avg_ms = (total / completed).as_millis() as u64,
                        "Verification finished"
                    );
                    let result = VerifyResult {
                        id: req.id,
                        verdict,
                        elapsed,
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
                trace!("Verification worker stopped");
            }
            .instrument(span),
        );
        (
            VerificationQueue {
                tx,
                next_id: 1,
                dropped: 0,
            },
            result_rx,
        )
    }

    /// Returns the request id, or `None` if the request was dropped
    pub fn try_submit(&mut self, jpeg: Vec<u8>, confidence: f32) -> Option<u64> {
        let id = self.next_id;
        match self.tx.try_send(VerifyRequest {
            id,
            jpeg,
            confidence,
        }) {
            Ok(()) => {
                self.next_id += 1;
                Some(id)
            }
            Err(_) => {
                self.dropped += 1;
                debug!(dropped = self.dropped, "Verification queue full, request dropped");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::VerificationQueue;
    use crate::verify::{Verdict, Verifier};

    /// Scores by detector confidence. Blocks on the gate so the queue can be filled.
    struct FakeVerifier {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Verifier for FakeVerifier {
        fn name(&self) -> &str {
            "fake"
        }
        async fn verify(&self, jpeg: &[u8], detector_confidence: f32) -> Verdict {
            let _permit = self.gate.acquire().await.unwrap();
            if jpeg.is_empty() {
                return Verdict::Failed {
                    reason: "empty".into(),
                };
            }
            Verdict::Verified {
                score: detector_confidence,
                reason: "fake".into(),
            }
        }
    }

    #[tokio::test]
    async fn test_results_in_order() {
        let gate = Arc::new(Semaphore::new(10));
        let (mut queue, mut results) = VerificationQueue::spawn(Arc::new(FakeVerifier { gate }), 2);
        assert_eq!(queue.try_submit(vec![1], 0.7), Some(1));
        assert_eq!(queue.try_submit(vec![], 0.9), Some(2));

        let first = results.recv().await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.verdict.score(), Some(0.7));
        let second = results.recv().await.unwrap();
        assert_eq!(second.id, 2);
        assert!(matches!(second.verdict, Verdict::Failed { .. }));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let gate = Arc::new(Semaphore::new(0));
        let (mut queue, mut results) =
            VerificationQueue::spawn(Arc::new(FakeVerifier { gate: gate.clone() }), 2);

        assert_eq!(queue.try_submit(vec![1], 0.5), Some(1));
        // Let the worker take the first request and block on it
        tokio::task::yield_now().await;
        while queue.tx.capacity() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.try_submit(vec![1], 0.5), Some(2));
        assert_eq!(queue.try_submit(vec![1], 0.5), Some(3));
        assert_eq!(queue.try_submit(vec![1], 0.5), None);
        assert_eq!(queue.dropped, 1);

        gate.add_permits(3);
        let ids: Vec<u64> = vec![
            results.recv().await.unwrap().id,
            results.recv().await.unwrap().id,
            results.recv().await.unwrap().id,
        ];
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
