//! Challenged-node side of validation.
//!
//! On a challenge the node opens a stream to the validator and sends sampled
//! blocks for the requested duration. The sample sequence comes from the
//! round seed, so a referee holding the same archive derives the same CIDs.

use crate::stream::BlockSender;
use anyhow::{Context, Result};
use carstore::IndexedArchiveCache;
use common::{MAX_VALIDATION_BLOCKS, NodeId, ValidationChallenge, parse_cid};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a response stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Streamed for the full duration or up to the block cap
    Completed { blocks: u64 },
    /// Stopped early by cancellation
    Cancelled { blocks: u64 },
}

pub struct Responder {
    node_id: NodeId,
    cache: Arc<IndexedArchiveCache>,
    max_blocks: u64,
}

impl Responder {
    pub fn new(node_id: NodeId, cache: Arc<IndexedArchiveCache>) -> Self {
        Self {
            node_id,
            cache,
            max_blocks: MAX_VALIDATION_BLOCKS as u64,
        }
    }

    /// Stop a stream after `max` blocks even if time remains.
    pub fn with_max_blocks(mut self, max: usize) -> Self {
        self.max_blocks = max as u64;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Connect to the challenge's validator and stream.
    pub async fn respond(
        &self,
        challenge: &ValidationChallenge,
        cancel: CancellationToken,
    ) -> Result<ResponseOutcome> {
        let sender = BlockSender::connect(&challenge.validator_addr, &self.node_id, &challenge.round_id)
            .await
            .with_context(|| format!("connect to validator {}", challenge.validator_addr))?;
        self.stream_to(sender, challenge, cancel).await
    }

    /// Stream over an already-connected sender.
    pub async fn stream_to<T>(
        &self,
        mut sender: BlockSender<T>,
        challenge: &ValidationChallenge,
        cancel: CancellationToken,
    ) -> Result<ResponseOutcome>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let root = match challenge.archive_cid.as_deref().map(parse_cid).transpose() {
            Ok(root) => root,
            Err(e) => {
                sender.cancel().await?;
                return Err(e.into());
            }
        };
        let mut check = match self.cache.random_check(root.as_ref(), challenge.seed) {
            Ok(check) => check,
            Err(e) => {
                warn!(round = %challenge.round_id, error = %e, "Cannot sample for challenge");
                sender.cancel().await?;
                return Err(e.into());
            }
        };

        info!(
            round = %challenge.round_id,
            archive = %check.archive_name(),
            duration_secs = challenge.duration_secs,
            "Responding to validation challenge"
        );

        let deadline = Instant::now() + Duration::from_secs(challenge.duration_secs);
        let mut blocks = 0u64;
        while blocks < self.max_blocks && Instant::now() < deadline {
            let Some(next) = check.next() else { break };
            let data = match next {
                Ok((_, data)) => data,
                Err(e) => {
                    warn!(archive = %check.archive_name(), error = %e, "Block read failed");
                    sender.cancel().await?;
                    return Err(e.into());
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(round = %challenge.round_id, blocks, "Validation stream cancelled");
                    sender.cancel().await?;
                    return Ok(ResponseOutcome::Cancelled { blocks });
                }
                sent = sender.send_block(&data) => sent?,
            }
            blocks += 1;
        }

        sender.finish().await?;
        debug!(round = %challenge.round_id, blocks, "Validation stream complete");
        Ok(ResponseOutcome::Completed { blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_waiter::{BlockWaiter, WaiterConfig};
    use crate::stream::{codec, read_hello};
    use carstore::ArchiveDir;
    use tokio_util::codec::Framed;

    fn cache_with_archive(dir: &std::path::Path) -> (Arc<IndexedArchiveCache>, cid::Cid) {
        let store = ArchiveDir::open(dir).unwrap();
        let summary = store
            .write_archive((0..50).map(|i| format!("content {i}").into_bytes()))
            .unwrap();
        (Arc::new(IndexedArchiveCache::new(store, 8, 16)), summary.root)
    }

    fn challenge(root: Option<String>, duration_secs: u64) -> ValidationChallenge {
        ValidationChallenge {
            round_id: "r1".to_string(),
            archive_cid: root,
            seed: 99,
            duration_secs,
            validator_addr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_streamed_blocks_match_referee() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, root) = cache_with_archive(dir.path());
        let responder = Responder::new("e_1".to_string(), cache.clone());

        let (client, server) = tokio::io::duplex(1024 * 1024);
        let waiter = tokio::spawn(async move {
            let mut framed = Framed::new(server, codec());
            let (node, round) = read_hello(&mut framed).await.unwrap();
            BlockWaiter::new(node, round, WaiterConfig::new(Duration::from_secs(1)))
                .wait(framed)
                .await
        });

        let sender = BlockSender::start(client, "e_1", "r1").await.unwrap();
        let challenge = challenge(Some(root.to_string()), 1);
        let outcome = responder
            .stream_to(sender, &challenge, CancellationToken::new())
            .await
            .unwrap();
        let report = waiter.await.unwrap();

        let ResponseOutcome::Completed { blocks } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(report.cids.len() as u64, blocks);
        assert!(blocks > 0);

        let expected: Vec<String> = cache
            .blocks_of_asset(&root, 99, report.cids.len())
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(report.cids, expected);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, root) = cache_with_archive(dir.path());
        let responder = Responder::new("e_1".to_string(), cache);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let sender = BlockSender::start(client, "e_1", "r1").await.unwrap();
        let outcome = responder
            .stream_to(sender, &challenge(Some(root.to_string()), 5), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ResponseOutcome::Cancelled { blocks: 0 });

        let mut framed = Framed::new(server, codec());
        read_hello(&mut framed).await.unwrap();
        let report = BlockWaiter::new("e_1".into(), "r1".into(), WaiterConfig::new(Duration::ZERO))
            .wait(framed)
            .await;
        assert!(report.is_cancel);
    }

    #[tokio::test]
    async fn test_unknown_archive_sends_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with_archive(dir.path());
        let responder = Responder::new("e_1".to_string(), cache);
        let missing = common::cid_of_block(b"not held").unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let sender = BlockSender::start(client, "e_1", "r1").await.unwrap();
        assert!(
            responder
                .stream_to(sender, &challenge(Some(missing.to_string()), 1), CancellationToken::new())
                .await
                .is_err()
        );

        let mut framed = Framed::new(server, codec());
        read_hello(&mut framed).await.unwrap();
        let report = BlockWaiter::new("e_1".into(), "r1".into(), WaiterConfig::new(Duration::ZERO))
            .wait(framed)
            .await;
        assert!(report.is_cancel);
        assert!(report.cids.is_empty());
    }

    #[tokio::test]
    async fn test_stream_stops_at_block_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, root) = cache_with_archive(dir.path());
        let responder = Responder::new("e_1".to_string(), cache.clone()).with_max_blocks(7);

        let (client, server) = tokio::io::duplex(1024 * 1024);
        let waiter = tokio::spawn(async move {
            let mut framed = Framed::new(server, codec());
            let (node, round) = read_hello(&mut framed).await.unwrap();
            BlockWaiter::new(node, round, WaiterConfig::new(Duration::from_secs(30)))
                .wait(framed)
                .await
        });

        // Finishes at the cap long before the requested duration
        let started = std::time::Instant::now();
        let sender = BlockSender::start(client, "e_1", "r1").await.unwrap();
        let outcome = responder
            .stream_to(sender, &challenge(Some(root.to_string()), 30), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ResponseOutcome::Completed { blocks: 7 });
        assert!(started.elapsed() < Duration::from_secs(10));

        let report = waiter.await.unwrap();
        let expected: Vec<String> = cache
            .blocks_of_asset(&root, 99, 7)
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(report.cids, expected);
    }
}
