//! Producer side of a shuffle: partition, number, encode and deliver.

use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quarry_common::metrics::global_metrics;
use quarry_common::{QuarryError, Result};
use quarry_execution::Partitioner;
use quarry_planner::PartitioningSpec;
use tracing::{debug, warn};

use crate::ExchangeConfig;
use crate::frame::{ExchangeFrame, FrameHeader, FrameKind};
use crate::hub::FrameTransport;
use crate::partition::PartitionMap;

/// Frames delivered by one [`ExchangeSender`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    /// Data frames per destination partition.
    pub batches_per_partition: Vec<u64>,
    pub bytes_sent: u64,
}

/// Routes one producer task's output to the workers owning each partition.
///
/// Sequence numbers count data frames per destination partition starting at
/// zero. Every frame carries the producer's `attempt`; receivers drop resent
/// frames of one attempt by `seq` and discard an older attempt's frames once
/// a newer attempt shows up.
pub struct ExchangeSender {
    transport: Arc<dyn FrameTransport>,
    map: Arc<PartitionMap>,
    partitioner: Partitioner,
    schema: SchemaRef,
    producer_task: u64,
    attempt: u32,
    next_seq: Vec<u64>,
    bytes_sent: u64,
    config: ExchangeConfig,
}

impl ExchangeSender {
    pub fn try_new(
        transport: Arc<dyn FrameTransport>,
        map: Arc<PartitionMap>,
        spec: &PartitioningSpec,
        schema: SchemaRef,
        producer_task: u64,
        attempt: u32,
        config: ExchangeConfig,
    ) -> Result<Self> {
        let partitioner = Partitioner::try_new(spec, &schema)?;
        if partitioner.partition_count() != map.partition_count() {
            return Err(QuarryError::Planning(format!(
                "partitioning yields {} partitions but the map has {}",
                partitioner.partition_count(),
                map.partition_count()
            )));
        }
        Ok(Self {
            next_seq: vec![0; map.partition_count()],
            transport,
            map,
            partitioner,
            schema,
            producer_task,
            attempt,
            bytes_sent: 0,
            config,
        })
    }

    fn header(&self, partition: usize, seq: u64) -> FrameHeader {
        FrameHeader {
            query_id: self.map.query_id(),
            stage_id: self.map.stage_id(),
            partition,
            producer_task: self.producer_task,
            attempt: self.attempt,
            seq,
            kind: FrameKind::Data,
        }
    }

    /// Split `batch` by partition and deliver each piece in ascending
    /// partition order.
    pub async fn send_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        for (partition, piece) in self.partitioner.partition_batch(batch)? {
            let seq = self.next_seq[partition];
            let frame = ExchangeFrame::data(self.header(partition, seq), &piece)?;
            self.deliver(partition, &frame).await?;
            self.next_seq[partition] += 1;
        }
        Ok(())
    }

    /// Send `End` to every partition, including ones that got no data.
    pub async fn finish(mut self) -> Result<SendSummary> {
        for partition in 0..self.next_seq.len() {
            let total = self.next_seq[partition];
            let frame = ExchangeFrame::end(self.header(partition, total), total, &self.schema)?;
            self.deliver(partition, &frame).await?;
        }
        debug!(
            query_id = %self.map.query_id(),
            stage_id = self.map.stage_id(),
            producer_task = self.producer_task,
            attempt = self.attempt,
            bytes = self.bytes_sent,
            "exchange producer finished"
        );
        Ok(SendSummary {
            batches_per_partition: self.next_seq,
            bytes_sent: self.bytes_sent,
        })
    }

    async fn deliver(&mut self, partition: usize, frame: &ExchangeFrame) -> Result<()> {
        let dest = self.map.worker_for(partition)?.clone();
        let bytes = frame.encode()?;
        let len = bytes.len() as u64;
        let max_attempts = self.config.max_send_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.deliver(&dest, bytes.clone()).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.retry_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                    warn!(
                        worker_id = %dest,
                        partition,
                        seq = frame.header.seq,
                        attempt,
                        backoff_ms = backoff,
                        error = %e,
                        "exchange send failed; retrying"
                    );
                    global_metrics().inc_exchange_send_retries(dest.as_str());
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(QuarryError::WorkerUnreachable(format!(
                        "{dest} after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        self.bytes_sent += len;
        global_metrics().record_exchange_send(
            &self.map.query_id().to_string(),
            self.map.stage_id(),
            len,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ExchangeHub;
    use arrow::array::{ArrayRef, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use async_trait::async_trait;
    use quarry_common::{QueryId, WorkerId};
    use std::sync::Mutex;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]))
    }

    fn batch(values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(schema(), vec![Arc::new(Int64Array::from(values)) as ArrayRef]).unwrap()
    }

    fn hash_spec(partitions: usize) -> PartitioningSpec {
        PartitioningSpec::HashKeys {
            keys: vec!["k".to_string()],
            partitions,
        }
    }

    /// Fails the first `failures` deliveries, then records frames.
    struct FlakyTransport {
        failures: Mutex<usize>,
        delivered: Mutex<Vec<ExchangeFrame>>,
    }

    #[async_trait]
    impl FrameTransport for FlakyTransport {
        async fn deliver(&self, dest: &WorkerId, bytes: Vec<u8>) -> Result<()> {
            {
                let mut left = self.failures.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(QuarryError::WorkerUnreachable(dest.to_string()));
                }
            }
            self.delivered.lock().unwrap().push(ExchangeFrame::decode(&bytes)?);
            Ok(())
        }
    }

    fn flaky(failures: usize) -> Arc<FlakyTransport> {
        Arc::new(FlakyTransport {
            failures: Mutex::new(failures),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn config() -> ExchangeConfig {
        ExchangeConfig {
            max_send_attempts: 3,
            retry_backoff_ms: 1,
            ..ExchangeConfig::default()
        }
    }

    fn map(partitions: usize) -> Arc<PartitionMap> {
        Arc::new(
            PartitionMap::assign(
                QueryId(9),
                1,
                &hash_spec(partitions),
                &[WorkerId::new("w1"), WorkerId::new("w2")],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn sequence_numbers_are_per_partition_and_end_carries_totals() {
        let transport = flaky(0);
        let mut sender = ExchangeSender::try_new(
            transport.clone(),
            map(1),
            &hash_spec(1),
            schema(),
            4,
            1,
            config(),
        )
        .unwrap();
        sender.send_batch(&batch(vec![1, 2])).await.unwrap();
        sender.send_batch(&batch(vec![3])).await.unwrap();
        let summary = sender.finish().await.unwrap();
        assert_eq!(summary.batches_per_partition, vec![2]);

        let frames = transport.delivered.lock().unwrap();
        let seqs: Vec<(u64, FrameKind)> = frames.iter().map(|f| (f.header.seq, f.header.kind)).collect();
        assert_eq!(
            seqs,
            vec![
                (0, FrameKind::Data),
                (1, FrameKind::Data),
                (2, FrameKind::End { batches: 2 })
            ]
        );
        assert!(frames
            .iter()
            .all(|f| f.header.producer_task == 4 && f.header.attempt == 1));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = flaky(2);
        let mut sender =
            ExchangeSender::try_new(transport.clone(), map(1), &hash_spec(1), schema(), 0, 1, config())
                .unwrap();
        sender.send_batch(&batch(vec![1])).await.unwrap();
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_worker_unreachable() {
        let transport = flaky(10);
        let mut sender =
            ExchangeSender::try_new(transport, map(1), &hash_spec(1), schema(), 0, 1, config()).unwrap();
        let err = sender.send_batch(&batch(vec![1])).await.unwrap_err();
        assert!(matches!(err, QuarryError::WorkerUnreachable(msg) if msg.contains("3 attempts")));
    }

    #[tokio::test]
    async fn every_partition_receives_end_even_without_data() {
        let hub = ExchangeHub::new();
        let mut w1 = hub.register_worker(WorkerId::new("w1"), 8).unwrap();
        let mut w2 = hub.register_worker(WorkerId::new("w2"), 8).unwrap();
        let sender =
            ExchangeSender::try_new(hub.clone(), map(2), &hash_spec(2), schema(), 0, 1, config()).unwrap();
        sender.finish().await.unwrap();
        let f1 = w1.recv().await.unwrap().unwrap();
        let f2 = w2.recv().await.unwrap().unwrap();
        assert_eq!(f1.header.kind, FrameKind::End { batches: 0 });
        assert_eq!((f1.header.partition, f2.header.partition), (0, 1));
    }

    #[test]
    fn mismatched_partition_counts_are_rejected() {
        let err = ExchangeSender::try_new(flaky(0), map(2), &hash_spec(3), schema(), 0, 1, config())
            .err()
            .unwrap();
        assert!(matches!(err, QuarryError::Planning(_)));
    }
}
