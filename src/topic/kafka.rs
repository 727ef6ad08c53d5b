//! Kafka access through librdkafka

use super::{LogError, LogRecord, StartFrom, TopicConsumer, TopicProducer};
use chrono::Utc;
use log::{debug, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

impl From<KafkaError> for LogError {
    fn from(e: KafkaError) -> Self {
        LogError::Transport(e.to_string())
    }
}

/// Reads all partitions of the given topics, without a consumer group
/// taking part in offset management.
pub struct KafkaConsumer {
    consumer: BaseConsumer,
}

impl KafkaConsumer {
    pub fn new(servers: &str, topics: &[(&str, StartFrom)]) -> Result<KafkaConsumer, LogError> {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", servers);
        // Every server instance reads everything
        config.set(
            "group.id",
            format!(
                "alarm-server-{}-{}",
                std::process::id(),
                Utc::now().timestamp_millis()
            ),
        );
        config.set("enable.auto.commit", "false");
        let consumer: BaseConsumer = config.create()?;

        let mut assignment = TopicPartitionList::new();
        for (topic, start) in topics {
            let offset = match start {
                StartFrom::Beginning => Offset::Beginning,
                StartFrom::End => Offset::End,
            };
            let metadata = consumer.fetch_metadata(Some(*topic), METADATA_TIMEOUT)?;
            for t in metadata.topics() {
                for partition in t.partitions() {
                    assignment.add_partition_offset(topic, partition.id(), offset)?;
                }
            }
        }
        debug!("Assigned {} partitions", assignment.count());
        consumer.assign(&assignment)?;
        Ok(KafkaConsumer { consumer })
    }
}

impl TopicConsumer for KafkaConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, LogError> {
        let mut records = Vec::new();
        let mut wait = timeout;
        while let Some(result) = self.consumer.poll(wait) {
            let msg = result?;
            let value = match msg.payload_view::<str>() {
                None => None,
                Some(Ok(text)) => Some(text.to_string()),
                Some(Err(e)) => {
                    warn!("Ignoring record that is not UTF-8: {}", e);
                    continue;
                }
            };
            let key = msg
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default();
            records.push(LogRecord {
                topic: msg.topic().to_string(),
                key,
                value,
            });
            // Drain what is already there, but only wait once
            wait = Duration::ZERO;
        }
        Ok(records)
    }

    fn probe(&mut self, timeout: Duration) -> Result<(), LogError> {
        self.consumer.fetch_metadata(None, timeout)?;
        Ok(())
    }
}

pub struct KafkaProducer {
    producer: ThreadedProducer<DefaultProducerContext>,
}

impl KafkaProducer {
    pub fn new(servers: &str) -> Result<KafkaProducer, LogError> {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", servers);
        let producer: ThreadedProducer<DefaultProducerContext> = config.create()?;
        Ok(KafkaProducer { producer })
    }
}

impl TopicProducer for KafkaProducer {
    fn send(&self, record: LogRecord) -> Result<(), LogError> {
        let base = BaseRecord::<str, str>::to(&record.topic).key(record.key.as_str());
        let base = match &record.value {
            Some(value) => base.payload(value.as_str()),
            None => base,
        };
        self.producer.send(base).map_err(|(e, _)| LogError::from(e))
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush(Duration::from_secs(5)) {
            warn!("Failed to flush pending records: {}", e);
        }
    }
}
