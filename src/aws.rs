//! SQS, Firehose and S3 backends for the collaborator traits.

use crate::config::AwsConfig;
use crate::job::{QueueMessage, Receipt};
use crate::ledger::LedgerStorage;
use crate::queue::{
    DeliveryOutcome, DeliveryStreamLike, EntryFailure, OutboundMessage, QueueConsumerLike, QueueLenLike,
    QueueProducerLike,
};
use crate::HarvestError;
use async_trait::async_trait;
use aws_config::{Region, SdkConfig};
use aws_sdk_firehose::primitives::Blob;
use aws_sdk_firehose::types::Record;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, MessageAttributeValue, QueueAttributeName, SendMessageBatchRequestEntry,
};

const THROTTLE_CODE: &str = "ServiceUnavailableException";
const THROTTLE_MESSAGE: &str = "Slow down.";

#[allow(deprecated)]
pub async fn load_sdk_config(config: &AwsConfig) -> SdkConfig {
    aws_config::from_env().region(Region::new(config.region.clone())).load().await
}

#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    wait_secs: i32,
}

impl SqsQueue {
    pub fn new(sdk: &SdkConfig, queue_url: &str) -> Result<Self, HarvestError> {
        AwsConfig::require(queue_url, "queue url")?;
        Ok(Self {
            client: aws_sdk_sqs::Client::new(sdk),
            queue_url: queue_url.to_string(),
            wait_secs: 1,
        })
    }

    /// Long-poll wait for `receive`, in seconds (0 to 20).
    pub fn with_wait(mut self, wait_secs: i32) -> Self {
        self.wait_secs = wait_secs.clamp(0, 20);
        self
    }
}

#[async_trait]
impl QueueLenLike for SqsQueue {
    async fn depth(&self) -> Result<u64, HarvestError> {
        let response = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .send()
            .await
            .map_err(|e| HarvestError::Queue(format!("SQS attributes: {}", DisplayErrorContext(&e))))?;

        let attributes = response.attributes();
        let read = |name: QueueAttributeName| -> u64 {
            attributes
                .and_then(|map| map.get(&name))
                .and_then(|value| value.parse().ok())
                .unwrap_or(0)
        };
        Ok(read(QueueAttributeName::ApproximateNumberOfMessages)
            + read(QueueAttributeName::ApproximateNumberOfMessagesDelayed))
    }
}

#[async_trait]
impl QueueProducerLike for SqsQueue {
    async fn send_batch(&self, entries: Vec<OutboundMessage>) -> Result<Vec<EntryFailure>, HarvestError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.send_message_batch().queue_url(&self.queue_url);
        for entry in entries {
            let mut builder = SendMessageBatchRequestEntry::builder()
                .id(entry.id)
                .message_body(entry.body)
                .delay_seconds(entry.delay_secs as i32);
            for (name, value) in entry.attributes {
                // Empty string attributes are rejected by SQS.
                if value.is_empty() {
                    continue;
                }
                let attribute = MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(value)
                    .build()
                    .map_err(|e| HarvestError::Queue(format!("SQS attribute {}: {}", name, e)))?;
                builder = builder.message_attributes(name, attribute);
            }
            let built = builder
                .build()
                .map_err(|e| HarvestError::Queue(format!("SQS entry: {}", e)))?;
            request = request.entries(built);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HarvestError::Queue(format!("SQS send: {}", DisplayErrorContext(&e))))?;

        Ok(response
            .failed()
            .iter()
            .map(|f| EntryFailure {
                id: f.id().to_string(),
                code: f.code().to_string(),
                message: f.message().unwrap_or_default().to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl QueueConsumerLike for SqsQueue {
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, HarvestError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, 10) as i32)
            .message_attribute_names("All")
            .wait_time_seconds(self.wait_secs)
            .send()
            .await
            .map_err(|e| HarvestError::Queue(format!("SQS receive: {}", DisplayErrorContext(&e))))?;

        Ok(response
            .messages()
            .iter()
            .map(|m| {
                let mut message = QueueMessage::new(
                    m.message_id().unwrap_or_default(),
                    m.receipt_handle().unwrap_or_default(),
                    m.body().unwrap_or_default(),
                );
                if let Some(attributes) = m.message_attributes() {
                    for (name, value) in attributes {
                        if let Some(text) = value.string_value() {
                            message = message.with_attribute(name, text);
                        }
                    }
                }
                message
            })
            .collect())
    }

    async fn delete_batch(&self, receipts: &[Receipt]) -> Result<Vec<EntryFailure>, HarvestError> {
        if receipts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.delete_message_batch().queue_url(&self.queue_url);
        for (index, receipt) in receipts.iter().enumerate() {
            let entry = DeleteMessageBatchRequestEntry::builder()
                .id(index.to_string())
                .receipt_handle(&receipt.receipt_token)
                .build()
                .map_err(|e| HarvestError::Queue(format!("SQS delete entry: {}", e)))?;
            request = request.entries(entry);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HarvestError::Queue(format!("SQS delete: {}", DisplayErrorContext(&e))))?;

        Ok(response
            .failed()
            .iter()
            .map(|f| EntryFailure {
                id: f
                    .id()
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| receipts.get(i))
                    .map(|r| r.message_id.clone())
                    .unwrap_or_else(|| f.id().to_string()),
                code: f.code().to_string(),
                message: f.message().unwrap_or_default().to_string(),
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct FirehoseStream {
    client: aws_sdk_firehose::Client,
    stream_name: String,
}

impl FirehoseStream {
    pub fn new(sdk: &SdkConfig, stream_name: &str) -> Result<Self, HarvestError> {
        AwsConfig::require(stream_name, "delivery stream")?;
        Ok(Self {
            client: aws_sdk_firehose::Client::new(sdk),
            stream_name: stream_name.to_string(),
        })
    }
}

#[async_trait]
impl DeliveryStreamLike for FirehoseStream {
    async fn put_batch(&self, records: &[String]) -> Result<Vec<DeliveryOutcome>, HarvestError> {
        let mut request = self.client.put_record_batch().delivery_stream_name(&self.stream_name);
        for record in records {
            let built = Record::builder()
                .data(Blob::new(record.as_bytes().to_vec()))
                .build()
                .map_err(|e| HarvestError::Stream(format!("Firehose record: {}", e)))?;
            request = request.records(built);
        }

        let response = request.send().await.map_err(|e| {
            HarvestError::Stream(format!("Firehose put: {}", aws_sdk_firehose::error::DisplayErrorContext(&e)))
        })?;

        Ok(response
            .request_responses()
            .iter()
            .map(|entry| match (entry.error_code(), entry.error_message()) {
                (None, None) => DeliveryOutcome::Delivered,
                (Some(THROTTLE_CODE), Some(THROTTLE_MESSAGE)) => DeliveryOutcome::Throttled,
                (code, message) => DeliveryOutcome::Failed {
                    code: code.unwrap_or_default().to_string(),
                    message: message.unwrap_or_default().to_string(),
                },
            })
            .collect())
    }
}

/// Ledger kept as one object in a bucket.
#[derive(Clone)]
pub struct S3LedgerStorage {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
}

impl S3LedgerStorage {
    pub fn new(sdk: &SdkConfig, config: &AwsConfig, name: &str) -> Result<Self, HarvestError> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| HarvestError::Config("HARVEST_S3_BUCKET is not set".to_string()))?;

        let mut builder = aws_sdk_s3::config::Builder::from(sdk);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
            key: prefixed(&config.prefix, name),
        })
    }
}

impl S3LedgerStorage {
    /// Storage for ledger `name` with bucket and prefix from the environment.
    pub async fn from_env(name: &str) -> Result<Self, HarvestError> {
        let config = AwsConfig::from_env()?;
        let sdk = load_sdk_config(&config).await;
        Self::new(&sdk, &config, name)
    }
}

#[async_trait]
impl LedgerStorage for S3LedgerStorage {
    async fn read(&self) -> Result<String, HarvestError> {
        let response = match self.client.get_object().bucket(&self.bucket).key(&self.key).send().await {
            Ok(response) => response,
            Err(e) => {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    return Ok(String::new());
                }
                return Err(HarvestError::Storage(format!("S3 get {}: {}", self.key, service)));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| HarvestError::Storage(format!("S3 read {}: {}", self.key, e)))?
            .to_vec();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn write(&self, contents: &str) -> Result<(), HarvestError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(contents.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|e| {
                HarvestError::Storage(format!("S3 put {}: {}", self.key, aws_sdk_s3::error::DisplayErrorContext(&e)))
            })?;
        Ok(())
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    let clean = key.trim_start_matches('/');
    if prefix.is_empty() {
        clean.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(bucket: Option<&str>) -> AwsConfig {
        AwsConfig {
            region: "eu-central-1".to_string(),
            job_queue_url: String::new(),
            fetch_queue_url: String::new(),
            delivery_stream: String::new(),
            bucket: bucket.map(str::to_string),
            prefix: "harvest".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
        }
    }

    fn sdk_config() -> SdkConfig {
        SdkConfig::builder()
            .region(Region::new("eu-central-1"))
            .behavior_version(aws_config::BehaviorVersion::latest())
            .build()
    }

    #[test]
    fn test_s3_ledger_key_is_prefixed() {
        let storage = S3LedgerStorage::new(&sdk_config(), &settings(Some("crawl")), ".sites").unwrap();
        assert_eq!(storage.bucket, "crawl");
        assert_eq!(storage.key, "harvest/.sites");
    }

    #[test]
    fn test_s3_ledger_requires_bucket() {
        let storage = S3LedgerStorage::new(&sdk_config(), &settings(None), ".pages");
        assert!(matches!(storage, Err(HarvestError::Config(_))));
    }

    #[test]
    fn test_prefixed_keys() {
        assert_eq!(prefixed("harvest", "ledger/.sites"), "harvest/ledger/.sites");
        assert_eq!(prefixed("harvest/", "/x"), "harvest/x");
        assert_eq!(prefixed("", "x"), "x");
    }
}
