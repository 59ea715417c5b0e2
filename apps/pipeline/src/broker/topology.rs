use tracing::debug;

use super::{BrokerError, Channel};
use crate::config::Config;
use crate::monitoring::types::RegionTarget;

/// Queues a link declares every time it (re)connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSet {
    /// Every known job queue, bound to the topic exchange (scheduler)
    AllRequests,
    /// A single region's job queue (worker)
    Requests(RegionTarget),
    /// The outcome queue (worker publisher, collector)
    Responses,
}

/// Queue naming and the region catalogue the topology is built from
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchange: String,
    pub request_queue_base: String,
    pub response_queue: String,
    pub prefetch_count: u16,
    pub targets: Vec<RegionTarget>,
}

impl Topology {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exchange: config.broker.exchange.clone(),
            request_queue_base: config.broker.request_queue_base.clone(),
            response_queue: config.broker.response_queue.clone(),
            prefetch_count: config.broker.prefetch_count,
            targets: config.enabled_targets(),
        }
    }

    /// `<base>.<region>.<subregion>`
    pub fn request_queue(&self, target: &RegionTarget) -> String {
        format!("{}.{}.{}", self.request_queue_base, target.region, target.subregion)
    }

    /// Declare the queues of `set` on a freshly opened channel
    pub async fn declare(&self, channel: &dyn Channel, set: &QueueSet) -> Result<(), BrokerError> {
        match set {
            QueueSet::Responses => {
                channel.declare_queue(&self.response_queue).await?;
                debug!(queue = %self.response_queue, "Declared response queue");
            }
            QueueSet::AllRequests | QueueSet::Requests(_) => {
                let mut declared = 0usize;
                for target in &self.targets {
                    if let QueueSet::Requests(only) = set {
                        if only != target {
                            continue;
                        }
                    }
                    let queue = self.request_queue(target);
                    let key = target.routing_key();
                    channel.declare_queue(&queue).await?;
                    channel.bind_queue(&queue, &self.exchange, &key).await?;
                    debug!(queue = %queue, binding = %key, "Declared job queue");
                    declared += 1;
                }
                if declared == 0 {
                    let wanted = match set {
                        QueueSet::Requests(target) => target.to_string(),
                        _ => "any region".to_string(),
                    };
                    return Err(BrokerError::NoQueueDeclared(wanted));
                }
            }
        }
        Ok(())
    }
}
