mod channel;
mod tcp;

pub use channel::{ChannelPublisher, ChannelSource};
pub use tcp::TcpLineSource;

use std::sync::Arc;
use std::time::Duration;

use scanstate_api::{MessageSource, SourceError};
use scanstate_source_pubsub::{PubSubConfig, PubSubSource};

use crate::config::{SourceConfig, SourceKind};

/// Connect the source selected by `config.kind`.
pub async fn open_source(config: &SourceConfig) -> Result<Arc<dyn MessageSource>, SourceError> {
    let source: Arc<dyn MessageSource> = match config.kind {
        SourceKind::Pubsub => {
            let mut pubsub = PubSubConfig::new(&config.project_id, &config.subscription_id);
            pubsub.max_messages = config.max_messages;
            pubsub.endpoint = config.endpoint.clone();
            pubsub.access_token = config.access_token.clone();
            pubsub.poll_interval = Duration::from_millis(config.poll_interval_ms);
            Arc::new(PubSubSource::connect(pubsub).await?)
        }
        SourceKind::Tcp => Arc::new(TcpLineSource::bind(&config.listen).await?),
    };
    tracing::info!(source = %config.kind, name = %source.name(), "message source opened");
    Ok(source)
}
