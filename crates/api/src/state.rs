use std::sync::Arc;

use parley_domain::conversations::ConversationIndex;
use parley_domain::messages::MessageService;
use parley_domain::ports::directory::UserDirectory;
use parley_domain::ports::messages::MessageRepository;
use parley_domain::presence::PresenceTracker;
use parley_infra::config::AppConfig;
use parley_infra::db::DbConfig;
use parley_infra::directory::InMemoryUserDirectory;
use parley_infra::repositories::{InMemoryMessageRepository, SurrealMessageRepository};

use crate::realtime::RealtimeGateway;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub messages: MessageService,
    pub conversations: Arc<ConversationIndex>,
    pub presence: Arc<PresenceTracker>,
    pub realtime: Arc<RealtimeGateway>,
    pub directory: Arc<dyn UserDirectory>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let repository: Arc<dyn MessageRepository> = match config.data_backend.as_str() {
            "surreal" => {
                let db_config = DbConfig::from_app_config(&config);
                Arc::new(SurrealMessageRepository::new(&db_config).await?)
            }
            _ => Arc::new(InMemoryMessageRepository::new()),
        };
        let directory: Arc<dyn UserDirectory> = Arc::new(InMemoryUserDirectory::new());
        Ok(Self::with_components(config, repository, directory))
    }

    pub fn with_components(
        config: AppConfig,
        repository: Arc<dyn MessageRepository>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        let messages = MessageService::new(repository.clone());
        let conversations = Arc::new(ConversationIndex::new(repository, directory.clone()));
        let presence = Arc::new(PresenceTracker::new());
        let realtime = Arc::new(RealtimeGateway::new(
            messages.clone(),
            conversations.clone(),
            presence.clone(),
        ));
        Self {
            config,
            messages,
            conversations,
            presence,
            realtime,
            directory,
        }
    }
}
