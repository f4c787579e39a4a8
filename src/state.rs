use std::sync::Arc;

use crate::config::Config;
use crate::presence::PresenceRegistry;
use crate::services::conversation_service::ConversationService;
use crate::services::notification_dispatcher::NotificationDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<ConversationService>,
    pub presence: PresenceRegistry,
    pub dispatcher: NotificationDispatcher,
}
