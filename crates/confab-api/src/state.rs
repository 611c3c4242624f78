use std::sync::Arc;

use confab_db::Database;
use confab_gateway::dispatcher::Dispatcher;
use confab_gateway::presence::PresenceRegistry;
use confab_storage::BlobStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub store: Arc<BlobStore>,
    pub dispatcher: Dispatcher,
    pub presence: PresenceRegistry,
    pub jwt_secret: String,
}
