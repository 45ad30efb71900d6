use crate::access::AccessController;
use crate::api::ApiClient;
use crate::config::Config;

/// Application state handed to command dispatch: the raw API client for
/// session-free operations (auth, catalog, history) and the controller for
/// everything access- or quota-gated.
pub struct AppState {
    pub config: Config,
    pub api: ApiClient,
    pub controller: AccessController,
}
