use std::sync::Arc;

use ms_infra::versions::VersionProvider;

use crate::hub::EventHub;
use crate::queue::RequestIntake;

#[derive(Clone)]
pub struct AppState {
    pub hub: EventHub,
    pub versions: Arc<dyn VersionProvider>,
    pub intake: Arc<dyn RequestIntake>,
}
