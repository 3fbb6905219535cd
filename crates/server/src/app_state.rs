use server_api::ApiContext;

use crate::relay::Relay;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) relay: Relay,
    pub(crate) max_frame_bytes: usize,
}
