mod frames;
mod ws;

use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    routing::get,
};
use uuid::Uuid;

use crate::{
    AppResult, AppState, SyncController, SyncError,
    projections::RoomProjection,
    session::{Identity, StaticAuth},
};

pub use frames::{ClientCommand, ServerFrame};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{room_id}", get(room))
        .route("/{room_id}/ws", get(ws::room_ws))
}

/// Controller acting for the user behind one request or socket.
pub(crate) fn controller_for(state: &AppState, identity: Identity) -> SyncController {
    SyncController::new(
        state.gateway.clone(),
        Arc::new(StaticAuth::signed_in(identity)),
        state.sync.clone(),
    )
}

/// One-shot snapshot of a room.
#[debug_handler(state = AppState)]
async fn room(
    Path(room_id): Path<Uuid>,
    State(state): State<AppState>,
    identity: Identity,
) -> AppResult<Json<RoomProjection>> {
    let mut sync = controller_for(&state, identity);
    let handles = sync.open_room(room_id).await?;
    sync.settle().await;

    let projection = sync.project_room(room_id);
    sync.close_view(handles);
    Ok(Json(projection.ok_or_else(|| SyncError::NotFound(format!("room {room_id}")))?))
}
