use axum::{
    debug_handler,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    controller_for,
    frames::{ClientCommand, ServerFrame},
};
use crate::{AppState, ScopeHandle, SyncController, Update, model::EntityKind, session::Identity};

#[debug_handler(state = AppState)]
pub async fn room_ws(
    Path(room_id): Path<Uuid>,
    State(state): State<AppState>,
    identity: Identity,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |socket| {
        let user_id = identity.user_id;
        let sync = controller_for(&state, identity);
        info!(%room_id, %user_id, "client connected");
        serve(socket, sync, room_id).await;
        info!(%room_id, %user_id, "client disconnected");
    })
}

/// Task detail the client currently has open.
struct TaskView {
    task_id: Uuid,
    handles: Vec<ScopeHandle>,
}

type Sender = SplitSink<WebSocket, Message>;

async fn serve(socket: WebSocket, mut sync: SyncController, room_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    let room = match sync.open_room(room_id).await {
        Ok(handles) => handles,
        Err(err) => {
            let _ = send(&mut sender, &ServerFrame::error(&err)).await;
            return;
        }
    };
    let mut task: Option<TaskView> = None;

    loop {
        tokio::select! {
            update = sync.recv() => {
                let Some(update) = update else { break };
                let Some(frame) = frame_for(&sync, room_id, task.as_ref(), update) else {
                    continue;
                };
                if send(&mut sender, &frame).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(%room_id, error = %err, "socket error");
                        break;
                    }
                };
                let command = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(command) => command,
                    Err(err) => {
                        let reply = ServerFrame::Error {
                            kind: "bad_command",
                            message: err.to_string(),
                        };
                        if send(&mut sender, &reply).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let reply = match command {
                    ClientCommand::OpenTask { task_id } => {
                        if let Some(previous) = task.take() {
                            sync.close_view(previous.handles);
                        }
                        let handles = sync.open_task(task_id);
                        task = Some(TaskView { task_id, handles });
                        None
                    }
                    ClientCommand::CloseTask => {
                        if let Some(previous) = task.take() {
                            sync.close_view(previous.handles);
                        }
                        None
                    }
                    command => Some(
                        match command.apply(&mut sync, room_id, task.as_ref().map(|view| view.task_id)) {
                            Ok(token) => ServerFrame::Accepted { token },
                            Err(err) => ServerFrame::error(&err),
                        },
                    ),
                };
                if let Some(reply) = reply {
                    if send(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if let Some(view) = task {
        sync.close_view(view.handles);
    }
    sync.close_view(room);
}

fn frame_for(
    sync: &SyncController,
    room_id: Uuid,
    task: Option<&TaskView>,
    update: Update,
) -> Option<ServerFrame> {
    match update {
        Update::Opened(scope) | Update::Reconnected(scope) | Update::Changed(scope) => {
            if EntityKind::TASK_SCOPED.contains(&scope.kind) {
                let view = task.filter(|view| view.task_id == scope.id)?;
                Some(ServerFrame::Task(sync.project_task(view.task_id)))
            } else {
                sync.project_room(room_id).map(ServerFrame::Room)
            }
        }
        Update::ActionConfirmed { token } => Some(ServerFrame::Confirmed { token }),
        Update::ActionFailed { token, error } => Some(ServerFrame::Failed {
            token,
            kind: error.kind(),
            message: error.to_string(),
        }),
        Update::ScopeFailed { scope, error } => Some(ServerFrame::ScopeFailed {
            scope: scope.to_string(),
            message: error.to_string(),
        }),
        Update::AuthExpired => Some(ServerFrame::AuthExpired),
    }
}

async fn send(sender: &mut Sender, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            debug!(error = %err, "unserializable frame");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
