//! The persistent-connection endpoint. One actor per socket; frames pushed
//! by the engine arrive over an unbounded channel bridged into the actor.

use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::presence::SessionId;
use crate::routes::caller_id;
use crate::state::AppState;
use crate::websocket::events::PushFrame;

/// Client-to-server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsInbound {
    /// Explicit liveness signal; protocol pong counts too.
    Heartbeat,
    Typing { conversation_id: Uuid },
    MarkRead { conversation_id: Uuid, up_to_seq: i64 },
}

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct TextMessage(String);

struct WsSession {
    user_id: Uuid,
    session_id: SessionId,
    state: web::Data<AppState>,
    hb: Instant,
    /// Taken by `started` to bridge pushed frames into the actor.
    rx: Option<UnboundedReceiver<PushFrame>>,
    came_online: bool,
}

impl WsSession {
    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let ping_interval = Duration::from_secs(self.state.config.presence.ping_interval_secs);
        let ttl = Duration::from_secs(self.state.config.presence.session_ttl_secs);
        ctx.run_interval(ping_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > ttl {
                tracing::warn!(user_id = %act.user_id, "websocket heartbeat timed out");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn refresh_presence(&mut self) {
        self.hb = Instant::now();
        let state = self.state.clone();
        let user_id = self.user_id;
        let session_id = self.session_id;
        actix::spawn(async move {
            if state.presence.heartbeat(user_id, session_id).await.is_err() {
                tracing::debug!(%user_id, "heartbeat on expired session ignored");
            }
        });
    }

    fn handle_inbound(&mut self, inbound: WsInbound) {
        match inbound {
            WsInbound::Heartbeat => self.refresh_presence(),
            WsInbound::Typing { conversation_id } => {
                let state = self.state.clone();
                let user_id = self.user_id;
                actix::spawn(async move {
                    if let Err(e) = state.service.typing(user_id, conversation_id).await {
                        tracing::debug!(error = %e, %user_id, "typing event rejected");
                    }
                });
            }
            WsInbound::MarkRead {
                conversation_id,
                up_to_seq,
            } => {
                let state = self.state.clone();
                let user_id = self.user_id;
                actix::spawn(async move {
                    if let Err(e) = state.service.mark_read(user_id, conversation_id, up_to_seq).await
                    {
                        tracing::debug!(error = %e, %user_id, "mark_read rejected");
                    }
                });
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, session_id = %self.session_id,
            "websocket session started");
        self.hb(ctx);

        // bridge pushed frames into the actor
        if let Some(mut rx) = self.rx.take() {
            let addr = ctx.address();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    match serde_json::to_string(&frame) {
                        Ok(text) => addr.do_send(TextMessage(text)),
                        Err(e) => tracing::error!(error = %e, "push frame serialization failed"),
                    }
                }
            });
        }

        let state = self.state.clone();
        let user_id = self.user_id;
        let came_online = self.came_online;
        actix::spawn(async move {
            // reconnect cancels pending offline notifications
            state.dispatcher.on_reconnect(user_id).await;
            if came_online {
                if let Err(e) = state.service.broadcast_presence(user_id, true).await {
                    tracing::error!(error = %e, %user_id, "presence broadcast failed");
                }
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, session_id = %self.session_id,
            "websocket session stopped");
        let state = self.state.clone();
        let user_id = self.user_id;
        let session_id = self.session_id;
        actix::spawn(async move {
            if state.presence.disconnect(user_id, session_id).await {
                if let Err(e) = state.service.broadcast_presence(user_id, false).await {
                    tracing::error!(error = %e, %user_id, "presence broadcast failed");
                }
            }
        });
    }
}

impl Handler<TextMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: TextMessage, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.refresh_presence();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.refresh_presence();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WsInbound>(&text) {
                Ok(inbound) => self.handle_inbound(inbound),
                Err(e) => tracing::warn!(error = %e, "unparseable websocket frame"),
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary websocket frames not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(?reason, "websocket close received");
                ctx.stop();
            }
            _ => {}
        }
    }
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let user_id = caller_id(&req)?;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let outcome = state.presence.connect(user_id, tx).await;

    let session = WsSession {
        user_id,
        session_id: outcome.session_id,
        state: state.clone(),
        hb: Instant::now(),
        rx: Some(rx),
        came_online: outcome.came_online,
    };

    ws::start(session, &req, stream)
}
