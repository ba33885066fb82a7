//! WebSocket front door.
//!
//! One connection is one session: envelopes from the socket go to the
//! session's command channel, session events are serialised back out. When
//! either direction ends the session is released through the controller.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use warp::{
	ws::{Message, WebSocket, Ws},
	Filter,
};

use crate::{
	rpc::ChainRpcApi,
	session::{protocol::ClientEnvelope, Controller, SessionHandle},
};

pub async fn run<C: ChainRpcApi + 'static>(
	listen: SocketAddr,
	controller: Arc<Controller<C>>,
) -> anyhow::Result<()> {
	let controller_filter = warp::any().map(move || controller.clone());
	let routes = warp::path("ws")
		.and(warp::ws())
		.and(controller_filter)
		.map(|ws: Ws, controller: Arc<Controller<C>>| {
			ws.on_upgrade(move |socket| handle_connection(socket, controller))
		})
		.or(warp::path("health").map(warp::reply));

	let (bound, server) = warp::serve(routes)
		.try_bind_ephemeral(listen)
		.with_context(|| format!("could not bind listener to {listen}"))?;
	info!("listening on {bound}");
	server.await;
	Ok(())
}

async fn handle_connection<C: ChainRpcApi + 'static>(
	socket: WebSocket,
	controller: Arc<Controller<C>>,
) {
	let session = match controller.open_session().await {
		Ok(session) => session,
		Err(e) => {
			warn!("refusing connection, could not open session: {e}");
			let _ = socket.close().await;
			return
		},
	};
	let SessionHandle { id, commands, mut events } = session;
	info!(session = %id, "client connected");

	let (mut sink, mut stream) = socket.split();

	let forward_events = async {
		while let Some(envelope) = events.recv().await {
			let text = serde_json::to_string(&envelope).expect("envelopes serialise");
			if sink.send(Message::text(text)).await.is_err() {
				break
			}
		}
	};

	let forward_commands = async {
		while let Some(result) = stream.next().await {
			let message = match result {
				Ok(message) => message,
				Err(e) => {
					debug!(session = %id, "websocket error: {e}");
					break
				},
			};
			if message.is_close() {
				break
			}
			let Ok(text) = message.to_str() else { continue };
			match serde_json::from_str::<ClientEnvelope>(text) {
				Ok(envelope) =>
					if commands.send(envelope).await.is_err() {
						break
					},
				Err(e) => debug!(session = %id, "discarding malformed envelope: {e}"),
			}
		}
	};

	tokio::select! {
		_ = forward_events => {},
		_ = forward_commands => {},
	}

	controller.close_session(&id).await;
	info!(session = %id, "client disconnected");
}
