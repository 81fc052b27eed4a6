//! Minimal HTTP surface: health probe and a room snapshot.

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::room::Room;

pub async fn serve(addr: SocketAddr, room: Arc<Room>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http api listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let room = room.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req| {
                let room = room.clone();
                async move { Ok::<_, Infallible>(route(req, &room)) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                debug!("http connection error: {e}");
            }
        });
    }
}

fn route(req: Request<Incoming>, room: &Room) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            json!({ "status": "ok", "clients": room.client_count() }),
        ),
        (&Method::GET, "/api/state") => json_response(
            StatusCode::OK,
            json!({
                "clients": room.client_count(),
                "server_name": room.server_name(),
                "owner_id": room.owner_id(),
                "users": room.user_list_snapshot(),
                "channels": room.channels(),
            }),
        ),
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}
