use crate::app::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod call;
pub mod webhook;
pub mod ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/call", post(call::initiate_call))
        .route("/call/{id}", get(call::get_call))
        .route("/call/{id}/end", post(call::end_call))
        .route("/call/{id}/whisper", post(call::whisper))
        .route("/call/{id}/barge", post(call::barge))
        .route("/call/{id}/transfer", post(call::transfer))
        .route("/call/{id}/control", post(call::control))
        .route("/call/{id}/disposition", post(call::set_disposition))
        .route("/call/{id}/transcript", get(call::get_transcript))
        .route("/call/{id}/listen", get(call::get_listen_url))
        .route("/calls/active", get(call::active_calls))
        .route("/webhook", post(webhook::handle_webhook))
        .route("/ws", get(ws::ws_handler))
}
