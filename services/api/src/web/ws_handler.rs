//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a WebSocket connection.
//! Each connection owns one `SessionContext` for its whole lifetime.

use crate::{
    error::reject,
    web::{
        library_task::LibraryFeed,
        protocol::{filter_from, send, ClientMessage, ServerMessage, WsSender, SIGN_IN_NOTICE},
        state::{AppState, AuthenticatedUser},
    },
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use chrono::Utc;
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use verse_study_core::{
    analysis::{self, RecommendOutcome},
    daily::{self, DailyLookup, PublishOutcome, NO_VERSE_TODAY},
    library::{self, RemoveOutcome, SaveOutcome},
    ports::PortError,
    JoinOptions, SessionContext,
};

const NOT_ENOUGH_HISTORY: &str =
    "Save a few verses to your library to get personalised recommendations.";

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user: AuthenticatedUser) {
    let identity = user.identity.clone();
    info!(uid = %identity.uid, "New WebSocket connection established.");

    let provider = Arc::new(user.into_provider(&app_state));
    let ctx = SessionContext::start(app_state.store.clone(), provider);

    // The sender is wrapped in an Arc<Mutex<>> to allow for shared mutable access across tasks.
    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));

    // --- 1. Forward out-of-band write failures ---
    let token = CancellationToken::new();
    let failures_task = {
        let mut failures = ctx.errors().subscribe();
        let ws_sender = ws_sender.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let failure = tokio::select! {
                    _ = token.cancelled() => break,
                    failure = failures.recv() => failure,
                };
                match failure {
                    Ok(failure) => {
                        if send(&ws_sender, &ServerMessage::write_failed(&failure))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Client fell behind on write failures.")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    if send(&ws_sender, &ServerMessage::Ready { identity }).await.is_err() {
        error!("Failed to send ready message.");
    } else {
        // --- 2. Main Message Loop ---
        let mut library: Option<LibraryFeed> = None;
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    handle_text_message(text.as_str(), &app_state, &ctx, &ws_sender, &mut library)
                        .await;
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Client sent close message.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive failed: {}", e);
                    break;
                }
                None => {
                    info!("Client disconnected.");
                    break;
                }
            }
        }
        drop(library);
    }

    // --- 3. Cleanup ---
    ctx.shutdown().await;
    token.cancel();
    if let Err(e) = failures_task.await {
        warn!("Write failure forwarder ended abnormally: {}", e);
    }
    info!("WebSocket connection closed.");
}

/// Turns a failed operation into an `error` message for the client.
fn failure(context: &str, e: PortError) -> ServerMessage {
    let (status, message) = reject(context, e);
    ServerMessage::Error {
        message,
        retryable: status.is_server_error(),
    }
}

/// Helper function to handle the logic for different `ClientMessage` variants.
async fn handle_text_message(
    text: &str,
    app_state: &Arc<AppState>,
    ctx: &SessionContext,
    ws_sender: &WsSender,
    library: &mut Option<LibraryFeed>,
) {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(client_msg) => client_msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            let reply = ServerMessage::Error {
                message: "Unrecognised message.".to_string(),
                retryable: false,
            };
            if let Err(e) = send(ws_sender, &reply).await {
                warn!("Failed to send error message: {}", e);
            }
            return;
        }
    };

    let service = app_state.analysis.as_ref();
    let reply = match client_msg {
        ClientMessage::AnalyzeVerse { text } => {
            match analysis::analyze_verse(service, &text).await {
                Ok(analysis) => Some(ServerMessage::Analysis { text, analysis }),
                Err(e) => Some(failure("Verse analysis", e)),
            }
        }
        ClientMessage::ExplainWord { word } => match analysis::explain_word(service, &word).await {
            Ok(explanation) => Some(ServerMessage::WordExplanation { word, explanation }),
            Err(e) => Some(failure("Word analysis", e)),
        },
        ClientMessage::ScanImage { image_data_uri } => {
            match analysis::scan_verse(service, &image_data_uri).await {
                Ok(verse) => Some(ServerMessage::ScannedVerse { verse }),
                Err(e) => Some(failure("Image scan", e)),
            }
        }
        ClientMessage::SaveVerse { text, analysis } => {
            match library::save_verse(ctx, &text, &analysis).await {
                Ok(SaveOutcome::Saved { verse_id }) => Some(ServerMessage::Saved {
                    verse_id,
                    already_saved: false,
                }),
                Ok(SaveOutcome::AlreadySaved { verse_id }) => Some(ServerMessage::Saved {
                    verse_id,
                    already_saved: true,
                }),
                Ok(SaveOutcome::SignedOut) => Some(ServerMessage::notice(SIGN_IN_NOTICE)),
                Err(e) => Some(failure("Saving the verse", e)),
            }
        }
        ClientMessage::RemoveVerse { verse_id } => match library::remove_verse(ctx, &verse_id) {
            Ok(RemoveOutcome::Removed { verse_id }) => Some(ServerMessage::Removed { verse_id }),
            Ok(RemoveOutcome::SignedOut) => Some(ServerMessage::notice(SIGN_IN_NOTICE)),
            Err(e) => Some(failure("Removing the verse", e)),
        },
        ClientMessage::WatchLibrary {
            limit,
            search,
            date,
        } => {
            let options = JoinOptions {
                limit,
                filter: filter_from(search, date),
            };
            // Replacing the feed drops the previous view first.
            *library = None;
            *library = Some(LibraryFeed::start(ctx, options, ws_sender.clone()));
            None
        }
        ClientMessage::UpdateFilter { search, date } => match library.as_ref() {
            Some(feed) => {
                feed.set_filter(filter_from(search, date));
                None
            }
            None => Some(ServerMessage::notice("The library is not being watched.")),
        },
        ClientMessage::StopLibrary => {
            if library.take().is_some() {
                info!("Library feed stopped.");
            }
            None
        }
        ClientMessage::TodaysVerse => Some(todays_verse_reply(ctx).await),
        ClientMessage::GenerateDailyVerse => {
            let today = Utc::now().date_naive();
            match daily::generate_daily_verse(ctx, service, today).await {
                Ok(PublishOutcome::Published { record_id, .. }) => {
                    info!(%record_id, "Generated a new daily verse.");
                    // Publishing is dispatched; read back once it has landed.
                    ctx.dispatcher().settle().await;
                    Some(todays_verse_reply(ctx).await)
                }
                Ok(PublishOutcome::SignedOut) => Some(ServerMessage::notice(SIGN_IN_NOTICE)),
                Err(e) => Some(failure("Generating the daily verse", e)),
            }
        }
        ClientMessage::Recommend => {
            match analysis::recommend_from_library(ctx, service).await {
                Ok(RecommendOutcome::Recommended(recommendation)) => {
                    Some(ServerMessage::Recommendation { recommendation })
                }
                Ok(RecommendOutcome::NotEnoughData) => {
                    Some(ServerMessage::notice(NOT_ENOUGH_HISTORY))
                }
                Ok(RecommendOutcome::SignedOut) => Some(ServerMessage::notice(SIGN_IN_NOTICE)),
                Err(e) => Some(failure("Recommendation", e)),
            }
        }
        ClientMessage::SignOut => match ctx.sign_out().await {
            Ok(()) => {
                info!("Client signed out.");
                Some(ServerMessage::SignedOut)
            }
            Err(e) => Some(failure("Signing out", e)),
        },
    };

    if let Some(reply) = reply {
        if let Err(e) = send(ws_sender, &reply).await {
            warn!("Failed to send reply: {}", e);
        }
    }
}

async fn todays_verse_reply(ctx: &SessionContext) -> ServerMessage {
    match daily::todays_verse(ctx, Utc::now().date_naive()).await {
        Ok(DailyLookup::Found(record)) => ServerMessage::DailyVerse { record },
        Ok(DailyLookup::NoneToday) => ServerMessage::notice(NO_VERSE_TODAY),
        Ok(DailyLookup::SignedOut) => ServerMessage::notice(SIGN_IN_NOTICE),
        Err(e) => failure("Loading the daily verse", e),
    }
}
