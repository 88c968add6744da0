//! services/api/src/web/library_task.rs
//!
//! Streams a connection's live library view to the client.

use crate::web::protocol::{send, ServerMessage, WsSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use verse_study_core::{JoinOptions, JoinedView, LibraryFilter, SessionContext};

/// A running library feed. Dropping it stops the feed and closes the view.
pub struct LibraryFeed {
    view: JoinedView,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl LibraryFeed {
    pub fn start(ctx: &SessionContext, options: JoinOptions, ws_sender: WsSender) -> Self {
        let view = JoinedView::open(ctx, options);
        let token = CancellationToken::new();
        let task = tokio::spawn(library_process(view.watch(), ws_sender, token.clone()));
        info!("Library feed started.");
        Self { view, token, task }
    }

    pub fn set_filter(&self, filter: LibraryFilter) {
        self.view.set_filter(filter);
    }
}

impl Drop for LibraryFeed {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// Sends every settled state of the view. Loading states are skipped, the
/// client keeps showing the previous rendering until the join completes.
async fn library_process(
    mut states: tokio::sync::watch::Receiver<verse_study_core::JoinedState>,
    ws_sender: WsSender,
    token: CancellationToken,
) {
    loop {
        let message = {
            let state = states.borrow_and_update();
            (!state.is_loading).then(|| ServerMessage::library(&state))
        };
        if let Some(message) = message {
            if send(&ws_sender, &message).await.is_err() {
                debug!("Client went away; stopping library feed.");
                return;
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
