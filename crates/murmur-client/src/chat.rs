//! The chat view's synchronization loop.
//!
//! A [`ChatSession`] owns the feed subscription and runs one task that,
//! for every batch: reconciles the message window, asks the directory to
//! follow newly seen authors, lets the scroll anchor decide against the
//! last reported viewport, and publishes [`ChatEvent`]s to the UI.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use murmur_shared::constants::CREATED_AT_FIELD;
use murmur_shared::{Message, MessageId, OutgoingMessage};

use crate::config::ClientConfig;
use crate::directory::UserDirectory;
use crate::drafts::DraftTray;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, ChatEvent, MessagesPayload, ProfilesPayload};
use crate::gallery::MediaGallery;
use crate::presence::{HeartbeatGuard, LifecycleEvent, PresenceState, PresenceTracker, Transition};
use crate::profile::{update_own_profile, ProfileUpdate};
use crate::reconciler::MessageReconciler;
use crate::scroll::{ScrollAnchor, ScrollDecision, Viewport};
use crate::session::{Backends, SessionContext};
use crate::subscriptions::{Subscription, SubscriptionKey, SubscriptionManager};
use crate::upload::{MediaUploadPipeline, SendReport};

/// State mutated by the feed loop and by viewport reports.
struct ViewState {
    reconciler: MessageReconciler,
    anchor: ScrollAnchor,
    viewport: Viewport,
}

type SharedView = Arc<Mutex<ViewState>>;

fn lock(view: &SharedView) -> MutexGuard<'_, ViewState> {
    view.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ChatSession {
    session: SessionContext,
    config: ClientConfig,
    backends: Backends,
    subscriptions: SubscriptionManager,
    directory: UserDirectory,
    presence: PresenceTracker,
    uploads: MediaUploadPipeline,
    view: SharedView,
    events: mpsc::UnboundedSender<ChatEvent>,
    feed_task: JoinHandle<()>,
    /// Present while the local presence is online.
    heartbeat: Mutex<Option<HeartbeatGuard>>,
}

impl ChatSession {
    /// Subscribe to the feed and start the synchronization loop.
    pub async fn open(
        session: SessionContext,
        backends: Backends,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChatEvent>)> {
        let subscriptions = SubscriptionManager::new(&backends, &config);
        let directory = UserDirectory::new(subscriptions.clone(), config.profile_defaults.clone());
        let presence =
            PresenceTracker::new(session.clone(), &backends, subscriptions.clone(), &config);
        let uploads = MediaUploadPipeline::new(&session, &backends, &config);

        let view = Arc::new(Mutex::new(ViewState {
            reconciler: MessageReconciler::new(config.feed_window),
            anchor: ScrollAnchor::new(config.pin_threshold_px),
            viewport: Viewport::default(),
        }));

        let feed = subscriptions.subscribe(SubscriptionKey::Feed).await?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let feed_task = tokio::spawn(run_feed(
            feed,
            view.clone(),
            directory.clone(),
            events.clone(),
        ));

        info!(user = %session.user, session = %session.session_id, "Chat session opened");

        Ok((
            Self {
                session,
                config,
                backends,
                subscriptions,
                directory,
                presence,
                uploads,
                view,
                events,
                feed_task,
                heartbeat: Mutex::new(None),
            },
            events_rx,
        ))
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Append a text message. Whitespace-only text is refused.
    pub async fn send_text(&self, text: &str) -> Result<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let message = OutgoingMessage::text(self.session.user.clone(), text);
        let id = self
            .backends
            .feed
            .add(
                &self.config.messages_collection,
                message.to_fields(),
                Some(CREATED_AT_FIELD),
            )
            .await?;
        debug!(id = %id, "Text message sent");
        Ok(MessageId::new(id))
    }

    /// Send every unsent draft in `tray`. Sent drafts leave the tray;
    /// failed ones stay, marked, for editing and resubmission.
    pub async fn send_media(&self, tray: &mut DraftTray) -> Result<SendReport> {
        let report = self.uploads.send(tray.drafts_mut()).await?;
        tray.clear_sent();
        Ok(report)
    }

    /// Record the scroll container geometry after a user scroll.
    pub fn report_viewport(&self, viewport: Viewport) {
        let cleared = {
            let mut view = lock(&self.view);
            view.viewport = viewport;
            view.anchor.on_scroll(&viewport)
        };
        if cleared {
            emit_event(&self.events, ChatEvent::NewContentBelow { visible: false });
        }
    }

    /// The "new content below" affordance was clicked.
    pub fn jump_to_latest(&self) -> ScrollDecision {
        let decision = lock(&self.view).anchor.jump_to_latest();
        emit_event(&self.events, ChatEvent::NewContentBelow { visible: false });
        emit_event(&self.events, ChatEvent::Scroll(decision));
        decision
    }

    pub fn new_content_below(&self) -> bool {
        lock(&self.view).anchor.new_content_below()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.view).reconciler.messages().to_vec()
    }

    pub fn gallery(&self) -> MediaGallery {
        MediaGallery::from_messages(lock(&self.view).reconciler.messages())
    }

    /// Apply a lifecycle event. The presence heartbeat runs exactly while
    /// the local presence is online.
    pub async fn lifecycle(&self, event: LifecycleEvent) -> Transition {
        let transition = self.presence.handle(event).await;
        let mut heartbeat = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if transition.to == PresenceState::Online {
            if heartbeat.is_none() {
                debug!(user = %self.session.user, "Presence heartbeat started");
                *heartbeat = Some(self.presence.spawn_heartbeat());
            }
        } else if heartbeat.take().is_some() {
            debug!(user = %self.session.user, "Presence heartbeat stopped");
        }
        transition
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Merge a display name and/or avatar into the local user's profile.
    /// The change reaches the directory through its live subscription.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<()> {
        update_own_profile(
            self.backends.documents.as_ref(),
            &self.config.users_collection,
            &self.session,
            update,
        )
        .await
    }

    /// Go offline (best-effort) and release every subscription.
    pub async fn close(self) -> Transition {
        let stopped = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(stopped);
        let transition = self.presence.handle(LifecycleEvent::Teardown).await;
        info!(user = %self.session.user, "Chat session closed");
        transition
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.feed_task.abort();
        self.subscriptions.shutdown();
    }
}

async fn run_feed(
    mut feed: Subscription,
    view: SharedView,
    directory: UserDirectory,
    events: mpsc::UnboundedSender<ChatEvent>,
) {
    while let Some(batch) = feed.next().await {
        let (reconciled, decision) = {
            let mut view = lock(&view);
            let reconciled = view.reconciler.apply(&batch, &directory);
            let decision = if reconciled.changed {
                let before = view.viewport;
                Some(view.anchor.decide(&before))
            } else {
                None
            };
            (reconciled, decision)
        };

        if !reconciled.new_authors.is_empty() {
            directory.ensure_subscribed(&reconciled.new_authors);
            emit_event(
                &events,
                ChatEvent::ProfilesRequested(ProfilesPayload {
                    users: reconciled.new_authors,
                }),
            );
        }

        if let Some(decision) = decision {
            emit_event(
                &events,
                ChatEvent::MessagesUpdated(MessagesPayload {
                    messages: reconciled.messages,
                    rejected: batch.rejected,
                }),
            );
            if decision.should_auto_scroll {
                emit_event(&events, ChatEvent::Scroll(decision));
            } else if decision.show_new_content {
                emit_event(&events, ChatEvent::NewContentBelow { visible: true });
            }
        }
    }

    emit_event(
        &events,
        ChatEvent::FeedClosed {
            reason: "feed subscription ended".to_string(),
        },
    );
}
