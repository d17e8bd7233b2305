use std::sync::Arc;
use std::time::Duration;

use exchange_core::{
    apply_command, Command, ExchangeError, ExchangeEvent, ExchangeState, Identity,
    IdentityEvent, ItemId, NewWishlistItem, Participant, RosterEntry, WishlistPatch,
};
use futures::{Stream, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::store::{StateStore, StoreError};

pub type SharedCoordinator = Arc<Mutex<Coordinator>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeUpdate {
    pub roster: Vec<RosterEntry>,
    pub drawing_complete: bool,
    pub events: Vec<ExchangeEvent>,
}

pub struct Coordinator {
    state: Arc<ExchangeState>,
    store: Arc<dyn StateStore>,
    rng: ChaCha8Rng,
    max_draw_attempts: usize,
    save_timeout: Duration,
    updates: broadcast::Sender<ExchangeUpdate>,
}

impl Coordinator {
    pub async fn load(store: Arc<dyn StateStore>, settings: &Settings) -> Self {
        let state = store.load().await;
        info!(
            participants = state.participants.len(),
            drawing_complete = state.drawing_complete,
            "exchange state loaded"
        );
        let rng = settings
            .draw_seed
            .map(ChaCha8Rng::seed_from_u64)
            .unwrap_or_else(ChaCha8Rng::from_entropy);
        let (updates, _) = broadcast::channel(32);

        Self {
            state: Arc::new(state),
            store,
            rng,
            max_draw_attempts: settings.max_draw_attempts,
            save_timeout: settings.save_timeout,
            updates,
        }
    }

    pub fn into_shared(self) -> SharedCoordinator {
        Arc::new(Mutex::new(self))
    }

    pub fn snapshot(&self) -> Arc<ExchangeState> {
        Arc::clone(&self.state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeUpdate> {
        self.updates.subscribe()
    }

    pub fn active_participant(&self) -> Option<Participant> {
        self.state.active_participant().cloned()
    }

    pub fn drawn_target(&self) -> Option<Participant> {
        self.state.drawn_target().cloned()
    }

    pub fn participant(&self, id: &str) -> Option<Participant> {
        self.state.participant(id).cloned()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.state.roster()
    }

    pub async fn sync_identity(
        &mut self,
        identity: Identity,
    ) -> Result<Arc<ExchangeState>, ExchangeError> {
        self.execute(Command::SyncIdentity(identity)).await
    }

    pub async fn clear_identity(&mut self) -> Arc<ExchangeState> {
        self.execute_infallible(Command::ClearIdentity).await
    }

    pub async fn handle_identity_event(
        &mut self,
        event: IdentityEvent,
    ) -> Result<Arc<ExchangeState>, ExchangeError> {
        self.execute(event.into()).await
    }

    pub async fn add_wishlist_item(
        &mut self,
        item: NewWishlistItem,
    ) -> Result<Arc<ExchangeState>, ExchangeError> {
        self.execute(Command::AddWishlistItem(item)).await
    }

    pub async fn remove_wishlist_item(
        &mut self,
        item_id: ItemId,
    ) -> Result<Arc<ExchangeState>, ExchangeError> {
        self.execute(Command::RemoveWishlistItem { item_id }).await
    }

    pub async fn update_wishlist_item(
        &mut self,
        item_id: ItemId,
        patch: WishlistPatch,
    ) -> Result<Arc<ExchangeState>, ExchangeError> {
        self.execute(Command::UpdateWishlistItem { item_id, patch })
            .await
    }

    pub async fn perform_draw(&mut self) -> Result<Arc<ExchangeState>, ExchangeError> {
        self.execute(Command::PerformDraw).await
    }

    pub async fn reset_draw(&mut self) -> Arc<ExchangeState> {
        self.execute_infallible(Command::ResetDraw).await
    }

    async fn execute(&mut self, command: Command) -> Result<Arc<ExchangeState>, ExchangeError> {
        debug!(?command, "applying command");
        let mut next = ExchangeState::clone(&self.state);
        let events = match apply_command(&mut next, command, &mut self.rng, self.max_draw_attempts)
        {
            Ok(events) => events,
            Err(err) => {
                info!(error = %err, kind = ?err.kind(), "command rejected");
                return Err(err);
            }
        };

        self.state = Arc::new(next);
        self.persist().await;

        let update = ExchangeUpdate {
            roster: self.state.roster(),
            drawing_complete: self.state.drawing_complete,
            events,
        };
        info!(events = ?update.events, "command applied");
        // No subscribers is fine.
        let _ = self.updates.send(update);

        Ok(self.snapshot())
    }

    async fn execute_infallible(&mut self, command: Command) -> Arc<ExchangeState> {
        match self.execute(command).await {
            Ok(state) => state,
            Err(_) => self.snapshot(),
        }
    }

    async fn persist(&self) {
        let result = match tokio::time::timeout(self.save_timeout, self.store.save(&self.state)).await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.save_timeout)),
        };
        if let Err(err) = result {
            warn!(error = %err, "persist error");
        }
    }
}

// Aborting the returned task unsubscribes.
pub fn spawn_identity_listener<S>(coordinator: SharedCoordinator, events: S) -> JoinHandle<()>
where
    S: Stream<Item = IdentityEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            if let Err(err) = coordinator.lock().await.handle_identity_event(event).await {
                warn!(error = %err, "identity event ignored");
            }
        }
        debug!("identity stream closed");
    })
}
