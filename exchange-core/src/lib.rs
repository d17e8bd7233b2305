mod draw;

pub use draw::{derangement, Assignment, AssignmentError, DEFAULT_MAX_ATTEMPTS};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub type ParticipantId = String;
pub type ItemId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WishlistItem {
    pub id: ItemId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub wishlist: Vec<WishlistItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawn_id: Option<ParticipantId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeState {
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub active_participant_id: Option<ParticipantId>,
    #[serde(default)]
    pub drawing_complete: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DrawPhase {
    NotDrawn,
    Drawn,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: ParticipantId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub photo_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum IdentityEvent {
    LoggedIn(Identity),
    LoggedOut,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewWishlistItem {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

// None leaves a field alone; a blank description or link clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WishlistPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SyncIdentity(Identity),
    ClearIdentity,
    AddWishlistItem(NewWishlistItem),
    RemoveWishlistItem { item_id: ItemId },
    UpdateWishlistItem { item_id: ItemId, patch: WishlistPatch },
    PerformDraw,
    ResetDraw,
}

impl From<IdentityEvent> for Command {
    fn from(event: IdentityEvent) -> Self {
        match event {
            IdentityEvent::LoggedIn(identity) => Command::SyncIdentity(identity),
            IdentityEvent::LoggedOut => Command::ClearIdentity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ExchangeEvent {
    ParticipantJoined { participant_id: ParticipantId },
    ParticipantUpdated { participant_id: ParticipantId },
    SessionStarted { participant_id: ParticipantId },
    SessionEnded { participant_id: Option<ParticipantId> },
    WishlistItemAdded { participant_id: ParticipantId, item_id: ItemId },
    WishlistItemRemoved { participant_id: ParticipantId, item_id: ItemId },
    WishlistItemUpdated { participant_id: ParticipantId, item_id: ItemId },
    DrawCompleted { participants: usize },
    DrawReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Validation,
    Precondition,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("identity has no id")]
    EmptyIdentity,
    #[error("no active participant")]
    NoActiveParticipant,
    #[error("name must not be empty")]
    EmptyName,
    #[error("wishlist item not found")]
    ItemNotFound,
    #[error("need at least 2 participants to draw, have {count}")]
    NotEnoughParticipants { count: usize },
    #[error("drawing already complete")]
    AlreadyDrawn,
    #[error("assignment failed: {0}")]
    Assignment(#[from] AssignmentError),
}

impl ExchangeError {
    pub fn kind(&self) -> RejectionKind {
        match self {
            ExchangeError::EmptyIdentity
            | ExchangeError::NoActiveParticipant
            | ExchangeError::EmptyName
            | ExchangeError::ItemNotFound => RejectionKind::Validation,
            ExchangeError::NotEnoughParticipants { .. }
            | ExchangeError::AlreadyDrawn
            | ExchangeError::Assignment(_) => RejectionKind::Precondition,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("participant {0} registered more than once")]
    DuplicateParticipant(ParticipantId),
    #[error("active participant {0} is not registered")]
    DanglingActiveParticipant(ParticipantId),
    #[error("participant {0} holds an assignment but no drawing is complete")]
    AssignedWhileNotDrawn(ParticipantId),
    #[error("participant {0} is assigned to themselves")]
    SelfAssignment(ParticipantId),
    #[error("participant {participant} is assigned to unknown {target}")]
    DanglingAssignment {
        participant: ParticipantId,
        target: ParticipantId,
    },
    #[error("participant {0} was drawn by more than one giver")]
    SharedTarget(ParticipantId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub id: ParticipantId,
    pub name: String,
    pub photo_ref: Option<String>,
    pub wishlist_len: usize,
    pub has_drawn: bool,
    pub is_active: bool,
}

impl ExchangeState {
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn active_participant(&self) -> Option<&Participant> {
        self.active_participant_id
            .as_deref()
            .and_then(|id| self.participant(id))
    }

    pub fn drawn_target(&self) -> Option<&Participant> {
        self.active_participant()
            .and_then(|p| p.drawn_id.as_deref())
            .and_then(|id| self.participant(id))
    }

    pub fn phase(&self) -> DrawPhase {
        if self.drawing_complete {
            DrawPhase::Drawn
        } else {
            DrawPhase::NotDrawn
        }
    }

    pub fn can_draw(&self) -> bool {
        !self.drawing_complete && self.participants.len() >= 2
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.participants
            .iter()
            .map(|p| RosterEntry {
                id: p.id.clone(),
                name: p.name.clone(),
                photo_ref: p.photo_ref.clone(),
                wishlist_len: p.wishlist.len(),
                has_drawn: p.drawn_id.is_some(),
                is_active: self.active_participant_id.as_deref() == Some(p.id.as_str()),
            })
            .collect()
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut ids = HashSet::with_capacity(self.participants.len());
        for p in &self.participants {
            if !ids.insert(p.id.as_str()) {
                return Err(InvariantViolation::DuplicateParticipant(p.id.clone()));
            }
        }

        if let Some(active) = &self.active_participant_id {
            if !ids.contains(active.as_str()) {
                return Err(InvariantViolation::DanglingActiveParticipant(active.clone()));
            }
        }

        let mut targets = HashSet::new();
        for p in &self.participants {
            let Some(target) = &p.drawn_id else { continue };
            if !self.drawing_complete {
                return Err(InvariantViolation::AssignedWhileNotDrawn(p.id.clone()));
            }
            if target == &p.id {
                return Err(InvariantViolation::SelfAssignment(p.id.clone()));
            }
            if !ids.contains(target.as_str()) {
                return Err(InvariantViolation::DanglingAssignment {
                    participant: p.id.clone(),
                    target: target.clone(),
                });
            }
            if !targets.insert(target.as_str()) {
                return Err(InvariantViolation::SharedTarget(target.clone()));
            }
        }

        Ok(())
    }

    // A damaged drawing is reset as a whole.
    pub fn sanitize(&mut self) -> bool {
        let before = self.clone();

        let mut seen = HashSet::new();
        self.participants.retain(|p| seen.insert(p.id.clone()));

        if let Some(active) = &self.active_participant_id {
            if !seen.contains(active) {
                self.active_participant_id = None;
            }
        }

        let mut targets = HashSet::new();
        let mut broken = false;
        for p in self.participants.iter_mut() {
            let Some(target) = &p.drawn_id else { continue };
            let valid = self.drawing_complete
                && target != &p.id
                && seen.contains(target)
                && targets.insert(target.clone());
            if !valid {
                p.drawn_id = None;
                broken = true;
            }
        }

        // A partial assignment leaves someone without a giver; start over.
        if self.drawing_complete && (broken || targets.is_empty()) {
            reset_draw(self);
        }

        *self != before
    }
}

pub fn apply_command<R: Rng + ?Sized>(
    state: &mut ExchangeState,
    command: Command,
    rng: &mut R,
    max_draw_attempts: usize,
) -> Result<Vec<ExchangeEvent>, ExchangeError> {
    match command {
        Command::SyncIdentity(identity) => sync_identity(state, identity),
        Command::ClearIdentity => Ok(clear_identity(state)),
        Command::AddWishlistItem(item) => add_wishlist_item(state, item),
        Command::RemoveWishlistItem { item_id } => remove_wishlist_item(state, &item_id),
        Command::UpdateWishlistItem { item_id, patch } => {
            update_wishlist_item(state, &item_id, patch)
        }
        Command::PerformDraw => perform_draw(state, rng, max_draw_attempts),
        Command::ResetDraw => Ok(reset_draw(state)),
    }
}

// Blank profile fields never overwrite stored ones. A late joiner has no
// assignment until the next reset and draw.
pub fn sync_identity(
    state: &mut ExchangeState,
    identity: Identity,
) -> Result<Vec<ExchangeEvent>, ExchangeError> {
    if identity.id.trim().is_empty() {
        return Err(ExchangeError::EmptyIdentity);
    }

    let display_name = non_blank(identity.display_name);
    let email = non_blank(identity.email);
    let photo_ref = non_blank(identity.photo_ref);
    let participant_id = identity.id;

    let mut events = Vec::new();
    match state
        .participants
        .iter_mut()
        .find(|p| p.id == participant_id)
    {
        Some(existing) => {
            let mut changed = false;
            if let Some(name) = display_name {
                changed |= replace(&mut existing.name, name);
            }
            if let Some(email) = email {
                changed |= replace(&mut existing.email, email);
            }
            if photo_ref.is_some() && existing.photo_ref != photo_ref {
                existing.photo_ref = photo_ref;
                changed = true;
            }
            if changed {
                events.push(ExchangeEvent::ParticipantUpdated {
                    participant_id: participant_id.clone(),
                });
            }
        }
        None => {
            let name = display_name
                .or_else(|| email.as_deref().and_then(email_local_part))
                .unwrap_or_else(|| "User".to_string());
            state.participants.push(Participant {
                id: participant_id.clone(),
                name,
                email: email.unwrap_or_default(),
                photo_ref,
                wishlist: Vec::new(),
                drawn_id: None,
            });
            events.push(ExchangeEvent::ParticipantJoined {
                participant_id: participant_id.clone(),
            });
        }
    }

    state.active_participant_id = Some(participant_id.clone());
    events.push(ExchangeEvent::SessionStarted { participant_id });
    Ok(events)
}

pub fn clear_identity(state: &mut ExchangeState) -> Vec<ExchangeEvent> {
    let participant_id = state.active_participant_id.take();
    vec![ExchangeEvent::SessionEnded { participant_id }]
}

pub fn add_wishlist_item(
    state: &mut ExchangeState,
    item: NewWishlistItem,
) -> Result<Vec<ExchangeEvent>, ExchangeError> {
    let participant = active_participant_mut(state)?;
    let name = non_blank(Some(item.name)).ok_or(ExchangeError::EmptyName)?;

    let item_id = Uuid::new_v4().to_string();
    participant.wishlist.push(WishlistItem {
        id: item_id.clone(),
        name,
        description: non_blank(item.description),
        link: non_blank(item.link),
    });

    Ok(vec![ExchangeEvent::WishlistItemAdded {
        participant_id: participant.id.clone(),
        item_id,
    }])
}

pub fn remove_wishlist_item(
    state: &mut ExchangeState,
    item_id: &str,
) -> Result<Vec<ExchangeEvent>, ExchangeError> {
    let participant = active_participant_mut(state)?;
    let index = participant
        .wishlist
        .iter()
        .position(|item| item.id == item_id)
        .ok_or(ExchangeError::ItemNotFound)?;
    let removed = participant.wishlist.remove(index);

    Ok(vec![ExchangeEvent::WishlistItemRemoved {
        participant_id: participant.id.clone(),
        item_id: removed.id,
    }])
}

pub fn update_wishlist_item(
    state: &mut ExchangeState,
    item_id: &str,
    patch: WishlistPatch,
) -> Result<Vec<ExchangeEvent>, ExchangeError> {
    let participant = active_participant_mut(state)?;
    let participant_id = participant.id.clone();
    let item = participant
        .wishlist
        .iter_mut()
        .find(|item| item.id == item_id)
        .ok_or(ExchangeError::ItemNotFound)?;

    let name = match patch.name {
        Some(name) => Some(non_blank(Some(name)).ok_or(ExchangeError::EmptyName)?),
        None => None,
    };

    if let Some(name) = name {
        item.name = name;
    }
    if let Some(description) = patch.description {
        item.description = non_blank(Some(description));
    }
    if let Some(link) = patch.link {
        item.link = non_blank(Some(link));
    }

    Ok(vec![ExchangeEvent::WishlistItemUpdated {
        participant_id,
        item_id: item.id.clone(),
    }])
}

pub fn perform_draw<R: Rng + ?Sized>(
    state: &mut ExchangeState,
    rng: &mut R,
    max_attempts: usize,
) -> Result<Vec<ExchangeEvent>, ExchangeError> {
    if state.drawing_complete {
        return Err(ExchangeError::AlreadyDrawn);
    }
    let count = state.participants.len();
    if count < 2 {
        return Err(ExchangeError::NotEnoughParticipants { count });
    }

    let ids: Vec<ParticipantId> = state.participants.iter().map(|p| p.id.clone()).collect();
    let assignment = derangement(&ids, rng, max_attempts)?;

    for (participant, (_, target)) in state
        .participants
        .iter_mut()
        .zip(assignment.into_pairs())
    {
        participant.drawn_id = Some(target);
    }
    state.drawing_complete = true;

    Ok(vec![ExchangeEvent::DrawCompleted {
        participants: count,
    }])
}

pub fn reset_draw(state: &mut ExchangeState) -> Vec<ExchangeEvent> {
    for participant in state.participants.iter_mut() {
        participant.drawn_id = None;
    }
    state.drawing_complete = false;
    vec![ExchangeEvent::DrawReset]
}

fn active_participant_mut(state: &mut ExchangeState) -> Result<&mut Participant, ExchangeError> {
    let active = state
        .active_participant_id
        .as_deref()
        .ok_or(ExchangeError::NoActiveParticipant)?;
    state
        .participants
        .iter_mut()
        .find(|p| p.id == active)
        .ok_or(ExchangeError::NoActiveParticipant)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn email_local_part(email: &str) -> Option<String> {
    email
        .split('@')
        .next()
        .map(str::trim)
        .filter(|local| !local.is_empty())
        .map(str::to_string)
}

fn replace(slot: &mut String, value: String) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
