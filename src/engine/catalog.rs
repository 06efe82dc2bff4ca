use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits::*;
use crate::model::*;

use super::store::apply_catalog;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Location,
    Category,
}

impl CatalogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::Location => "location",
            CatalogKind::Category => "category",
        }
    }
}

impl Engine {
    pub async fn register_catalog_entry(
        &self,
        actor: &Actor,
        kind: CatalogKind,
        id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        actor.require_admin()?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::validation("name", "required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::validation("name", "too long"));
        }

        let _gate = self.writes.read().await;
        let mut catalog = self.store.catalog.write().await;
        let exists = match kind {
            CatalogKind::Location => catalog.locations.contains_key(&id),
            CatalogKind::Category => catalog.categories.contains_key(&id),
        };
        if exists {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = match kind {
            CatalogKind::Location => Event::LocationRegistered { id, name },
            CatalogKind::Category => Event::CategoryRegistered { id, name },
        };
        self.wal_append(&event).await?;
        apply_catalog(&mut catalog, &event);
        info!(%id, kind = kind.as_str(), "catalog entry registered");
        Ok(())
    }

    /// Existing tours keep their references; pending proposals that point
    /// at a removed entry can no longer be approved.
    pub async fn remove_catalog_entry(&self, actor: &Actor, kind: CatalogKind, id: Ulid) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.writes.read().await;
        let mut catalog = self.store.catalog.write().await;
        let exists = match kind {
            CatalogKind::Location => catalog.locations.contains_key(&id),
            CatalogKind::Category => catalog.categories.contains_key(&id),
        };
        if !exists {
            return Err(EngineError::NotFound(id));
        }
        let event = match kind {
            CatalogKind::Location => Event::LocationRemoved { id },
            CatalogKind::Category => Event::CategoryRemoved { id },
        };
        self.wal_append(&event).await?;
        apply_catalog(&mut catalog, &event);
        info!(%id, kind = kind.as_str(), "catalog entry removed");
        Ok(())
    }

    /// Block whole days on a guide's calendar. Guides manage their own
    /// markers; admins manage anyone's.
    pub async fn add_busy_marker(
        &self,
        actor: &Actor,
        id: Ulid,
        guide_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        note: Option<String>,
    ) -> Result<BusyMarker, EngineError> {
        ensure_marker_owner(actor, guide_id)?;
        if end_date < start_date {
            return Err(EngineError::validation("end_date", "must not be before start_date"));
        }
        if (end_date - start_date).num_days() >= MAX_MARKER_DAYS {
            return Err(EngineError::LimitExceeded("busy marker spans too many days"));
        }
        if note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::validation("note", "too long"));
        }

        let _gate = self.writes.read().await;
        let mut calendar = self.store.calendar(guide_id).write_owned().await;
        if self.store.marker(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if calendar.markers >= MAX_MARKERS_PER_GUIDE {
            return Err(EngineError::LimitExceeded("too many busy markers for guide"));
        }
        let marker = BusyMarker { id, guide_id, start_date, end_date, note };
        let event = Event::BusyMarkerAdded { marker: marker.clone() };
        self.wal_append(&event).await?;
        self.store.apply_marker(&mut calendar, &event);
        info!(marker_id = %id, %guide_id, %start_date, %end_date, "guide marked busy");
        Ok(marker)
    }

    pub async fn remove_busy_marker(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let marker = self.store.marker(&id).ok_or(EngineError::NotFound(id))?;
        ensure_marker_owner(actor, marker.guide_id)?;

        let _gate = self.writes.read().await;
        let mut calendar = self.store.calendar(marker.guide_id).write_owned().await;
        if self.store.marker(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BusyMarkerRemoved { id, guide_id: marker.guide_id };
        self.wal_append(&event).await?;
        self.store.apply_marker(&mut calendar, &event);
        info!(marker_id = %id, guide_id = %marker.guide_id, "busy marker removed");
        Ok(())
    }
}

fn ensure_marker_owner(actor: &Actor, guide_id: Ulid) -> Result<(), EngineError> {
    match actor {
        Actor::Admin(_) => Ok(()),
        Actor::Guide(id) if *id == guide_id => Ok(()),
        _ => Err(EngineError::Forbidden("guides manage only their own busy markers")),
    }
}
