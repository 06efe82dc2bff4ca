use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::ledger::{Occupancy, TourState};

pub type SharedTourState = Arc<RwLock<TourState>>;
pub type SharedCalendar = Arc<RwLock<GuideCalendar>>;
pub type SharedProposal = Arc<RwLock<Proposal>>;

/// Calendar write guards keyed by guide id. Iteration order is the lock order.
pub type CalendarGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<GuideCalendar>>;

/// A published tour. `tour` is immutable and readable without the lock.
#[derive(Clone)]
pub struct TourSlot {
    pub tour: Arc<Tour>,
    pub state: SharedTourState,
}

/// In-memory indexes behind the engine. Every mutation goes through an
/// `apply_*` function so live writes and WAL replay produce the same state.
pub struct InMemoryStore {
    tours: DashMap<Ulid, TourSlot>,
    calendars: DashMap<Ulid, SharedCalendar>,
    proposals: DashMap<Ulid, SharedProposal>,
    booking_to_tour: DashMap<Ulid, Ulid>,
    markers: DashMap<Ulid, BusyMarker>,
    pub(super) catalog: RwLock<Catalog>,
    /// slug → tour id
    pub(super) slugs: RwLock<HashMap<String, Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tours: DashMap::new(),
            calendars: DashMap::new(),
            proposals: DashMap::new(),
            booking_to_tour: DashMap::new(),
            markers: DashMap::new(),
            catalog: RwLock::new(Catalog::default()),
            slugs: RwLock::new(HashMap::new()),
        }
    }

    // ── Tours ────────────────────────────────────────────────

    pub fn tour(&self, id: &Ulid) -> Option<TourSlot> {
        self.tours.get(id).map(|e| e.value().clone())
    }

    pub fn tour_count(&self) -> usize {
        self.tours.len()
    }

    pub fn tours(&self) -> Vec<TourSlot> {
        let mut slots: Vec<TourSlot> = self.tours.iter().map(|e| e.value().clone()).collect();
        slots.sort_by_key(|s| s.tour.id);
        slots
    }

    /// Register a tour and its slug. The caller holds the slug registry.
    pub fn publish_tour(&self, tour: Tour, slugs: &mut HashMap<String, Ulid>) {
        slugs.insert(tour.slug.clone(), tour.id);
        let id = tour.id;
        let state = TourState::new(tour);
        let slot = TourSlot {
            tour: state.tour.clone(),
            state: Arc::new(RwLock::new(state)),
        };
        self.tours.insert(id, slot);
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn tour_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_tour.get(booking_id).map(|e| *e.value())
    }

    pub fn contains_booking(&self, booking_id: &Ulid) -> bool {
        self.booking_to_tour.contains_key(booking_id)
    }

    // ── Guide calendars ──────────────────────────────────────

    /// The guide's calendar, created empty on first use.
    pub fn calendar(&self, guide_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(guide_id)
            .or_insert_with(|| Arc::new(RwLock::new(GuideCalendar::new(guide_id))))
            .clone()
    }

    /// Write-lock the calendars of `guide_ids` in ascending id order.
    pub async fn lock_calendars(&self, guide_ids: impl IntoIterator<Item = Ulid>) -> CalendarGuards {
        let mut ids: Vec<Ulid> = guide_ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        let mut guards = CalendarGuards::new();
        for id in ids {
            let guard = self.calendar(id).write_owned().await;
            guards.insert(id, guard);
        }
        guards
    }

    // ── Busy markers ─────────────────────────────────────────

    pub fn marker(&self, id: &Ulid) -> Option<BusyMarker> {
        self.markers.get(id).map(|e| e.value().clone())
    }

    pub fn markers(&self, guide_id: Option<Ulid>) -> Vec<BusyMarker> {
        let mut out: Vec<BusyMarker> = self
            .markers
            .iter()
            .filter(|e| guide_id.is_none_or(|g| e.value().guide_id == g))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|m| (m.start_date, m.id));
        out
    }

    // ── Proposals ────────────────────────────────────────────

    pub fn proposal(&self, id: &Ulid) -> Option<SharedProposal> {
        self.proposals.get(id).map(|e| e.value().clone())
    }

    pub fn contains_proposal(&self, id: &Ulid) -> bool {
        self.proposals.contains_key(id)
    }

    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }

    pub fn proposals(&self) -> Vec<SharedProposal> {
        let mut entries: Vec<(Ulid, SharedProposal)> = self
            .proposals
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, p)| p).collect()
    }

    pub fn insert_proposal(&self, proposal: Proposal) {
        self.proposals.insert(proposal.id, Arc::new(RwLock::new(proposal)));
    }

    // ── Event application ────────────────────────────────────

    /// Apply a booking event to a locked tour and the locked calendars it
    /// touches.
    pub fn apply_booking(&self, tour: &mut TourState, calendars: &mut CalendarGuards, event: &Event) {
        if let Event::BookingCreated { booking } = event {
            self.booking_to_tour.insert(booking.id, booking.tour_id);
        }
        for change in tour.apply(event) {
            match calendars.get_mut(&change.guide_id()) {
                Some(calendar) => change.apply(calendar),
                None => tracing::error!(
                    guide_id = %change.guide_id(),
                    "calendar change without a held calendar lock"
                ),
            }
        }
    }

    pub fn apply_marker(&self, calendar: &mut GuideCalendar, event: &Event) {
        match event {
            Event::BusyMarkerAdded { marker } => {
                calendar.insert(CalendarEntry {
                    id: marker.id,
                    span: marker.span(),
                    kind: EntryKind::Busy,
                });
                self.markers.insert(marker.id, marker.clone());
            }
            Event::BusyMarkerRemoved { id, .. } => {
                calendar.remove(*id);
                self.markers.remove(id);
            }
            _ => {}
        }
    }

    /// Rebuild state from one WAL record. Replay owns every lock, so `try_*`
    /// never contends.
    pub fn replay(&self, event: &Event) {
        match event {
            Event::LocationRegistered { .. }
            | Event::LocationRemoved { .. }
            | Event::CategoryRegistered { .. }
            | Event::CategoryRemoved { .. } => {
                if let Ok(mut catalog) = self.catalog.try_write() {
                    apply_catalog(&mut catalog, event);
                }
            }
            Event::ProposalSubmitted { proposal } => self.insert_proposal(proposal.clone()),
            Event::ProposalApproved { proposal_id, tour, .. } => {
                self.replay_resolution(proposal_id, event);
                if let Ok(mut slugs) = self.slugs.try_write() {
                    self.publish_tour(tour.clone(), &mut slugs);
                }
            }
            Event::ProposalRejected { proposal_id, .. } => self.replay_resolution(proposal_id, event),
            Event::TourPublished { tour } => {
                if let Ok(mut slugs) = self.slugs.try_write() {
                    self.publish_tour(tour.clone(), &mut slugs);
                }
            }
            Event::BookingCreated { .. }
            | Event::GuideAssigned { .. }
            | Event::BookingTransitioned { .. }
            | Event::RefundIssued { .. } => {
                let Some(tour_id) = booking_event_tour(event) else { return };
                let Some(slot) = self.tour(&tour_id) else { return };
                let Ok(mut tour) = slot.state.try_write() else { return };
                if let Event::BookingCreated { booking } = event {
                    self.booking_to_tour.insert(booking.id, booking.tour_id);
                }
                for change in tour.apply(event) {
                    self.replay_occupancy(&change);
                }
            }
            Event::BusyMarkerAdded { marker } => {
                if let Ok(mut calendar) = self.calendar(marker.guide_id).try_write_owned() {
                    self.apply_marker(&mut calendar, event);
                }
            }
            Event::BusyMarkerRemoved { guide_id, .. } => {
                if let Ok(mut calendar) = self.calendar(*guide_id).try_write_owned() {
                    self.apply_marker(&mut calendar, event);
                }
            }
        }
    }

    fn replay_resolution(&self, proposal_id: &Ulid, event: &Event) {
        if let Some(shared) = self.proposal(proposal_id)
            && let Ok(mut proposal) = shared.try_write()
        {
            apply_proposal(&mut proposal, event);
        }
    }

    fn replay_occupancy(&self, change: &Occupancy) {
        if let Ok(mut calendar) = self.calendar(change.guide_id()).try_write_owned() {
            change.apply(&mut calendar);
        }
    }
}

/// Tour id of a booking event.
pub fn booking_event_tour(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { booking } => Some(booking.tour_id),
        Event::GuideAssigned { tour_id, .. }
        | Event::BookingTransitioned { tour_id, .. }
        | Event::RefundIssued { tour_id, .. } => Some(*tour_id),
        _ => None,
    }
}

pub fn apply_catalog(catalog: &mut Catalog, event: &Event) {
    match event {
        Event::LocationRegistered { id, name } => {
            catalog.locations.insert(*id, name.clone());
        }
        Event::LocationRemoved { id } => {
            catalog.locations.remove(id);
        }
        Event::CategoryRegistered { id, name } => {
            catalog.categories.insert(*id, name.clone());
        }
        Event::CategoryRemoved { id } => {
            catalog.categories.remove(id);
        }
        _ => {}
    }
}

pub fn apply_proposal(proposal: &mut Proposal, event: &Event) {
    match event {
        Event::ProposalApproved { review, .. } => {
            proposal.status = ProposalStatus::Approved;
            proposal.review = Some(review.clone());
        }
        Event::ProposalRejected { review, .. } => {
            proposal.status = ProposalStatus::Rejected;
            proposal.review = Some(review.clone());
        }
        _ => {}
    }
}
