use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits::MAX_QUERY_ROWS;
use crate::model::*;

use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub tour_id: Option<Ulid>,
    pub booking_id: Option<Ulid>,
}

/// Whether `actor` may see `booking`: admins see everything, guides see
/// their own bookings and unassigned ones on tours they lead, customers see
/// their own.
fn visible(actor: &Actor, tour: &Tour, booking: &Booking) -> bool {
    match actor {
        Actor::Admin(_) => true,
        Actor::Guide(id) => match booking.guide_id {
            Some(g) => g == *id,
            None => tour.definition.guide(id).is_some(),
        },
        Actor::Tourist(Some(id)) => booking.customer_id == Some(*id),
        Actor::Tourist(None) => false,
    }
}

impl Engine {
    pub async fn capacity(&self, tour_id: Ulid, date: NaiveDate) -> Result<CapacityInfo, EngineError> {
        let slot = self.store.tour(&tour_id).ok_or(EngineError::NotFound(tour_id))?;
        let state = slot.state.read().await;
        Ok(state.capacity(date))
    }

    pub async fn booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let tour_id = self
            .store
            .tour_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let slot = self.store.tour(&tour_id).ok_or(EngineError::NotFound(tour_id))?;
        let state = slot.state.read().await;
        state
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Bookings visible to `actor`, ordered by date then id.
    pub async fn bookings(&self, actor: &Actor, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let slots = match (filter.booking_id, filter.tour_id) {
            (Some(booking_id), _) => match self.store.tour_for_booking(&booking_id) {
                Some(tour_id) if filter.tour_id.is_none_or(|t| t == tour_id) => {
                    self.store.tour(&tour_id).into_iter().collect()
                }
                _ => Vec::new(),
            },
            (None, Some(tour_id)) => {
                vec![self.store.tour(&tour_id).ok_or(EngineError::NotFound(tour_id))?]
            }
            (None, None) => self.store.tours(),
        };

        let mut out = Vec::new();
        for slot in slots {
            let state = slot.state.read().await;
            out.extend(
                state
                    .bookings
                    .values()
                    .filter(|b| filter.booking_id.is_none_or(|id| b.id == id))
                    .filter(|b| visible(actor, &slot.tour, b))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.start_date, b.id));
        out.truncate(MAX_QUERY_ROWS);
        Ok(out)
    }

    /// Admins see every proposal, guides their own.
    pub async fn proposals(&self, actor: &Actor, status: Option<ProposalStatus>) -> Result<Vec<Proposal>, EngineError> {
        let author = match actor {
            Actor::Admin(_) => None,
            Actor::Guide(id) => Some(*id),
            Actor::Tourist(_) => return Err(EngineError::Forbidden("proposals are visible to guides and admins")),
        };
        let mut out = Vec::new();
        for shared in self.store.proposals() {
            let proposal = shared.read().await;
            if author.is_none_or(|a| proposal.author_id == a) && status.is_none_or(|s| proposal.status == s) {
                out.push(proposal.clone());
            }
            if out.len() >= MAX_QUERY_ROWS {
                break;
            }
        }
        Ok(out)
    }

    pub fn tours(&self) -> Vec<Arc<Tour>> {
        let mut tours: Vec<Arc<Tour>> = self.store.tours().into_iter().map(|s| s.tour).collect();
        tours.sort_by_key(|t| (t.created_at, t.id));
        tours.truncate(MAX_QUERY_ROWS);
        tours
    }

    pub fn busy_markers(&self, actor: &Actor, guide_id: Option<Ulid>) -> Result<Vec<BusyMarker>, EngineError> {
        let filter = match actor {
            Actor::Admin(_) => guide_id,
            Actor::Guide(id) => Some(guide_id.unwrap_or(*id)),
            Actor::Tourist(_) => return Err(EngineError::Forbidden("busy markers are visible to guides and admins")),
        };
        let mut markers = self.store.markers(filter);
        markers.truncate(MAX_QUERY_ROWS);
        Ok(markers)
    }

    /// `(id, name)` pairs sorted by name.
    pub async fn locations(&self) -> Vec<(Ulid, String)> {
        let catalog = self.store.catalog.read().await;
        sorted_by_name(catalog.locations.iter())
    }

    pub async fn categories(&self) -> Vec<(Ulid, String)> {
        let catalog = self.store.catalog.read().await;
        sorted_by_name(catalog.categories.iter())
    }
}

fn sorted_by_name<'a>(entries: impl Iterator<Item = (&'a Ulid, &'a String)>) -> Vec<(Ulid, String)> {
    let mut out: Vec<(Ulid, String)> = entries.map(|(id, name)| (*id, name.clone())).collect();
    out.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    out
}
