use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// A tour plus every booking ever made on it. Capacity is derived from the
/// bookings, never stored.
#[derive(Debug, Clone)]
pub struct TourState {
    pub tour: Arc<Tour>,
    pub bookings: HashMap<Ulid, Booking>,
    /// Booking ids grouped by start date, in insertion order.
    pub by_date: BTreeMap<NaiveDate, Vec<Ulid>>,
}

/// Guide calendar change implied by applying an event to a tour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupancy {
    Occupy {
        guide_id: Ulid,
        booking_id: Ulid,
        tour_id: Ulid,
        date: NaiveDate,
        span: Span,
    },
    Release {
        guide_id: Ulid,
        booking_id: Ulid,
    },
}

impl Occupancy {
    pub fn guide_id(&self) -> Ulid {
        match self {
            Occupancy::Occupy { guide_id, .. } | Occupancy::Release { guide_id, .. } => *guide_id,
        }
    }

    pub fn apply(&self, calendar: &mut GuideCalendar) {
        match self {
            Occupancy::Occupy { booking_id, tour_id, date, span, .. } => {
                calendar.insert(CalendarEntry {
                    id: *booking_id,
                    span: *span,
                    kind: EntryKind::Booking { tour_id: *tour_id, date: *date },
                });
            }
            Occupancy::Release { booking_id, .. } => {
                calendar.remove(*booking_id);
            }
        }
    }
}

impl TourState {
    pub fn new(tour: Tour) -> Self {
        Self {
            tour: Arc::new(tour),
            bookings: HashMap::new(),
            by_date: BTreeMap::new(),
        }
    }

    pub fn effective_cap(&self) -> u32 {
        self.tour.definition.effective_cap()
    }

    /// Guests held by non-canceled bookings on `date`.
    pub fn consumed(&self, date: NaiveDate) -> u32 {
        self.by_date
            .get(&date)
            .into_iter()
            .flatten()
            .filter_map(|id| self.bookings.get(id))
            .filter(|b| b.is_active())
            .map(|b| b.guest_count())
            .sum()
    }

    pub fn remaining(&self, date: NaiveDate) -> u32 {
        self.effective_cap().saturating_sub(self.consumed(date))
    }

    pub fn capacity(&self, date: NaiveDate) -> CapacityInfo {
        let consumed = self.consumed(date);
        let effective_cap = self.effective_cap();
        CapacityInfo {
            tour_id: self.tour.id,
            date,
            effective_cap,
            consumed,
            remaining: effective_cap.saturating_sub(consumed),
        }
    }

    /// Capacity half of check-and-reserve. The caller must hold this tour's
    /// write lock until the booking is persisted and applied.
    pub fn check_capacity(&self, date: NaiveDate, requested: u32) -> Result<(), EngineError> {
        let remaining = self.remaining(date);
        if remaining < requested {
            return Err(EngineError::InsufficientSlots { remaining, requested });
        }
        Ok(())
    }

    /// Apply a booking event. Returns the guide calendar changes the caller
    /// must apply under the same locks.
    pub fn apply(&mut self, event: &Event) -> Vec<Occupancy> {
        match event {
            Event::BookingCreated { booking } => {
                self.by_date.entry(booking.start_date).or_default().push(booking.id);
                let change = match booking.guide_id {
                    Some(guide_id) if booking.is_active() => vec![occupy(guide_id, booking)],
                    _ => Vec::new(),
                };
                self.bookings.insert(booking.id, booking.clone());
                change
            }
            Event::GuideAssigned { booking_id, guide_id, at, .. } => {
                let Some(booking) = self.bookings.get_mut(booking_id) else {
                    return Vec::new();
                };
                let mut changes = Vec::new();
                if let Some(previous) = booking.guide_id {
                    changes.push(Occupancy::Release { guide_id: previous, booking_id: *booking_id });
                }
                booking.guide_id = Some(*guide_id);
                booking.updated_at = *at;
                changes.push(occupy(*guide_id, booking));
                changes
            }
            Event::BookingTransitioned { booking_id, to, cause, at, .. } => {
                let Some(booking) = self.bookings.get_mut(booking_id) else {
                    return Vec::new();
                };
                let was_paid = booking.status == BookingStatus::Paid;
                booking.status = *to;
                booking.updated_at = *at;
                match cause {
                    TransitionCause::GuideAccepted { guide_id } if booking.guide_id.is_none() => {
                        booking.guide_id = Some(*guide_id);
                        return vec![occupy(*guide_id, booking)];
                    }
                    TransitionCause::PaymentConfirmed { reference } => {
                        booking.payment_ref = Some(reference.clone());
                    }
                    _ => {}
                }
                if *to == BookingStatus::Canceled {
                    if was_paid {
                        booking.refund = RefundState::Pending;
                    }
                    if let Some(guide_id) = booking.guide_id {
                        return vec![Occupancy::Release { guide_id, booking_id: *booking_id }];
                    }
                }
                Vec::new()
            }
            Event::RefundIssued { booking_id, .. } => {
                if let Some(booking) = self.bookings.get_mut(booking_id) {
                    booking.refund = RefundState::Issued;
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

fn occupy(guide_id: Ulid, booking: &Booking) -> Occupancy {
    Occupancy::Occupy {
        guide_id,
        booking_id: booking.id,
        tour_id: booking.tour_id,
        date: booking.start_date,
        span: booking.span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 3, 12).unwrap()
    }

    fn tour(max_guests: u32, per_date_capacity: Option<u32>) -> Tour {
        Tour {
            id: Ulid::new(),
            slug: "t".into(),
            definition: TourDefinition {
                name: "T".into(),
                description: String::new(),
                category_id: None,
                location_ids: vec![],
                itinerary: vec![],
                duration_minutes: 120,
                price: 100,
                child_price: 50,
                max_guests,
                per_date_capacity,
                policy: SchedulingPolicy {
                    allow_custom_date: true,
                    departure_dates: BTreeSet::new(),
                    fixed_departure_time: None,
                    min_days_before_start: 0,
                    max_days_advance: 365,
                    closed_weekdays: WeekdaySet::default(),
                    blackout_dates: BTreeSet::new(),
                },
                guides: vec![],
            },
            proposal_id: None,
            created_at: 0,
        }
    }

    #[test]
    fn amount_overflow_is_none() {
        let mut t = tour(10, None);
        assert_eq!(t.definition.amount_for(2, 1), Some(250));
        t.definition.price = u64::MAX / 2 + 1;
        assert_eq!(t.definition.amount_for(2, 0), None);
        assert_eq!(t.definition.amount_for(1, 0), Some(u64::MAX / 2 + 1));
    }

    fn booking(ts: &TourState, adults: u32, guide_id: Option<Ulid>) -> Booking {
        Booking {
            id: Ulid::new(),
            tour_id: ts.tour.id,
            customer_id: None,
            start_date: date(),
            start_time: chrono::NaiveTime::MIN,
            span: Span::departure(date(), chrono::NaiveTime::MIN, 120),
            adults,
            children: 0,
            guide_id,
            contact: Contact {
                full_name: "A".into(),
                email: "a@example.com".into(),
                phone: "1".into(),
                note: None,
            },
            status: BookingStatus::WaitingGuide,
            amount: 0,
            payment_ref: None,
            refund: RefundState::NotRequired,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn cancel(ts: &mut TourState, id: Ulid) -> Vec<Occupancy> {
        ts.apply(&Event::BookingTransitioned {
            booking_id: id,
            tour_id: ts.tour.id,
            to: BookingStatus::Canceled,
            cause: TransitionCause::Expired,
            at: 1,
        })
    }

    #[test]
    fn per_date_capacity_overrides_max_guests() {
        let ts = TourState::new(tour(30, Some(10)));
        assert_eq!(ts.remaining(date()), 10);
        let ts = TourState::new(tour(30, None));
        assert_eq!(ts.remaining(date()), 30);
    }

    #[test]
    fn exact_fill_then_reject() {
        let mut ts = TourState::new(tour(30, Some(10)));
        assert!(ts.check_capacity(date(), 10).is_ok());
        let b = booking(&ts, 10, None);
        ts.apply(&Event::BookingCreated { booking: b });
        assert_eq!(ts.remaining(date()), 0);
        match ts.check_capacity(date(), 1) {
            Err(EngineError::InsufficientSlots { remaining, requested }) => {
                assert_eq!((remaining, requested), (0, 1));
            }
            other => panic!("expected InsufficientSlots, got {other:?}"),
        }
    }

    #[test]
    fn canceled_bookings_release_capacity() {
        let mut ts = TourState::new(tour(5, None));
        let b = booking(&ts, 4, None);
        let id = b.id;
        ts.apply(&Event::BookingCreated { booking: b });
        assert_eq!(ts.consumed(date()), 4);
        cancel(&mut ts, id);
        assert_eq!(ts.consumed(date()), 0);
        assert_eq!(ts.capacity(date()).remaining, 5);
    }

    #[test]
    fn other_dates_unaffected() {
        let mut ts = TourState::new(tour(5, None));
        let b = booking(&ts, 5, None);
        ts.apply(&Event::BookingCreated { booking: b });
        let next = date().succ_opt().unwrap();
        assert_eq!(ts.remaining(next), 5);
    }

    #[test]
    fn occupancy_follows_guide_changes() {
        let mut ts = TourState::new(tour(5, None));
        let g1 = Ulid::new();
        let g2 = Ulid::new();
        let b = booking(&ts, 1, Some(g1));
        let id = b.id;

        let created = ts.apply(&Event::BookingCreated { booking: b });
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].guide_id(), g1);

        let reassigned = ts.apply(&Event::GuideAssigned {
            booking_id: id,
            tour_id: ts.tour.id,
            guide_id: g2,
            at: 5,
        });
        assert_eq!(reassigned[0], Occupancy::Release { guide_id: g1, booking_id: id });
        assert_eq!(reassigned[1].guide_id(), g2);

        let canceled = cancel(&mut ts, id);
        assert_eq!(canceled, vec![Occupancy::Release { guide_id: g2, booking_id: id }]);
    }

    #[test]
    fn canceling_paid_booking_marks_refund_pending() {
        let mut ts = TourState::new(tour(5, None));
        let mut b = booking(&ts, 1, None);
        b.status = BookingStatus::Paid;
        let id = b.id;
        ts.apply(&Event::BookingCreated { booking: b });
        cancel(&mut ts, id);
        assert_eq!(ts.bookings[&id].refund, RefundState::Pending);

        ts.apply(&Event::RefundIssued { booking_id: id, tour_id: ts.tour.id, at: 2 });
        assert_eq!(ts.bookings[&id].refund, RefundState::Issued);
    }
}
