use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::store::CalendarGuards;
use super::EngineError;

/// Guides whose calendars must be locked before resolving: the requested one,
/// or every guide on the tour.
pub fn candidates(tour: &Tour, requested: Option<Ulid>) -> Result<Vec<Ulid>, EngineError> {
    match requested {
        Some(guide_id) => {
            if tour.definition.guide(&guide_id).is_none() {
                return Err(EngineError::InvalidGuide { guide_id, tour_id: tour.id });
            }
            Ok(vec![guide_id])
        }
        None => Ok(tour.definition.guides.iter().map(|g| g.guide_id).collect()),
    }
}

/// Whether `calendar`'s guide can lead the departure of `tour_id` on `date`
/// occupying `span`. Busy markers block whole days. Other bookings block on
/// real overlap, except bookings on the same departure, which share the guide.
pub fn check_guide(calendar: &GuideCalendar, tour_id: Ulid, date: NaiveDate, span: &Span) -> Result<(), EngineError> {
    let days = span.covering_days();
    if calendar
        .overlapping(&days)
        .any(|e| matches!(e.kind, EntryKind::Busy))
    {
        return Err(EngineError::GuideMarkedBusy(calendar.guide_id));
    }
    let clash = calendar.overlapping(span).find(|e| match e.kind {
        EntryKind::Booking { tour_id: t, date: d } => (t, d) != (tour_id, date) && e.span.overlaps(span),
        EntryKind::Busy => false,
    });
    if let Some(entry) = clash {
        return Err(EngineError::GuideHasBooking {
            guide_id: calendar.guide_id,
            booking_id: entry.id,
        });
    }
    Ok(())
}

/// Pick the guide for a new booking. The caller holds write locks on the
/// calendars of every id returned by [`candidates`]. No writes happen here.
///
/// With an explicit guide, that guide must pass [`check_guide`]. Otherwise
/// a guide already leading this departure is tried first, then the main
/// guide, then by fewest bookings that day, then in tour order;
/// `ALL_GUIDES_BUSY` if none passes. A tour without
/// guides books unassigned.
pub fn resolve(
    tour: &Tour,
    requested: Option<Ulid>,
    date: NaiveDate,
    span: &Span,
    calendars: &CalendarGuards,
) -> Result<Option<Ulid>, EngineError> {
    if let Some(guide_id) = requested {
        let calendar = calendars
            .get(&guide_id)
            .ok_or(EngineError::InvalidGuide { guide_id, tour_id: tour.id })?;
        check_guide(calendar, tour.id, date, span)?;
        return Ok(Some(guide_id));
    }

    let guides = &tour.definition.guides;
    if guides.is_empty() {
        return Ok(None);
    }

    let mut ordered: Vec<(bool, usize, &TourGuide, usize)> = guides
        .iter()
        .enumerate()
        .map(|(pos, g)| {
            let calendar = calendars.get(&g.guide_id);
            let leads = calendar.is_some_and(|c| c.leads(tour.id, date));
            let load = calendar.map_or(0, |c| c.bookings_on(date));
            (leads, pos, g, load)
        })
        .collect();
    ordered.sort_by_key(|(leads, pos, g, load)| (!*leads, !g.is_main, *load, *pos));

    for (_, _, guide, _) in ordered {
        let Some(calendar) = calendars.get(&guide.guide_id) else {
            continue;
        };
        if check_guide(calendar, tour.id, date, span).is_ok() {
            return Ok(Some(guide.guide_id));
        }
    }
    Err(EngineError::AllGuidesBusy)
}
