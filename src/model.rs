use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Calendar dates use `NaiveDate`.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Midnight UTC of `date`, in ms.
pub fn date_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The whole calendar day of `date`.
    pub fn day(date: NaiveDate) -> Self {
        let start = date_start_ms(date);
        Self::new(start, start + DAY_MS)
    }

    /// Inclusive date range `[first, last]` as whole days.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Self {
        let start = date_start_ms(first);
        Self::new(start, date_start_ms(last) + DAY_MS)
    }

    /// Departure on `date` at `time`, lasting `minutes`.
    pub fn departure(date: NaiveDate, time: NaiveTime, minutes: u32) -> Self {
        let start = date.and_time(time).and_utc().timestamp_millis();
        Self::new(start, start + (minutes.max(1) as Ms) * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widen to whole UTC days, so that a booking at 14:00 collides with a
    /// busy marker covering the same date.
    pub fn covering_days(&self) -> Span {
        let start = self.start.div_euclid(DAY_MS) * DAY_MS;
        let end = (self.end + DAY_MS - 1).div_euclid(DAY_MS) * DAY_MS;
        Span::new(start, end.max(start + DAY_MS))
    }
}

/// Set of weekdays packed into one byte (bit 0 = Monday).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        std::iter::successors(Some(Weekday::Mon), |d| Some(d.succ()))
            .take(7)
            .filter(|d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = WeekdaySet::default();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

// ── Tours and proposals ──────────────────────────────────────────

/// When a tour may be booked. Immutable once the tour exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingPolicy {
    pub allow_custom_date: bool,
    /// Scheduled departures; only consulted when `allow_custom_date` is false.
    pub departure_dates: BTreeSet<NaiveDate>,
    pub fixed_departure_time: Option<NaiveTime>,
    pub min_days_before_start: u32,
    pub max_days_advance: u32,
    pub closed_weekdays: WeekdaySet,
    pub blackout_dates: BTreeSet<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TourGuide {
    pub guide_id: Ulid,
    pub is_main: bool,
    /// Percent of the booking amount, 0..=100.
    pub revenue_share: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItineraryItem {
    pub day: u16,
    pub title: String,
    pub description: Option<String>,
}

/// Everything a guide proposes and a tour inherits on approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TourDefinition {
    pub name: String,
    pub description: String,
    pub category_id: Option<Ulid>,
    /// Ordered location references.
    pub location_ids: Vec<Ulid>,
    pub itinerary: Vec<ItineraryItem>,
    pub duration_minutes: u32,
    /// Per adult, in minor currency units.
    pub price: u64,
    /// Per child, in minor currency units.
    pub child_price: u64,
    pub max_guests: u32,
    pub per_date_capacity: Option<u32>,
    pub policy: SchedulingPolicy,
    pub guides: Vec<TourGuide>,
}

impl TourDefinition {
    /// `per_date_capacity` overrides `max_guests` when set.
    pub fn effective_cap(&self) -> u32 {
        self.per_date_capacity.unwrap_or(self.max_guests)
    }

    pub fn guide(&self, guide_id: &Ulid) -> Option<&TourGuide> {
        self.guides.iter().find(|g| g.guide_id == *guide_id)
    }

    pub fn start_time(&self) -> NaiveTime {
        self.policy.fixed_departure_time.unwrap_or(NaiveTime::MIN)
    }

    /// Total in minor units; `None` on overflow.
    pub fn amount_for(&self, adults: u32, children: u32) -> Option<u64> {
        let adults = self.price.checked_mul(adults as u64)?;
        let children = self.child_price.checked_mul(children as u64)?;
        adults.checked_add(children)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tour {
    pub id: Ulid,
    pub slug: String,
    pub definition: TourDefinition,
    pub proposal_id: Option<Ulid>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProposalStatus::Pending),
            "approved" => Some(ProposalStatus::Approved),
            "rejected" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer_id: Ulid,
    pub reviewed_at: Ms,
    pub notes: Option<String>,
    /// Set on approval.
    pub tour_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Ulid,
    pub author_id: Ulid,
    pub definition: TourDefinition,
    pub status: ProposalStatus,
    pub resubmission_of: Option<Ulid>,
    pub submitted_at: Ms,
    pub review: Option<Review>,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    WaitingGuide,
    AwaitingPayment,
    Paid,
    Completed,
    Canceled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::WaitingGuide => "waiting_guide",
            BookingStatus::AwaitingPayment => "awaiting_payment",
            BookingStatus::Paid => "paid",
            BookingStatus::Completed => "completed",
            BookingStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Canceled)
    }

    /// Whether the lifecycle permits `self → to`.
    pub fn can_transition_to(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (WaitingGuide, AwaitingPayment)
                | (WaitingGuide, Canceled)
                | (AwaitingPayment, Paid)
                | (AwaitingPayment, Canceled)
                | (Paid, Completed)
                | (Paid, Canceled)
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundState {
    NotRequired,
    Pending,
    Issued,
}

impl RefundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundState::NotRequired => "not_required",
            RefundState::Pending => "pending",
            RefundState::Issued => "issued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tour_id: Ulid,
    pub customer_id: Option<Ulid>,
    pub start_date: NaiveDate,
    pub start_time: NaiveTime,
    /// Time the assigned guide is occupied.
    pub span: Span,
    pub adults: u32,
    pub children: u32,
    pub guide_id: Option<Ulid>,
    pub contact: Contact,
    pub status: BookingStatus,
    pub amount: u64,
    pub payment_ref: Option<String>,
    pub refund: RefundState,
    pub created_at: Ms,
    /// Last status change; expiry windows count from here.
    pub updated_at: Ms,
}

impl Booking {
    pub fn guest_count(&self) -> u32 {
        self.adults + self.children
    }

    /// Counts against capacity and guide occupancy.
    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Canceled
    }
}

/// Why a booking changed status. Recorded in the WAL for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionCause {
    GuideAccepted { guide_id: Ulid },
    GuideRejected { guide_id: Ulid },
    PaymentConfirmed { reference: String },
    Completed,
    Canceled { by: Option<Ulid>, reason: Option<String> },
    Expired,
}

/// Manually blocked days for a guide, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyMarker {
    pub id: Ulid,
    pub guide_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub note: Option<String>,
}

impl BusyMarker {
    pub fn span(&self) -> Span {
        Span::days(self.start_date, self.end_date)
    }
}

// ── Guide calendar ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Busy,
    Booking { tour_id: Ulid, date: NaiveDate },
}

/// One occupied span on a guide's calendar; `id` is the marker or booking id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub id: Ulid,
    pub span: Span,
    pub kind: EntryKind,
}

/// Busy markers plus active bookings of one guide, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct GuideCalendar {
    pub guide_id: Ulid,
    pub entries: Vec<CalendarEntry>,
    pub markers: usize,
}

impl GuideCalendar {
    pub fn new(guide_id: Ulid) -> Self {
        Self {
            guide_id,
            entries: Vec::new(),
            markers: 0,
        }
    }

    /// Insert entry maintaining sort order by span.start.
    pub fn insert(&mut self, entry: CalendarEntry) {
        if matches!(entry.kind, EntryKind::Busy) {
            self.markers += 1;
        }
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<CalendarEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        let removed = self.entries.remove(pos);
        if matches!(removed.kind, EntryKind::Busy) {
            self.markers -= 1;
        }
        Some(removed)
    }

    /// Entries whose span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &CalendarEntry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    /// Whether this guide already leads the `tour_id` departure on `date`.
    pub fn leads(&self, tour_id: Ulid, date: NaiveDate) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == EntryKind::Booking { tour_id, date })
    }

    /// Bookings (not markers) that start on `date`.
    pub fn bookings_on(&self, date: NaiveDate) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::Booking { date: d, .. } if d == date))
            .count()
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub locations: std::collections::HashMap<Ulid, String>,
    pub categories: std::collections::HashMap<Ulid, String>,
}

// ── WAL record ───────────────────────────────────────────────────

/// The event types. This is the WAL record format; one event is one atomic write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationRegistered {
        id: Ulid,
        name: String,
    },
    LocationRemoved {
        id: Ulid,
    },
    CategoryRegistered {
        id: Ulid,
        name: String,
    },
    CategoryRemoved {
        id: Ulid,
    },
    ProposalSubmitted {
        proposal: Proposal,
    },
    /// Approval and the materialized tour travel together.
    ProposalApproved {
        proposal_id: Ulid,
        review: Review,
        tour: Tour,
    },
    ProposalRejected {
        proposal_id: Ulid,
        review: Review,
    },
    /// Written by compaction only.
    TourPublished {
        tour: Tour,
    },
    BookingCreated {
        booking: Booking,
    },
    GuideAssigned {
        booking_id: Ulid,
        tour_id: Ulid,
        guide_id: Ulid,
        at: Ms,
    },
    BookingTransitioned {
        booking_id: Ulid,
        tour_id: Ulid,
        to: BookingStatus,
        cause: TransitionCause,
        at: Ms,
    },
    RefundIssued {
        booking_id: Ulid,
        tour_id: Ulid,
        at: Ms,
    },
    BusyMarkerAdded {
        marker: BusyMarker,
    },
    BusyMarkerRemoved {
        id: Ulid,
        guide_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityInfo {
    pub tour_id: Ulid,
    pub date: NaiveDate,
    pub effective_cap: u32,
    pub consumed: u32,
    pub remaining: u32,
}
