use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::Actor;
use crate::gateway::{CheckoutRequest, CheckoutSession};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::error::FieldError;
use super::ledger::TourState;
use super::store::CalendarGuards;
use super::{guides, now_ms, rules, today, Engine, EngineError};

/// A tourist's request to join a tour on a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub tour_id: Ulid,
    pub start_date: NaiveDate,
    pub adults: u32,
    pub children: u32,
    pub guide_id: Option<Ulid>,
    pub contact: Contact,
}

impl NewBooking {
    fn guest_count(&self) -> u32 {
        self.adults.saturating_add(self.children)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.guest_count() > MAX_GUESTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many guests in one booking"));
        }
        let mut errors = Vec::new();
        if self.guest_count() == 0 {
            errors.push(FieldError::new("adults", "at least one guest is required"));
        }
        let c = &self.contact;
        if c.full_name.trim().is_empty() {
            errors.push(FieldError::new("full_name", "required"));
        } else if c.full_name.len() > MAX_NAME_LEN {
            errors.push(FieldError::new("full_name", "too long"));
        }
        match c.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {
                if c.email.len() > MAX_CONTACT_FIELD_LEN {
                    errors.push(FieldError::new("email", "too long"));
                }
            }
            _ => errors.push(FieldError::new("email", "not a valid address")),
        }
        if c.phone.trim().is_empty() {
            errors.push(FieldError::new("phone", "required"));
        } else if c.phone.len() > MAX_CONTACT_FIELD_LEN {
            errors.push(FieldError::new("phone", "too long"));
        }
        if c.note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            errors.push(FieldError::new("note", "too long"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(errors))
        }
    }
}

/// How long a booking may sit in a pre-payment state. `None` disables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryWindows {
    pub guide_decision: Option<Ms>,
    pub payment: Option<Ms>,
}

impl ExpiryWindows {
    pub fn from_hours(guide_decision: u64, payment: u64) -> Self {
        let window = |h: u64| (h > 0).then(|| h as Ms * HOUR_MS);
        Self {
            guide_decision: window(guide_decision),
            payment: window(payment),
        }
    }

    pub fn deadline(&self, booking: &Booking) -> Option<Ms> {
        let window = match booking.status {
            BookingStatus::WaitingGuide => self.guide_decision?,
            BookingStatus::AwaitingPayment => self.payment?,
            _ => return None,
        };
        Some(booking.updated_at + window)
    }

    pub fn is_expired(&self, booking: &Booking, now: Ms) -> bool {
        self.deadline(booking).is_some_and(|d| d <= now)
    }
}

/// `ALREADY_PROCESSED` when the booking is terminal or already at `to`,
/// `INVALID_TRANSITION` otherwise.
fn transition_error(booking: &Booking, to: BookingStatus) -> EngineError {
    if booking.status.is_terminal() || booking.status == to {
        EngineError::AlreadyProcessed {
            id: booking.id,
            status: booking.status.as_str(),
        }
    } else {
        EngineError::InvalidTransition {
            id: booking.id,
            from: booking.status,
            to,
        }
    }
}

fn booking_in(state: &TourState, id: Ulid) -> Result<Booking, EngineError> {
    state.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
}

fn ensure_owner_or_admin(actor: &Actor, booking: &Booking) -> Result<(), EngineError> {
    if actor.is_admin() {
        return Ok(());
    }
    match (actor.customer_id(), booking.customer_id) {
        (Some(a), Some(b)) if a == b => Ok(()),
        _ => Err(EngineError::Forbidden("only the booking's customer or an admin may do this")),
    }
}

impl Engine {
    /// Admit a booking: rule evaluation, then capacity reservation and guide
    /// resolution under the tour lock and the candidate calendar locks.
    /// Any failure leaves no trace.
    pub async fn create_booking(&self, actor: &Actor, request: NewBooking) -> Result<Booking, EngineError> {
        let (tour_id, date) = (request.tour_id, request.start_date);
        match self.admit(actor, request).await {
            Ok(booking) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                info!(
                    booking_id = %booking.id,
                    %tour_id,
                    %date,
                    guests = booking.guest_count(),
                    guide_id = ?booking.guide_id,
                    "booking admitted"
                );
                Ok(booking)
            }
            Err(e) => {
                if e.is_internal() {
                    tracing::error!(%tour_id, %date, "booking failed: {e}");
                } else {
                    warn!(%tour_id, %date, code = e.code(), "booking rejected: {e}");
                }
                metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "code" => e.code())
                    .increment(1);
                Err(e)
            }
        }
    }

    async fn admit(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        req.validate()?;
        let slot = self
            .store
            .tour(&req.tour_id)
            .ok_or(EngineError::NotFound(req.tour_id))?;
        let tour = slot.tour.clone();
        rules::evaluate(&tour.definition.policy, req.start_date, today())?;

        let start_time = tour.definition.start_time();
        let span = Span::departure(req.start_date, start_time, tour.definition.duration_minutes);
        let candidates = guides::candidates(&tour, req.guide_id)?;

        let _gate = self.writes.read().await;
        let mut state = slot.state.write().await;
        if self.store.contains_booking(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if state.bookings.len() >= MAX_BOOKINGS_PER_TOUR {
            return Err(EngineError::LimitExceeded("too many bookings on tour"));
        }
        state.check_capacity(req.start_date, req.guest_count())?;
        let amount = tour
            .definition
            .amount_for(req.adults, req.children)
            .ok_or(EngineError::LimitExceeded("booking amount too large"))?;

        let mut calendars = self.store.lock_calendars(candidates).await;
        let guide_id = guides::resolve(&tour, req.guide_id, req.start_date, &span, &calendars)?;

        let now = now_ms();
        let booking = Booking {
            id: req.id,
            tour_id: tour.id,
            customer_id: actor.customer_id(),
            start_date: req.start_date,
            start_time,
            span,
            adults: req.adults,
            children: req.children,
            guide_id,
            contact: req.contact,
            status: BookingStatus::WaitingGuide,
            amount,
            payment_ref: None,
            refund: RefundState::NotRequired,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.wal_append(&event).await?;
        self.store.apply_booking(&mut state, &mut calendars, &event);
        drop(calendars);
        drop(state);

        let recipients: Vec<Ulid> = match guide_id {
            Some(g) => vec![g],
            None => tour.definition.guides.iter().map(|g| g.guide_id).collect(),
        };
        for recipient in recipients {
            self.notify.send(
                recipient,
                Notification::BookingRequested {
                    booking_id: booking.id,
                    tour_id: tour.id,
                    date: booking.start_date,
                    guests: booking.guest_count(),
                },
            );
        }
        Ok(booking)
    }

    async fn lock_booking(&self, booking_id: Ulid) -> Result<OwnedRwLockWriteGuard<TourState>, EngineError> {
        let tour_id = self
            .store
            .tour_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let slot = self.store.tour(&tour_id).ok_or(EngineError::NotFound(tour_id))?;
        Ok(slot.state.write_owned().await)
    }

    /// Persist a status change on a locked tour. Calendars the change
    /// touches must already be in `calendars`.
    async fn commit_transition(
        &self,
        state: &mut TourState,
        calendars: &mut CalendarGuards,
        booking_id: Ulid,
        to: BookingStatus,
        cause: TransitionCause,
    ) -> Result<Booking, EngineError> {
        let event = Event::BookingTransitioned {
            booking_id,
            tour_id: state.tour.id,
            to,
            cause,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        self.store.apply_booking(state, calendars, &event);
        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        booking_in(state, booking_id)
    }

    fn announce(&self, booking: &Booking) {
        let notification = Notification::BookingStatusChanged {
            booking_id: booking.id,
            status: booking.status,
        };
        if let Some(customer) = booking.customer_id {
            self.notify.send(customer, notification.clone());
        }
        if let Some(guide) = booking.guide_id {
            self.notify.send(guide, notification);
        }
    }

    /// Guide accepts or rejects a `waiting_guide` booking. An unassigned
    /// booking may be claimed by any guide on the tour, or by any guide at
    /// all when the tour has no guide list.
    pub async fn decide_booking(&self, actor: &Actor, booking_id: Ulid, accept: bool) -> Result<Booking, EngineError> {
        let guide_id = actor.require_guide()?;
        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        if booking.status != BookingStatus::WaitingGuide {
            return Err(EngineError::AlreadyProcessed {
                id: booking_id,
                status: booking.status.as_str(),
            });
        }
        match booking.guide_id {
            Some(assigned) if assigned != guide_id => {
                return Err(EngineError::Forbidden("booking is assigned to another guide"));
            }
            None if state.tour.definition.guides.is_empty() => {
                if !accept {
                    return Err(EngineError::Forbidden("only an assigned guide may reject"));
                }
            }
            None if state.tour.definition.guide(&guide_id).is_none() => {
                return Err(EngineError::Forbidden("guide does not lead this tour"));
            }
            _ => {}
        }

        let claiming = accept && booking.guide_id.is_none();
        let (to, cause, lock) = if accept {
            let lock = if claiming { Some(guide_id) } else { None };
            (BookingStatus::AwaitingPayment, TransitionCause::GuideAccepted { guide_id }, lock)
        } else {
            (BookingStatus::Canceled, TransitionCause::GuideRejected { guide_id }, booking.guide_id)
        };
        let mut calendars = self.store.lock_calendars(lock).await;
        if claiming && let Some(calendar) = calendars.get(&guide_id) {
            guides::check_guide(calendar, booking.tour_id, booking.start_date, &booking.span)?;
        }

        let updated = self
            .commit_transition(&mut state, &mut calendars, booking_id, to, cause)
            .await?;
        drop(calendars);
        drop(state);
        info!(%booking_id, %guide_id, accept, "guide decision recorded");
        self.announce(&updated);
        Ok(updated)
    }

    /// Admin assigns or reassigns the guide of a `waiting_guide` booking.
    /// Tours without a guide list accept any guide.
    pub async fn assign_guide(&self, actor: &Actor, booking_id: Ulid, guide_id: Ulid) -> Result<Booking, EngineError> {
        actor.require_admin()?;
        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        if booking.status != BookingStatus::WaitingGuide {
            return Err(EngineError::AlreadyProcessed {
                id: booking_id,
                status: booking.status.as_str(),
            });
        }
        let guides = &state.tour.definition.guides;
        if !guides.is_empty() && state.tour.definition.guide(&guide_id).is_none() {
            return Err(EngineError::InvalidGuide {
                guide_id,
                tour_id: state.tour.id,
            });
        }
        if booking.guide_id == Some(guide_id) {
            return Ok(booking);
        }

        let mut calendars = self
            .store
            .lock_calendars(booking.guide_id.into_iter().chain([guide_id]))
            .await;
        if let Some(calendar) = calendars.get(&guide_id) {
            guides::check_guide(calendar, booking.tour_id, booking.start_date, &booking.span)?;
        }
        let event = Event::GuideAssigned {
            booking_id,
            tour_id: state.tour.id,
            guide_id,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        self.store.apply_booking(&mut state, &mut calendars, &event);
        let updated = booking_in(&state, booking_id)?;
        drop(calendars);
        drop(state);

        info!(%booking_id, %guide_id, previous = ?booking.guide_id, "guide assigned");
        self.notify.send(
            guide_id,
            Notification::BookingRequested {
                booking_id,
                tour_id: updated.tour_id,
                date: updated.start_date,
                guests: updated.guest_count(),
            },
        );
        Ok(updated)
    }

    pub async fn confirm_payment(&self, actor: &Actor, booking_id: Ulid, reference: String) -> Result<Booking, EngineError> {
        actor.require_admin()?;
        let reference = reference.trim().to_string();
        if reference.is_empty() {
            return Err(EngineError::validation("reference", "required"));
        }
        if reference.len() > MAX_CONTACT_FIELD_LEN {
            return Err(EngineError::validation("reference", "too long"));
        }

        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        if !booking.status.can_transition_to(BookingStatus::Paid) {
            return Err(transition_error(&booking, BookingStatus::Paid));
        }
        let mut calendars = CalendarGuards::new();
        let updated = self
            .commit_transition(
                &mut state,
                &mut calendars,
                booking_id,
                BookingStatus::Paid,
                TransitionCause::PaymentConfirmed { reference },
            )
            .await?;
        drop(state);
        info!(%booking_id, amount = updated.amount, "payment confirmed");
        self.announce(&updated);
        Ok(updated)
    }

    pub async fn complete_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        actor.require_admin()?;
        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        if !booking.status.can_transition_to(BookingStatus::Completed) {
            return Err(transition_error(&booking, BookingStatus::Completed));
        }
        let mut calendars = CalendarGuards::new();
        let updated = self
            .commit_transition(
                &mut state,
                &mut calendars,
                booking_id,
                BookingStatus::Completed,
                TransitionCause::Completed,
            )
            .await?;
        drop(state);
        self.announce(&updated);
        Ok(updated)
    }

    /// Cancel on behalf of the customer or an admin. Status is re-read under
    /// the lock, so a paid booking is refunded at most once.
    pub async fn cancel_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_NOTE_LEN) {
            return Err(EngineError::validation("reason", "too long"));
        }
        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        ensure_owner_or_admin(actor, &booking)?;
        if !booking.status.can_transition_to(BookingStatus::Canceled) {
            return Err(transition_error(&booking, BookingStatus::Canceled));
        }

        let mut calendars = self.store.lock_calendars(booking.guide_id).await;
        let updated = self
            .commit_transition(
                &mut state,
                &mut calendars,
                booking_id,
                BookingStatus::Canceled,
                TransitionCause::Canceled { by: actor.id(), reason },
            )
            .await?;
        drop(calendars);
        drop(state);
        info!(%booking_id, refund = updated.refund.as_str(), "booking canceled");
        self.announce(&updated);
        Ok(updated)
    }

    /// Checkout session for an `awaiting_payment` booking. No lock is held
    /// while the gateway is called.
    pub async fn checkout(&self, actor: &Actor, booking_id: Ulid) -> Result<CheckoutSession, EngineError> {
        let booking = self.booking(booking_id).await?;
        ensure_owner_or_admin(actor, &booking)?;
        if booking.status != BookingStatus::AwaitingPayment {
            return Err(transition_error(&booking, BookingStatus::Paid));
        }
        let slot = self
            .store
            .tour(&booking.tour_id)
            .ok_or(EngineError::NotFound(booking.tour_id))?;
        let request = CheckoutRequest {
            booking_id,
            amount: booking.amount,
            description: format!("{} on {}", slot.tour.definition.name, booking.start_date),
            customer_email: booking.contact.email.clone(),
        };
        self.gateway
            .create_checkout(&request)
            .await
            .map_err(|e| EngineError::Gateway(e.to_string()))
    }

    // ── Background maintenance ───────────────────────────────

    /// Bookings whose decision or payment window has lapsed. Contended tours
    /// are skipped until the next pass.
    pub fn collect_expired_bookings(&self, windows: &ExpiryWindows, now: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for slot in self.store.tours() {
            if let Ok(state) = slot.state.try_read() {
                expired.extend(
                    state
                        .bookings
                        .values()
                        .filter(|b| windows.is_expired(b, now))
                        .map(|b| b.id),
                );
            }
        }
        expired
    }

    /// Cancel a booking whose window lapsed. Returns false when it was
    /// decided or paid in the meantime.
    pub async fn expire_booking(&self, booking_id: Ulid, windows: &ExpiryWindows, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        if !windows.is_expired(&booking, now) {
            return Ok(false);
        }
        let mut calendars = self.store.lock_calendars(booking.guide_id).await;
        let updated = self
            .commit_transition(
                &mut state,
                &mut calendars,
                booking_id,
                BookingStatus::Canceled,
                TransitionCause::Expired,
            )
            .await?;
        drop(calendars);
        drop(state);
        self.announce(&updated);
        Ok(true)
    }

    /// Paid bookings whose trip has ended.
    pub fn collect_finished_bookings(&self, now: Ms) -> Vec<Ulid> {
        let mut finished = Vec::new();
        for slot in self.store.tours() {
            if let Ok(state) = slot.state.try_read() {
                finished.extend(
                    state
                        .bookings
                        .values()
                        .filter(|b| b.status == BookingStatus::Paid && b.span.end <= now)
                        .map(|b| b.id),
                );
            }
        }
        finished
    }

    pub async fn auto_complete_booking(&self, booking_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        if booking.status != BookingStatus::Paid || booking.span.end > now {
            return Ok(false);
        }
        let mut calendars = CalendarGuards::new();
        let updated = self
            .commit_transition(
                &mut state,
                &mut calendars,
                booking_id,
                BookingStatus::Completed,
                TransitionCause::Completed,
            )
            .await?;
        drop(state);
        self.announce(&updated);
        Ok(true)
    }

    /// Canceled paid bookings still owed a refund.
    pub fn collect_pending_refunds(&self) -> Vec<Booking> {
        let mut pending = Vec::new();
        for slot in self.store.tours() {
            if let Ok(state) = slot.state.try_read() {
                pending.extend(
                    state
                        .bookings
                        .values()
                        .filter(|b| b.refund == RefundState::Pending)
                        .cloned(),
                );
            }
        }
        pending
    }

    /// Record that the gateway refunded a booking. Returns false if it was
    /// already recorded.
    pub async fn mark_refund_issued(&self, booking_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.writes.read().await;
        let mut state = self.lock_booking(booking_id).await?;
        let booking = booking_in(&state, booking_id)?;
        if booking.refund != RefundState::Pending {
            return Ok(false);
        }
        let event = Event::RefundIssued {
            booking_id,
            tour_id: state.tour.id,
            at: now_ms(),
        };
        self.wal_append(&event).await?;
        let mut calendars = CalendarGuards::new();
        self.store.apply_booking(&mut state, &mut calendars, &event);
        drop(state);

        info!(%booking_id, amount = booking.amount, "refund issued");
        if let Some(customer) = booking.customer_id {
            self.notify.send(
                customer,
                Notification::RefundIssued {
                    booking_id,
                    amount: booking.amount,
                },
            );
        }
        Ok(true)
    }

    /// Admin records a refund settled outside the gateway.
    pub async fn record_refund(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        actor.require_admin()?;
        let booking = self.booking(booking_id).await?;
        match booking.refund {
            RefundState::NotRequired => return Err(EngineError::validation("booking_id", "no refund pending")),
            RefundState::Issued => {
                return Err(EngineError::AlreadyProcessed {
                    id: booking_id,
                    status: RefundState::Issued.as_str(),
                });
            }
            RefundState::Pending => {}
        }
        if !self.mark_refund_issued(booking_id).await? {
            return Err(EngineError::AlreadyProcessed {
                id: booking_id,
                status: RefundState::Issued.as_str(),
            });
        }
        self.booking(booking_id).await
    }

    /// Ask the gateway to refund a canceled paid booking, then record it.
    /// A gateway failure leaves the refund pending for the next pass.
    pub async fn settle_refund(&self, booking: &Booking) -> Result<bool, EngineError> {
        self.gateway
            .refund(booking.id, booking.amount, booking.payment_ref.as_deref())
            .await
            .map_err(|e| EngineError::Gateway(e.to_string()))?;
        self.mark_refund_issued(booking.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(adults: u32, children: u32) -> NewBooking {
        NewBooking {
            id: Ulid::new(),
            tour_id: Ulid::new(),
            start_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            adults,
            children,
            guide_id: None,
            contact: Contact {
                full_name: "Ana Souza".into(),
                email: "ana@example.com".into(),
                phone: "+55 11 5555 0000".into(),
                note: None,
            },
        }
    }

    #[test]
    fn zero_guests_rejected() {
        match request(0, 0).validate() {
            Err(EngineError::Validation(fields)) => assert_eq!(fields[0].field, "adults"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn children_only_booking_is_valid() {
        assert!(request(0, 2).validate().is_ok());
    }

    #[test]
    fn contact_fields_checked_together() {
        let mut req = request(1, 0);
        req.contact.email = "nope".into();
        req.contact.phone = " ".into();
        match req.validate() {
            Err(EngineError::Validation(fields)) => {
                let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
                assert_eq!(names, vec!["email", "phone"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn guest_limit() {
        assert!(matches!(
            request(MAX_GUESTS_PER_BOOKING, 1).validate(),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn expiry_windows_by_status() {
        let windows = ExpiryWindows::from_hours(72, 0);
        let mut booking = Booking {
            id: Ulid::new(),
            tour_id: Ulid::new(),
            customer_id: None,
            start_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            start_time: chrono::NaiveTime::MIN,
            span: Span::new(0, 1),
            adults: 1,
            children: 0,
            guide_id: None,
            contact: request(1, 0).contact,
            status: BookingStatus::WaitingGuide,
            amount: 0,
            payment_ref: None,
            refund: RefundState::NotRequired,
            created_at: 0,
            updated_at: 1_000,
        };
        assert_eq!(windows.deadline(&booking), Some(1_000 + 72 * HOUR_MS));
        assert!(!windows.is_expired(&booking, 1_000 + 72 * HOUR_MS - 1));
        assert!(windows.is_expired(&booking, 1_000 + 72 * HOUR_MS));

        // payment window disabled
        booking.status = BookingStatus::AwaitingPayment;
        assert_eq!(windows.deadline(&booking), None);
        booking.status = BookingStatus::Paid;
        assert_eq!(windows.deadline(&booking), None);
    }

    #[test]
    fn transition_errors() {
        let mut booking = Booking {
            id: Ulid::new(),
            tour_id: Ulid::new(),
            customer_id: None,
            start_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            start_time: chrono::NaiveTime::MIN,
            span: Span::new(0, 1),
            adults: 1,
            children: 0,
            guide_id: None,
            contact: request(1, 0).contact,
            status: BookingStatus::WaitingGuide,
            amount: 0,
            payment_ref: None,
            refund: RefundState::NotRequired,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(transition_error(&booking, BookingStatus::Paid).code(), "INVALID_TRANSITION");
        booking.status = BookingStatus::Paid;
        assert_eq!(transition_error(&booking, BookingStatus::Paid).code(), "ALREADY_PROCESSED");
        booking.status = BookingStatus::Canceled;
        assert_eq!(transition_error(&booking, BookingStatus::Completed).code(), "ALREADY_PROCESSED");
    }
}
