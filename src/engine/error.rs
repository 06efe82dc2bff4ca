use chrono::{NaiveDate, Weekday};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

/// Why the rule evaluator refused a date.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateRejection {
    #[error("{date} is in the past")]
    InPast { date: NaiveDate },
    #[error("{date} is too soon; earliest bookable date is {earliest}")]
    LeadTimeTooShort { date: NaiveDate, earliest: NaiveDate },
    #[error("{date} is too far ahead; latest bookable date is {latest}")]
    TooFarAhead { date: NaiveDate, latest: NaiveDate },
    #[error("tour does not run on {weekday}")]
    ClosedWeekday { date: NaiveDate, weekday: Weekday },
    #[error("{date} is a blackout date")]
    BlackoutDate { date: NaiveDate },
    #[error("tour has no departure on {date}")]
    NotOffered { date: NaiveDate },
}

impl DateRejection {
    pub fn code(&self) -> &'static str {
        match self {
            DateRejection::InPast { .. } => "DATE_IN_PAST",
            DateRejection::LeadTimeTooShort { .. } => "LEAD_TIME_TOO_SHORT",
            DateRejection::TooFarAhead { .. } => "TOO_FAR_AHEAD",
            DateRejection::ClosedWeekday { .. } => "CLOSED_WEEKDAY",
            DateRejection::BlackoutDate { .. } => "BLACKOUT_DATE",
            DateRejection::NotOffered { .. } => "DATE_NOT_OFFERED",
        }
    }

    fn meta(&self) -> Value {
        match self {
            DateRejection::InPast { date }
            | DateRejection::BlackoutDate { date }
            | DateRejection::NotOffered { date } => json!({ "date": date }),
            DateRejection::LeadTimeTooShort { date, earliest } => {
                json!({ "date": date, "earliest": earliest })
            }
            DateRejection::TooFarAhead { date, latest } => json!({ "date": date, "latest": latest }),
            DateRejection::ClosedWeekday { date, weekday } => {
                json!({ "date": date, "weekday": weekday.to_string() })
            }
        }
    }
}

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not enough slots: requested {requested}, remaining {remaining}")]
    InsufficientSlots { remaining: u32, requested: u32 },
    #[error("guide {0} is marked busy on the requested date")]
    GuideMarkedBusy(Ulid),
    #[error("guide {guide_id} already has booking {booking_id} at that time")]
    GuideHasBooking { guide_id: Ulid, booking_id: Ulid },
    #[error("no guide on this tour is available on the requested date")]
    AllGuidesBusy,
    #[error("guide {guide_id} does not lead tour {tour_id}")]
    InvalidGuide { guide_id: Ulid, tour_id: Ulid },
    #[error(transparent)]
    DateRejected(#[from] DateRejection),
    #[error("referenced locations no longer exist: {0:?}")]
    InvalidLocations(Vec<Ulid>),
    #[error("category {0} does not exist")]
    InvalidCategory(Ulid),
    #[error("{id} was already processed (status {status})")]
    AlreadyProcessed { id: Ulid, status: &'static str },
    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("invalid input: {}", summarize(.0))]
    Validation(Vec<FieldError>),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("payment gateway error: {0}")]
    Gateway(String),
}

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation(vec![FieldError::new(field, message)])
    }

    /// Stable, client-actionable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InsufficientSlots { .. } => "INSUFFICIENT_SLOTS",
            EngineError::GuideMarkedBusy(_) => "GUIDE_MARKED_BUSY",
            EngineError::GuideHasBooking { .. } => "GUIDE_HAS_BOOKING",
            EngineError::AllGuidesBusy => "ALL_GUIDES_BUSY",
            EngineError::InvalidGuide { .. } => "INVALID_GUIDE",
            EngineError::DateRejected(r) => r.code(),
            EngineError::InvalidLocations(_) => "INVALID_LOCATIONS",
            EngineError::InvalidCategory(_) => "INVALID_CATEGORY",
            EngineError::AlreadyProcessed { .. } => "ALREADY_PROCESSED",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::Validation(_) => "VALIDATION_FAILED",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) | EngineError::Gateway(_) => "INTERNAL",
        }
    }

    /// Storage or collaborator failures; never shown verbatim to clients.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::WalError(_) | EngineError::Gateway(_))
    }

    pub fn meta(&self) -> Option<Value> {
        match self {
            EngineError::InsufficientSlots { remaining, requested } => {
                Some(json!({ "remaining": remaining, "requested": requested }))
            }
            EngineError::GuideMarkedBusy(guide_id) => Some(json!({ "guide_id": guide_id })),
            EngineError::GuideHasBooking { guide_id, booking_id } => {
                Some(json!({ "guide_id": guide_id, "booking_id": booking_id }))
            }
            EngineError::InvalidGuide { guide_id, tour_id } => {
                Some(json!({ "guide_id": guide_id, "tour_id": tour_id }))
            }
            EngineError::DateRejected(r) => Some(r.meta()),
            EngineError::InvalidLocations(missing) => Some(json!({ "missing": missing })),
            EngineError::InvalidCategory(id) => Some(json!({ "category_id": id })),
            EngineError::AlreadyProcessed { id, status } => {
                Some(json!({ "id": id, "status": status }))
            }
            EngineError::InvalidTransition { id, from, to } => {
                Some(json!({ "id": id, "from": from.as_str(), "to": to.as_str() }))
            }
            EngineError::NotFound(id) | EngineError::AlreadyExists(id) => Some(json!({ "id": id })),
            EngineError::Validation(fields) => Some(json!({ "fields": fields })),
            _ => None,
        }
    }

    /// Client-facing body. Internal errors are reduced to an opaque message.
    pub fn body(&self) -> ErrorBody {
        if self.is_internal() {
            return ErrorBody {
                code: self.code(),
                message: "internal server error".into(),
                meta: None,
            };
        }
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            meta: self.meta(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub meta: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_slots_carries_meta() {
        let err = EngineError::InsufficientSlots { remaining: 0, requested: 1 };
        assert_eq!(err.code(), "INSUFFICIENT_SLOTS");
        assert_eq!(err.meta(), Some(json!({ "remaining": 0, "requested": 1 })));
    }

    #[test]
    fn date_rejection_code_passes_through() {
        let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let err: EngineError = DateRejection::ClosedWeekday { date, weekday: Weekday::Mon }.into();
        assert_eq!(err.code(), "CLOSED_WEEKDAY");
        assert_eq!(err.meta().unwrap()["weekday"], "Mon");
    }

    #[test]
    fn internal_errors_are_opaque() {
        let body = EngineError::WalError("disk full at /var/lib".into()).body();
        assert_eq!(body.message, "internal server error");
        assert!(body.meta.is_none());
    }

    #[test]
    fn validation_lists_fields() {
        let err = EngineError::Validation(vec![
            FieldError::new("adults", "must be positive"),
            FieldError::new("email", "required"),
        ]);
        assert_eq!(err.to_string(), "invalid input: adults: must be positive; email: required");
        assert_eq!(err.meta().unwrap()["fields"][1]["field"], "email");
    }
}
