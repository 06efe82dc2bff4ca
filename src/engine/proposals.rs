use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::error::FieldError;
use super::store::apply_proposal;
use super::{now_ms, Engine, EngineError};

fn default_true() -> bool {
    true
}

fn default_max_days_advance() -> u32 {
    365
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DraftGuide {
    pub guide_id: Ulid,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub revenue_share: u8,
}

/// The JSON body of a proposal submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProposalDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category_id: Option<Ulid>,
    #[serde(default)]
    pub location_ids: Vec<Ulid>,
    #[serde(default)]
    pub itinerary: Vec<ItineraryItem>,
    pub duration_minutes: u32,
    pub price: u64,
    /// Defaults to the adult price.
    #[serde(default)]
    pub child_price: Option<u64>,
    pub max_guests: u32,
    #[serde(default)]
    pub per_date_capacity: Option<u32>,
    #[serde(default = "default_true")]
    pub allow_custom_date: bool,
    #[serde(default)]
    pub departure_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub fixed_departure_time: Option<NaiveTime>,
    #[serde(default)]
    pub min_days_before_start: u32,
    #[serde(default = "default_max_days_advance")]
    pub max_days_advance: u32,
    #[serde(default)]
    pub closed_weekdays: Vec<Weekday>,
    #[serde(default)]
    pub blackout_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub guides: Vec<DraftGuide>,
    #[serde(default)]
    pub resubmission_of: Option<Ulid>,
}

impl ProposalDraft {
    /// Decode a submitted JSON body. Oversized or malformed bodies fail
    /// validation on the `body` field.
    pub fn from_json(body: &str) -> Result<Self, EngineError> {
        if body.len() > MAX_PROPOSAL_BODY_BYTES {
            return Err(EngineError::LimitExceeded("proposal body too large"));
        }
        serde_json::from_str(body).map_err(|e| EngineError::validation("body", e.to_string()))
    }

    /// Field-level validation plus catalog lookups. An empty guide list is
    /// kept; such tours book unassigned.
    pub fn into_definition(self, catalog: &Catalog) -> Result<TourDefinition, EngineError> {
        let mut errors = Vec::new();
        let mut fail = |field: &str, message: &str| errors.push(FieldError::new(field, message));

        let name = self.name.trim().to_string();
        if name.is_empty() {
            fail("name", "required");
        } else if name.len() > MAX_NAME_LEN {
            fail("name", "too long");
        }
        if self.description.len() > MAX_TEXT_LEN {
            fail("description", "too long");
        }
        if self.duration_minutes == 0 {
            fail("duration_minutes", "must be positive");
        } else if self.duration_minutes > MAX_TOUR_DURATION_MINUTES {
            fail("duration_minutes", "too long");
        }
        if self.price > MAX_PRICE {
            fail("price", "too large");
        }
        if self.child_price.is_some_and(|p| p > MAX_PRICE) {
            fail("child_price", "too large");
        }
        if self.max_guests == 0 {
            fail("max_guests", "must be positive");
        }
        if self.per_date_capacity == Some(0) {
            fail("per_date_capacity", "must be positive when set");
        }
        if self.max_days_advance > MAX_DAYS_ADVANCE {
            fail("max_days_advance", "too far");
        }
        if self.min_days_before_start > self.max_days_advance {
            fail("min_days_before_start", "must not exceed max_days_advance");
        }
        if !self.allow_custom_date && self.departure_dates.is_empty() {
            fail("departure_dates", "required when custom dates are not allowed");
        }
        if self.departure_dates.len() > MAX_DEPARTURE_DATES {
            fail("departure_dates", "too many");
        }
        if self.blackout_dates.len() > MAX_BLACKOUT_DATES {
            fail("blackout_dates", "too many");
        }

        if self.location_ids.len() > MAX_LOCATIONS_PER_TOUR {
            fail("location_ids", "too many");
        }
        let mut seen = HashSet::new();
        if !self.location_ids.iter().all(|id| seen.insert(*id)) {
            fail("location_ids", "duplicate location");
        }

        if self.itinerary.len() > MAX_ITINERARY_ITEMS {
            fail("itinerary", "too many items");
        }
        if self.itinerary.iter().any(|item| item.title.trim().is_empty()) {
            fail("itinerary", "every item needs a title");
        }
        if self
            .itinerary
            .iter()
            .any(|item| item.title.len() > MAX_NAME_LEN || item.description.as_ref().is_some_and(|d| d.len() > MAX_TEXT_LEN))
        {
            fail("itinerary", "item too long");
        }

        if self.guides.len() > MAX_GUIDES_PER_TOUR {
            fail("guides", "too many");
        }
        if self.guides.iter().filter(|g| g.is_main).count() > 1 {
            fail("guides", "at most one main guide");
        }
        if self.guides.iter().any(|g| g.revenue_share > 100) {
            fail("guides", "revenue share must be 0..=100");
        }
        let total_share: u32 = self.guides.iter().map(|g| g.revenue_share as u32).sum();
        if total_share > 100 {
            fail("guides", "revenue shares exceed 100");
        }
        let mut seen = HashSet::new();
        if !self.guides.iter().all(|g| seen.insert(g.guide_id)) {
            fail("guides", "duplicate guide");
        }

        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        if let Some(category_id) = self.category_id
            && !catalog.categories.contains_key(&category_id)
        {
            return Err(EngineError::InvalidCategory(category_id));
        }
        let missing = missing_locations(&self.location_ids, catalog);
        if !missing.is_empty() {
            return Err(EngineError::InvalidLocations(missing));
        }

        let guides = self
            .guides
            .into_iter()
            .map(|g| TourGuide {
                guide_id: g.guide_id,
                is_main: g.is_main,
                revenue_share: g.revenue_share,
            })
            .collect();

        Ok(TourDefinition {
            name,
            description: self.description,
            category_id: self.category_id,
            location_ids: self.location_ids,
            itinerary: self.itinerary,
            duration_minutes: self.duration_minutes,
            price: self.price,
            child_price: self.child_price.unwrap_or(self.price),
            max_guests: self.max_guests,
            per_date_capacity: self.per_date_capacity,
            policy: SchedulingPolicy {
                allow_custom_date: self.allow_custom_date,
                departure_dates: self.departure_dates.into_iter().collect(),
                fixed_departure_time: self.fixed_departure_time,
                min_days_before_start: self.min_days_before_start,
                max_days_advance: self.max_days_advance,
                closed_weekdays: self.closed_weekdays.into_iter().collect(),
                blackout_dates: self.blackout_dates.into_iter().collect::<BTreeSet<_>>(),
            },
            guides,
        })
    }
}

/// Referenced locations absent from the catalog, in reference order.
fn missing_locations(location_ids: &[Ulid], catalog: &Catalog) -> Vec<Ulid> {
    location_ids
        .iter()
        .filter(|id| !catalog.locations.contains_key(id))
        .copied()
        .collect()
}

/// Lowercase ASCII slug: alphanumerics kept, everything else collapsed to
/// single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "tour".to_string()
    } else {
        slug.to_string()
    }
}

/// `base`, or `base-2`, `base-3`, … whichever is free first.
fn unique_slug(name: &str, taken: &HashMap<String, Ulid>) -> String {
    let base = slugify(name);
    if !taken.contains_key(&base) {
        return base;
    }
    (2u64..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !taken.contains_key(candidate))
        .unwrap_or(base)
}

fn check_notes(notes: &Option<String>) -> Result<(), EngineError> {
    if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::validation("notes", "too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn submit_proposal(&self, actor: &Actor, id: Ulid, draft: ProposalDraft) -> Result<Proposal, EngineError> {
        let author = actor.require_guide()?;

        if let Some(previous) = draft.resubmission_of {
            let shared = self.store.proposal(&previous).ok_or(EngineError::NotFound(previous))?;
            let previous = shared.read().await;
            if previous.author_id != author || previous.status != ProposalStatus::Rejected {
                return Err(EngineError::validation(
                    "resubmission_of",
                    "must reference one of your rejected proposals",
                ));
            }
        }

        let _gate = self.writes.read().await;
        // Exclusive catalog access also serializes proposal id allocation.
        let catalog = self.store.catalog.write().await;
        if self.store.contains_proposal(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.proposal_count() >= MAX_PROPOSALS {
            return Err(EngineError::LimitExceeded("too many proposals"));
        }
        let resubmission_of = draft.resubmission_of;
        let definition = draft.into_definition(&catalog)?;

        let proposal = Proposal {
            id,
            author_id: author,
            definition,
            status: ProposalStatus::Pending,
            resubmission_of,
            submitted_at: now_ms(),
            review: None,
        };
        let event = Event::ProposalSubmitted { proposal: proposal.clone() };
        self.wal_append(&event).await?;
        self.store.insert_proposal(proposal.clone());
        drop(catalog);

        info!(proposal_id = %id, %author, name = %proposal.definition.name, "proposal submitted");
        Ok(proposal)
    }

    /// Promote a pending proposal into a bookable tour. The approval and the
    /// tour are one WAL record; on any failure the proposal stays pending.
    pub async fn approve_proposal(&self, actor: &Actor, proposal_id: Ulid, notes: Option<String>) -> Result<Tour, EngineError> {
        let reviewer_id = actor.require_admin()?;
        check_notes(&notes)?;

        let _gate = self.writes.read().await;
        let shared = self
            .store
            .proposal(&proposal_id)
            .ok_or(EngineError::NotFound(proposal_id))?;
        let mut proposal = shared.write().await;
        if proposal.status != ProposalStatus::Pending {
            return Err(EngineError::AlreadyProcessed {
                id: proposal_id,
                status: proposal.status.as_str(),
            });
        }

        let catalog = self.store.catalog.read().await;
        let missing = missing_locations(&proposal.definition.location_ids, &catalog);
        if !missing.is_empty() {
            return Err(EngineError::InvalidLocations(missing));
        }
        if let Some(category_id) = proposal.definition.category_id
            && !catalog.categories.contains_key(&category_id)
        {
            return Err(EngineError::InvalidCategory(category_id));
        }

        let mut slugs = self.store.slugs.write().await;
        if self.store.tour_count() >= MAX_TOURS {
            return Err(EngineError::LimitExceeded("too many tours"));
        }
        let now = now_ms();
        let tour = Tour {
            id: Ulid::new(),
            slug: unique_slug(&proposal.definition.name, &slugs),
            definition: proposal.definition.clone(),
            proposal_id: Some(proposal_id),
            created_at: now,
        };
        let review = Review {
            reviewer_id,
            reviewed_at: now,
            notes: notes.clone(),
            tour_id: Some(tour.id),
        };
        let event = Event::ProposalApproved {
            proposal_id,
            review,
            tour: tour.clone(),
        };
        self.wal_append(&event).await?;
        apply_proposal(&mut proposal, &event);
        self.store.publish_tour(tour.clone(), &mut slugs);
        let author = proposal.author_id;
        drop(slugs);
        drop(catalog);
        drop(proposal);

        metrics::counter!(observability::PROPOSALS_RESOLVED_TOTAL, "outcome" => "approved").increment(1);
        info!(%proposal_id, tour_id = %tour.id, slug = %tour.slug, "proposal approved");
        self.notify.send(
            author,
            Notification::ProposalResolved {
                proposal_id,
                status: ProposalStatus::Approved,
                tour_id: Some(tour.id),
                notes,
            },
        );
        Ok(tour)
    }

    pub async fn reject_proposal(&self, actor: &Actor, proposal_id: Ulid, notes: Option<String>) -> Result<Proposal, EngineError> {
        let reviewer_id = actor.require_admin()?;
        check_notes(&notes)?;

        let _gate = self.writes.read().await;
        let shared = self
            .store
            .proposal(&proposal_id)
            .ok_or(EngineError::NotFound(proposal_id))?;
        let mut proposal = shared.write().await;
        if proposal.status != ProposalStatus::Pending {
            return Err(EngineError::AlreadyProcessed {
                id: proposal_id,
                status: proposal.status.as_str(),
            });
        }
        let event = Event::ProposalRejected {
            proposal_id,
            review: Review {
                reviewer_id,
                reviewed_at: now_ms(),
                notes: notes.clone(),
                tour_id: None,
            },
        };
        self.wal_append(&event).await?;
        apply_proposal(&mut proposal, &event);
        let resolved = proposal.clone();
        drop(proposal);

        metrics::counter!(observability::PROPOSALS_RESOLVED_TOTAL, "outcome" => "rejected").increment(1);
        info!(%proposal_id, "proposal rejected");
        self.notify.send(
            resolved.author_id,
            Notification::ProposalResolved {
                proposal_id,
                status: ProposalStatus::Rejected,
                tour_id: None,
                notes,
            },
        );
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_json(extra: &str) -> String {
        format!(r#"{{"name": "Old Town Walk", "duration_minutes": 120, "price": 2500, "max_guests": 12{extra}}}"#)
    }

    #[test]
    fn minimal_draft_defaults() {
        let draft: ProposalDraft = serde_json::from_str(&draft_json("")).unwrap();
        let def = draft.into_definition(&Catalog::default()).unwrap();
        assert!(def.policy.allow_custom_date);
        assert_eq!(def.policy.max_days_advance, 365);
        assert_eq!(def.child_price, 2500);
        assert!(def.guides.is_empty());
    }

    #[test]
    fn prices_are_bounded() {
        let json = format!(
            r#"{{"name": "Gold Walk", "duration_minutes": 60, "price": {}, "child_price": {}, "max_guests": 4}}"#,
            MAX_PRICE + 1,
            u64::MAX
        );
        let draft: ProposalDraft = serde_json::from_str(&json).unwrap();
        match draft.into_definition(&Catalog::default()) {
            Err(EngineError::Validation(fields)) => {
                let names: BTreeSet<_> = fields.iter().map(|f| f.field.as_str()).collect();
                assert_eq!(names, BTreeSet::from(["price", "child_price"]));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn weekdays_and_dates_parse() {
        let draft: ProposalDraft = serde_json::from_str(&draft_json(
            r#", "closed_weekdays": ["Mon", "Sun"], "blackout_dates": ["2030-12-25"], "fixed_departure_time": "09:30:00""#,
        ))
        .unwrap();
        let def = draft.into_definition(&Catalog::default()).unwrap();
        assert!(def.policy.closed_weekdays.contains(Weekday::Mon));
        assert!(def.policy.blackout_dates.contains(&NaiveDate::from_ymd_opt(2030, 12, 25).unwrap()));
        assert_eq!(def.start_time(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_json::from_str::<ProposalDraft>(&draft_json(r#", "colour": "red""#)).is_err());
    }

    #[test]
    fn from_json_reports_body_field() {
        assert!(ProposalDraft::from_json(&draft_json("")).is_ok());
        match ProposalDraft::from_json("{not json") {
            Err(EngineError::Validation(fields)) => assert_eq!(fields[0].field, "body"),
            other => panic!("expected validation error, got {other:?}"),
        }
        let huge = format!(r#"{{"name": "{}"}}"#, "x".repeat(MAX_PROPOSAL_BODY_BYTES));
        assert!(matches!(ProposalDraft::from_json(&huge), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn collects_every_field_error() {
        let g = Ulid::new();
        let json = format!(
            r#"{{"name": " ", "duration_minutes": 0, "price": 1, "max_guests": 0,
                "min_days_before_start": 10, "max_days_advance": 5,
                "allow_custom_date": false,
                "guides": [{{"guide_id": "{g}", "is_main": true, "revenue_share": 60}},
                           {{"guide_id": "{g}", "is_main": true, "revenue_share": 60}}]}}"#
        );
        let draft: ProposalDraft = serde_json::from_str(&json).unwrap();
        match draft.into_definition(&Catalog::default()) {
            Err(EngineError::Validation(fields)) => {
                let names: BTreeSet<_> = fields.iter().map(|f| f.field.as_str()).collect();
                for expected in [
                    "name",
                    "duration_minutes",
                    "max_guests",
                    "min_days_before_start",
                    "departure_dates",
                    "guides",
                ] {
                    assert!(names.contains(expected), "missing {expected} in {names:?}");
                }
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn catalog_references_checked() {
        let known = Ulid::new();
        let unknown = Ulid::new();
        let mut catalog = Catalog::default();
        catalog.locations.insert(known, "Harbour".into());
        let draft: ProposalDraft = serde_json::from_str(&draft_json(&format!(
            r#", "location_ids": ["{known}", "{unknown}"]"#
        )))
        .unwrap();
        match draft.into_definition(&catalog) {
            Err(EngineError::InvalidLocations(missing)) => assert_eq!(missing, vec![unknown]),
            other => panic!("expected InvalidLocations, got {other:?}"),
        }

        let category = Ulid::new();
        let draft: ProposalDraft =
            serde_json::from_str(&draft_json(&format!(r#", "category_id": "{category}""#))).unwrap();
        assert!(matches!(
            draft.into_definition(&catalog),
            Err(EngineError::InvalidCategory(c)) if c == category
        ));
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify("Old Town Walk"), "old-town-walk");
        assert_eq!(slugify("  Sunset -- Kayak!! "), "sunset-kayak");
        assert_eq!(slugify("!!!"), "tour");
    }

    #[test]
    fn slug_collisions_get_suffixes() {
        let mut taken = HashMap::new();
        assert_eq!(unique_slug("Old Town", &taken), "old-town");
        taken.insert("old-town".to_string(), Ulid::new());
        assert_eq!(unique_slug("Old Town", &taken), "old-town-2");
        taken.insert("old-town-2".to_string(), Ulid::new());
        assert_eq!(unique_slug("old town", &taken), "old-town-3");
    }
}
