//! Hard limits enforced on every write path.

pub const MAX_TOURS: usize = 100_000;
pub const MAX_PROPOSALS: usize = 100_000;
pub const MAX_BOOKINGS_PER_TOUR: usize = 500_000;
pub const MAX_MARKERS_PER_GUIDE: usize = 10_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 10_000;
pub const MAX_CONTACT_FIELD_LEN: usize = 320;
pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_SLUG_LEN: usize = 120;

pub const MAX_GUIDES_PER_TOUR: usize = 32;
pub const MAX_LOCATIONS_PER_TOUR: usize = 200;
pub const MAX_ITINERARY_ITEMS: usize = 200;
pub const MAX_BLACKOUT_DATES: usize = 1_000;
pub const MAX_DEPARTURE_DATES: usize = 1_000;

pub const MAX_GUESTS_PER_BOOKING: u32 = 1_000;
/// Per guest, in minor currency units.
pub const MAX_PRICE: u64 = 10_000_000_000;
pub const MAX_DAYS_ADVANCE: u32 = 3_650;
pub const MAX_TOUR_DURATION_MINUTES: u32 = 60 * 24 * 60;
pub const MAX_MARKER_DAYS: i64 = 366;

pub const MAX_PROPOSAL_BODY_BYTES: usize = 256 * 1024;
pub const MAX_QUERY_ROWS: usize = 10_000;
