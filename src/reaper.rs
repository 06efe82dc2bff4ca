use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine, ExpiryWindows};
use crate::model::Ms;
use crate::observability::REAPER_ACTIONS_TOTAL;

/// What one sweep did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub expired: usize,
    pub completed: usize,
    pub refunded: usize,
}

/// One maintenance pass: cancel bookings whose decision or payment window
/// lapsed, complete paid bookings whose trip ended, then push pending
/// refunds through the gateway.
pub async fn sweep(engine: &Engine, windows: &ExpiryWindows, now: Ms) -> Sweep {
    let mut done = Sweep::default();

    for booking_id in engine.collect_expired_bookings(windows, now) {
        match engine.expire_booking(booking_id, windows, now).await {
            Ok(true) => {
                info!(%booking_id, "expired booking canceled");
                metrics::counter!(REAPER_ACTIONS_TOTAL, "task" => "expire").increment(1);
                done.expired += 1;
            }
            Ok(false) => debug!(%booking_id, "expiry skipped, booking moved on"),
            Err(e) => debug!(%booking_id, "expiry skip: {e}"),
        }
    }

    for booking_id in engine.collect_finished_bookings(now) {
        match engine.auto_complete_booking(booking_id, now).await {
            Ok(true) => {
                info!(%booking_id, "finished booking completed");
                metrics::counter!(REAPER_ACTIONS_TOTAL, "task" => "complete").increment(1);
                done.completed += 1;
            }
            Ok(false) => debug!(%booking_id, "completion skipped"),
            Err(e) => debug!(%booking_id, "completion skip: {e}"),
        }
    }

    for booking in engine.collect_pending_refunds() {
        match engine.settle_refund(&booking).await {
            Ok(true) => {
                metrics::counter!(REAPER_ACTIONS_TOTAL, "task" => "refund").increment(1);
                done.refunded += 1;
            }
            Ok(false) => debug!(booking_id = %booking.id, "refund already recorded"),
            Err(e) => warn!(booking_id = %booking.id, "refund retry pending: {e}"),
        }
    }

    engine.notify.prune();
    done
}

/// Background task that sweeps on a fixed interval.
pub async fn run_reaper(engine: Arc<Engine>, windows: ExpiryWindows, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let done = sweep(&engine, &windows, now_ms()).await;
        if done != Sweep::default() {
            debug!(?done, "reaper pass");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!(appends, "WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Actor;
    use crate::engine::{NewBooking, ProposalDraft};
    use crate::gateway::{CheckoutRequest, CheckoutSession, GatewayError, HostedCheckout, PaymentGateway};
    use async_trait::async_trait;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::Days;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tourdesk_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Hosted checkout links, refunds accepted straight away.
    struct InstantRefunds(HostedCheckout);

    #[async_trait]
    impl PaymentGateway for InstantRefunds {
        async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError> {
            self.0.create_checkout(request).await
        }

        async fn refund(&self, _booking_id: Ulid, _amount: u64, _payment_ref: Option<&str>) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn engine(name: &str) -> Engine {
        Engine::new(
            test_wal_path(name),
            Arc::new(NotifyHub::new()),
            Arc::new(InstantRefunds(HostedCheckout::new("https://pay.test"))),
        )
        .unwrap()
    }

    async fn tour(engine: &Engine, guide: &Actor, admin: &Actor) -> Tour {
        let draft = ProposalDraft::from_json(
            &format!(
                r#"{{"name": "Night Market", "duration_minutes": 90, "price": 1500, "max_guests": 8,
                    "guides": [{{"guide_id": "{}", "is_main": true}}]}}"#,
                guide.id().unwrap()
            ),
        )
        .unwrap();
        let id = Ulid::new();
        engine.submit_proposal(guide, id, draft).await.unwrap();
        engine.approve_proposal(admin, id, None).await.unwrap()
    }

    fn request(tour_id: Ulid, days: u64) -> NewBooking {
        NewBooking {
            id: Ulid::new(),
            tour_id,
            start_date: crate::engine::today().checked_add_days(Days::new(days)).unwrap(),
            adults: 2,
            children: 0,
            guide_id: None,
            contact: Contact {
                full_name: "Lea Gast".into(),
                email: "lea@example.com".into(),
                phone: "+49 30 1234".into(),
                note: None,
            },
        }
    }

    #[tokio::test]
    async fn sweep_expires_undecided_bookings() {
        let engine = engine("sweep_expire.wal");
        let guide = Actor::Guide(Ulid::new());
        let admin = Actor::Admin(Ulid::new());
        let tour = tour(&engine, &guide, &admin).await;
        let tourist = Actor::Tourist(Some(Ulid::new()));
        let booking = engine.create_booking(&tourist, request(tour.id, 3)).await.unwrap();

        let windows = ExpiryWindows::from_hours(1, 1);
        let early = sweep(&engine, &windows, booking.updated_at).await;
        assert_eq!(early, Sweep::default());

        let late = booking.updated_at + 2 * 3_600_000;
        let done = sweep(&engine, &windows, late).await;
        assert_eq!(done.expired, 1);
        assert_eq!(engine.booking(booking.id).await.unwrap().status, BookingStatus::Canceled);
        assert_eq!(engine.capacity(tour.id, booking.start_date).await.unwrap().consumed, 0);
    }

    #[tokio::test]
    async fn sweep_completes_and_refunds() {
        let engine = engine("sweep_complete.wal");
        let guide = Actor::Guide(Ulid::new());
        let admin = Actor::Admin(Ulid::new());
        let tour = tour(&engine, &guide, &admin).await;
        let tourist = Actor::Tourist(Some(Ulid::new()));

        let mut paid = Vec::new();
        for days in [2, 4] {
            let booking = engine.create_booking(&tourist, request(tour.id, days)).await.unwrap();
            engine.decide_booking(&guide, booking.id, true).await.unwrap();
            engine.confirm_payment(&admin, booking.id, "pi_1".into()).await.unwrap();
            paid.push(booking);
        }
        engine.cancel_booking(&tourist, paid[1].id, None).await.unwrap();

        let windows = ExpiryWindows::default();
        let done = sweep(&engine, &windows, paid[0].span.end).await;
        assert_eq!(done, Sweep { expired: 0, completed: 1, refunded: 1 });
        assert_eq!(engine.booking(paid[0].id).await.unwrap().status, BookingStatus::Completed);
        assert_eq!(engine.booking(paid[1].id).await.unwrap().refund, RefundState::Issued);

        assert_eq!(sweep(&engine, &windows, paid[0].span.end).await, Sweep::default());
    }

    #[tokio::test]
    async fn compaction_resets_append_count() {
        let engine = engine("compactor.wal");
        tour(&engine, &Actor::Guide(Ulid::new()), &Actor::Admin(Ulid::new())).await;
        assert!(engine.wal_appends_since_compact().await >= 2);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
