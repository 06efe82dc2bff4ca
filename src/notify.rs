use chrono::NaiveDate;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingStatus, ProposalStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Something a user should hear about. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Sent to the assigned guide, or to every tour guide when unassigned.
    BookingRequested {
        booking_id: Ulid,
        tour_id: Ulid,
        date: NaiveDate,
        guests: u32,
    },
    BookingStatusChanged {
        booking_id: Ulid,
        status: BookingStatus,
    },
    ProposalResolved {
        proposal_id: Ulid,
        status: ProposalStatus,
        tour_id: Option<Ulid>,
        notes: Option<String>,
    },
    RefundIssued {
        booking_id: Ulid,
        amount: u64,
    },
}

impl Notification {
    /// JSON payload delivered on the LISTEN channel.
    pub fn payload(&self) -> String {
        let value = match self {
            Notification::BookingRequested { booking_id, tour_id, date, guests } => json!({
                "type": "booking_requested",
                "booking_id": booking_id.to_string(),
                "tour_id": tour_id.to_string(),
                "date": date.to_string(),
                "guests": guests,
            }),
            Notification::BookingStatusChanged { booking_id, status } => json!({
                "type": "booking_status_changed",
                "booking_id": booking_id.to_string(),
                "status": status.as_str(),
            }),
            Notification::ProposalResolved { proposal_id, status, tour_id, notes } => json!({
                "type": "proposal_resolved",
                "proposal_id": proposal_id.to_string(),
                "status": status.as_str(),
                "tour_id": tour_id.map(|id| id.to_string()),
                "notes": notes,
            }),
            Notification::RefundIssued { booking_id, amount } => json!({
                "type": "refund_issued",
                "booking_id": booking_id.to_string(),
                "amount": amount,
            }),
        };
        value.to_string()
    }
}

/// Broadcast hub keyed by recipient user id.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, recipient: Ulid, notification: Notification) {
        if let Some(sender) = self.channels.get(&recipient)
            && sender.send(notification).is_err()
        {
            tracing::debug!(%recipient, "notification dropped, no live receivers");
        }
    }

    /// Drop channels whose receivers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        let n = Notification::BookingStatusChanged {
            booking_id: Ulid::new(),
            status: BookingStatus::Paid,
        };
        hub.send(user, n.clone());

        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[test]
    fn payload_is_tagged_json() {
        let booking_id = Ulid::new();
        let n = Notification::BookingStatusChanged { booking_id, status: BookingStatus::AwaitingPayment };
        let v: serde_json::Value = serde_json::from_str(&n.payload()).unwrap();
        assert_eq!(v["type"], "booking_status_changed");
        assert_eq!(v["status"], "awaiting_payment");
        assert_eq!(v["booking_id"], booking_id.to_string());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(
            Ulid::new(),
            Notification::RefundIssued { booking_id: Ulid::new(), amount: 10 },
        );
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        drop(hub.subscribe(user));
        let _kept = hub.subscribe(Ulid::new());
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
    }
}
