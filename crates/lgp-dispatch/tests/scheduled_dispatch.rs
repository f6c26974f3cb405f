use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use lgp_adapters::{DeliveryError, Mailer};
use lgp_core::{BusinessIdentity, SendStatus};
use lgp_dispatch::{schedule_send, CoordinatorSettings, DispatchCoordinator, OutreachSession};
use lgp_storage::ScheduleStore;

#[derive(Default)]
struct CountingMailer {
    deliveries: AtomicUsize,
}

#[async_trait]
impl Mailer for CountingMailer {
    async fn deliver(&self, _recipient: &str, _subject: &str, _body: &str) -> Result<(), DeliveryError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn competing_coordinators_deliver_each_row_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("leadgen.db");
    let producer = ScheduleStore::open_path(&path).await.expect("producer store");

    let mut session = OutreachSession::new();
    session
        .generate(
            BusinessIdentity::new("Acme Plumbing", "acme.test", "Plumbing"),
            "Acme Plumbing fixes leaks. Get a free quote today.",
            "",
        )
        .expect("draft");

    let created = NaiveDate::from_ymd_opt(2026, 4, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    let due_at = created + chrono::Duration::minutes(30);
    let poll_at = created + chrono::Duration::hours(1);

    let mut ids = Vec::new();
    for recipient in ["a@x.test", "b@x.test", "c@x.test"] {
        let approved = session.approve(recipient, None, None).expect("approved");
        ids.push(
            schedule_send(&producer, &approved, due_at, created)
                .await
                .expect("scheduled"),
        );
    }

    let mailer = Arc::new(CountingMailer::default());
    let first = DispatchCoordinator::new(
        ScheduleStore::open_path(&path).await.expect("first store"),
        mailer.clone(),
        CoordinatorSettings::default(),
    );
    let second = DispatchCoordinator::new(
        ScheduleStore::open_path(&path).await.expect("second store"),
        mailer.clone(),
        CoordinatorSettings::default(),
    );

    let (a, b) = tokio::join!(first.poll_once(poll_at), second.poll_once(poll_at));
    let (a, b) = (a.expect("first poll"), b.expect("second poll"));

    assert_eq!(a.sent + b.sent, 3);
    assert_eq!(a.claimed + b.claimed, 3);
    assert_eq!(a.lost_claims + b.lost_claims, a.due + b.due - 3);
    assert_eq!(mailer.deliveries.load(Ordering::SeqCst), 3);

    for id in ids {
        let row = producer.get(id).await.unwrap().expect("row");
        assert_eq!(row.status, SendStatus::Sent);
    }
    let log = producer.recent_log(10).await.unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|entry| entry.status == "sent (scheduled)"));
}
