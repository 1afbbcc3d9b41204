use chrono::{Duration, NaiveDate, TimeZone, Utc};
use tokio::sync::broadcast;

use super::*;
use crate::clock::ManualClock;
use crate::limits::{MAX_DAILY_RATE, MAX_STAY_NIGHTS};
use crate::notify::NotifyHub;

const RATE: Amount = 100;

fn base_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 6, 1).unwrap()
}

/// `base_day() + offset` as the wire format.
fn day(offset: i64) -> String {
    (base_day() + Duration::days(offset)).format("%Y-%m-%d").to_string()
}

fn date(offset: i64) -> NaiveDate {
    base_day() + Duration::days(offset)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("vanbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    hub: Arc<NotifyHub>,
    van: Ulid,
}

/// Engine with one van at `RATE`, clock parked at noon on `base_day()`.
async fn harness(name: &str) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap()));
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(test_wal_path(name), hub.clone())
        .unwrap()
        .with_clock(clock.clone());
    let van = Ulid::new();
    engine.create_van(van, "Westfalia".into(), RATE, 4).await.unwrap();
    Harness { engine, clock, hub, van }
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

/// No two active bookings on the van share a night.
async fn assert_no_overlap(engine: &Engine, van: Ulid) {
    let vs = engine.van(&van).unwrap();
    let guard = vs.read().await;
    let active: Vec<&Booking> = guard.bookings.iter().filter(|b| b.status.is_active()).collect();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            assert!(!a.stay.overlaps(&b.stay), "{:?} overlaps {:?}", a.stay, b.stay);
        }
    }
}

/// Create a booking and confirm it by payment.
async fn confirmed_booking(h: &Harness, requester: Ulid, start: i64, end: i64) -> Ulid {
    let id = Ulid::new();
    h.engine
        .create_booking(id, h.van, requester, &day(start), &day(end))
        .await
        .unwrap();
    assert_eq!(h.engine.confirm_via_payment(id).await.unwrap(), PaymentOutcome::Confirmed);
    id
}

// ── Creation ─────────────────────────────────────────────

#[tokio::test]
async fn create_booking_is_pending_and_priced() {
    let h = harness("create_priced.wal").await;
    let requester = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, requester, &day(5), &day(10))
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.total_price, 500);
    assert_eq!(booking.stay, Stay::new(date(5), date(10)));
    assert_eq!(booking.requester_id, requester);
}

#[tokio::test]
async fn overlapping_create_not_available() {
    let h = harness("create_overlap.wal").await;
    let first = h
        .engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(5), &day(10))
        .await
        .unwrap();

    let second = h
        .engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(7), &day(12))
        .await;
    assert!(matches!(second, Err(EngineError::NotAvailable)));

    let info = h.engine.booking_for(first.requester_id, first.id).await.unwrap();
    assert_eq!(info.stay, first.stay);
    assert_eq!(info.status, BookingStatus::Pending);
}

#[tokio::test]
async fn back_to_back_bookings_allowed() {
    let h = harness("create_back_to_back.wal").await;
    for (s, e) in [(5, 10), (10, 12), (3, 5)] {
        h.engine
            .create_booking(Ulid::new(), h.van, Ulid::new(), &day(s), &day(e))
            .await
            .unwrap();
    }
    assert_no_overlap(&h.engine, h.van).await;
}

#[tokio::test]
async fn create_validation_order() {
    let h = harness("create_validation.wal").await;
    let r = Ulid::new();

    let res = h.engine.create_booking(Ulid::new(), h.van, r, "06/05/2030", &day(10)).await;
    assert!(matches!(res, Err(EngineError::InvalidDateFormat(_))));

    let res = h.engine.create_booking(Ulid::new(), h.van, r, &day(10), &day(10)).await;
    assert!(matches!(res, Err(EngineError::InvalidDateRange)));

    let res = h.engine.create_booking(Ulid::new(), h.van, r, &day(-1), &day(3)).await;
    assert!(matches!(res, Err(EngineError::DateInPast { .. })));

    let res = h.engine.create_booking(Ulid::new(), Ulid::new(), r, &day(1), &day(3)).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));

    // Same-day start is fine under the default policy.
    h.engine
        .create_booking(Ulid::new(), h.van, r, &day(0), &day(2))
        .await
        .unwrap();
}

#[tokio::test]
async fn lead_time_policy_applies() {
    let h = harness("create_lead_time.wal").await;
    let engine = h.engine.with_policy(BookingPolicy { min_lead_days: 3 });
    let r = Ulid::new();

    match engine.create_booking(Ulid::new(), h.van, r, &day(2), &day(4)).await {
        Err(EngineError::DateInPast { earliest }) => assert_eq!(earliest, date(3)),
        other => panic!("expected DateInPast, got {other:?}"),
    }
    engine
        .create_booking(Ulid::new(), h.van, r, &day(3), &day(4))
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let h = harness("create_duplicate_id.wal").await;
    let id = Ulid::new();
    h.engine
        .create_booking(id, h.van, Ulid::new(), &day(1), &day(2))
        .await
        .unwrap();
    let res = h.engine.create_booking(id, h.van, Ulid::new(), &day(20), &day(22)).await;
    assert!(matches!(res, Err(EngineError::AlreadyExists(x)) if x == id));
}

#[tokio::test]
async fn stay_limits_enforced() {
    let h = harness("create_limits.wal").await;
    let r = Ulid::new();
    let res = h.engine.create_booking(Ulid::new(), h.van, r, &day(1), &day(400)).await;
    assert!(matches!(res, Err(EngineError::LimitExceeded(_))));
    let res = h.engine.create_booking(Ulid::new(), h.van, r, &day(800), &day(802)).await;
    assert!(matches!(res, Err(EngineError::LimitExceeded(_))));
}

// ── Vans ─────────────────────────────────────────────────

#[tokio::test]
async fn van_registration_rules() {
    let h = harness("van_rules.wal").await;
    let res = h.engine.create_van(h.van, "Other".into(), 50, 2).await;
    assert!(matches!(res, Err(EngineError::AlreadyExists(_))));
    let res = h.engine.create_van(Ulid::new(), "Free".into(), 0, 2).await;
    assert!(matches!(res, Err(EngineError::Invalid(_))));

    let second = Ulid::new();
    h.engine.create_van(second, "Bulli".into(), 80, 2).await.unwrap();
    let names: Vec<String> = h.engine.list_vans().await.into_iter().map(|v| v.name).collect();
    assert_eq!(names, vec!["Bulli".to_string(), "Westfalia".to_string()]);
}

#[tokio::test]
async fn reprice_keeps_existing_snapshots() {
    let h = harness("van_reprice.wal").await;
    let r = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(7))
        .await
        .unwrap();

    let van = h.engine.reprice_van(h.van, 150).await.unwrap();
    assert_eq!(van.daily_rate, 150);
    assert_eq!(h.engine.booking_for(r, booking.id).await.unwrap().total_price, 200);

    // The next date mutation re-quotes at the new rate.
    let moved = h.engine.edit_booking(booking.id, r, &day(5), &day(8)).await.unwrap();
    assert_eq!(moved.total_price, 450);

    let res = h.engine.reprice_van(Ulid::new(), 10).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn daily_rate_is_capped() {
    let h = harness("van_rate_cap.wal").await;
    let res = h.engine.reprice_van(h.van, i64::MAX / 2).await;
    assert!(matches!(res, Err(EngineError::LimitExceeded(_))));
    let res = h.engine.create_van(Ulid::new(), "Gold".into(), MAX_DAILY_RATE + 1, 2).await;
    assert!(matches!(res, Err(EngineError::LimitExceeded(_))));

    let r = Ulid::new();
    let b = h.engine.create_booking(Ulid::new(), h.van, r, &day(1), &day(6)).await.unwrap();
    assert_eq!(b.total_price, 5 * RATE);

    // The longest stay at the highest rate still prices exactly.
    h.engine.reprice_van(h.van, MAX_DAILY_RATE).await.unwrap();
    let start = 10;
    let longest = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(start), &day(start + MAX_STAY_NIGHTS))
        .await
        .unwrap();
    assert_eq!(longest.total_price, MAX_STAY_NIGHTS * MAX_DAILY_RATE);
}

// ── Self-service edit ────────────────────────────────────

#[tokio::test]
async fn edit_with_bad_range_leaves_booking() {
    let h = harness("edit_bad_range.wal").await;
    let r = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(10))
        .await
        .unwrap();

    let res = h.engine.edit_booking(booking.id, r, &day(9), &day(8)).await;
    assert!(matches!(res, Err(EngineError::InvalidDateRange)));
    assert_eq!(h.engine.booking_for(r, booking.id).await.unwrap().stay, booking.stay);
}

#[tokio::test]
async fn edit_moves_reprices_and_ignores_itself() {
    let h = harness("edit_moves.wal").await;
    let r = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(10))
        .await
        .unwrap();
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(12), &day(15))
        .await
        .unwrap();

    // Overlaps only its own old dates.
    let moved = h.engine.edit_booking(booking.id, r, &day(7), &day(12)).await.unwrap();
    assert_eq!(moved.stay, Stay::new(date(7), date(12)));
    assert_eq!(moved.total_price, 500);

    let res = h.engine.edit_booking(booking.id, r, &day(7), &day(13)).await;
    assert!(matches!(res, Err(EngineError::NotAvailable)));
    assert_no_overlap(&h.engine, h.van).await;
}

#[tokio::test]
async fn edit_requires_pending_and_upcoming() {
    let h = harness("edit_state.wal").await;
    let r = Ulid::new();
    let confirmed = confirmed_booking(&h, r, 5, 7).await;
    let res = h.engine.edit_booking(confirmed, r, &day(8), &day(9)).await;
    assert!(matches!(res, Err(EngineError::NotPending(_))));

    let pending = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(1), &day(3))
        .await
        .unwrap();
    h.clock.advance_days(1);
    let res = h.engine.edit_booking(pending.id, r, &day(20), &day(22)).await;
    assert!(matches!(res, Err(EngineError::OngoingOrPast(_))));
}

#[tokio::test]
async fn other_requesters_booking_is_not_found() {
    let h = harness("edit_ownership.wal").await;
    let owner = Ulid::new();
    let stranger = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, owner, &day(5), &day(10))
        .await
        .unwrap();

    let res = h.engine.edit_booking(booking.id, stranger, &day(6), &day(8)).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));
    let res = h.engine.cancel_booking(booking.id, stranger).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));
    let res = h.engine.booking_for(stranger, booking.id).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));
    let res = h.engine.begin_checkout(booking.id, stranger).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));
}

// ── Self-service cancel ──────────────────────────────────

#[tokio::test]
async fn self_cancel_rules() {
    let h = harness("self_cancel.wal").await;
    let r = Ulid::new();
    let pending = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(10))
        .await
        .unwrap();

    let cancelled = h.engine.cancel_booking(pending.id, r).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    let res = h.engine.cancel_booking(pending.id, r).await;
    assert!(matches!(res, Err(EngineError::AlreadyCancelled(_))));

    // Calendar is free again.
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(5), &day(10))
        .await
        .unwrap();

    let confirmed = confirmed_booking(&h, r, 20, 22).await;
    let res = h.engine.cancel_booking(confirmed, r).await;
    assert!(matches!(res, Err(EngineError::RequiresApproval(_))));

    let today = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(0), &day(1))
        .await
        .unwrap();
    let res = h.engine.cancel_booking(today.id, r).await;
    assert!(matches!(res, Err(EngineError::OngoingOrPast(_))));
}

// ── Payment ──────────────────────────────────────────────

#[tokio::test]
async fn payment_confirmation_is_idempotent() {
    let h = harness("payment_idempotent.wal").await;
    let mut rx = h.hub.subscribe();
    let r = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(10))
        .await
        .unwrap();

    assert_eq!(h.engine.confirm_via_payment(booking.id).await.unwrap(), PaymentOutcome::Confirmed);
    for _ in 0..3 {
        assert_eq!(
            h.engine.confirm_via_payment(booking.id).await.unwrap(),
            PaymentOutcome::AlreadyConfirmed
        );
    }
    let info = h.engine.booking_for(r, booking.id).await.unwrap();
    assert_eq!(info.status, BookingStatus::Confirmed);

    let confirmations = drain(&mut rx)
        .into_iter()
        .filter(|n| n.kind == NotificationKind::PaymentConfirmed)
        .count();
    assert_eq!(confirmations, 1);
}

#[tokio::test]
async fn payment_for_unknown_or_cancelled_is_noop() {
    let h = harness("payment_noop.wal").await;
    assert_eq!(
        h.engine.confirm_via_payment(Ulid::new()).await.unwrap(),
        PaymentOutcome::UnknownBooking
    );

    let r = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(10))
        .await
        .unwrap();
    h.engine.cancel_booking(booking.id, r).await.unwrap();
    assert_eq!(h.engine.confirm_via_payment(booking.id).await.unwrap(), PaymentOutcome::Ignored);
    assert_eq!(
        h.engine.booking_for(r, booking.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
}

#[tokio::test]
async fn payment_with_request_id_is_unknown() {
    let h = harness("payment_request_id.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 5, 8).await;
    let request = Ulid::new();
    h.engine.request_cancellation(request, booking, r).await.unwrap();
    assert_eq!(
        h.engine.confirm_via_payment(request).await.unwrap(),
        PaymentOutcome::UnknownBooking
    );
}

#[tokio::test]
async fn checkout_only_for_upcoming_pending() {
    let h = harness("checkout.wal").await;
    let r = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(3), &day(6))
        .await
        .unwrap();
    let quote = h.engine.begin_checkout(booking.id, r).await.unwrap();
    assert_eq!(quote.amount, 300);
    assert_eq!(quote.van_name, "Westfalia");

    h.engine.confirm_via_payment(booking.id).await.unwrap();
    let res = h.engine.begin_checkout(booking.id, r).await;
    assert!(matches!(res, Err(EngineError::NotPending(_))));

    let today = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(0), &day(2))
        .await
        .unwrap();
    let res = h.engine.begin_checkout(today.id, r).await;
    assert!(matches!(res, Err(EngineError::OngoingOrPast(_))));
}

// ── Change requests ──────────────────────────────────────

#[tokio::test]
async fn change_request_requires_confirmed_upcoming() {
    let h = harness("change_state.wal").await;
    let r = Ulid::new();
    let pending = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(7))
        .await
        .unwrap();
    let res = h.engine.request_change(Ulid::new(), pending.id, r, &day(8), &day(9)).await;
    assert!(matches!(res, Err(EngineError::NotConfirmed(_))));

    let confirmed = confirmed_booking(&h, r, 10, 12).await;
    let res = h.engine.request_change(Ulid::new(), confirmed, r, &day(-2), &day(3)).await;
    assert!(matches!(res, Err(EngineError::DateInPast { .. })));
    let res = h.engine.request_change(Ulid::new(), confirmed, r, "soon", &day(3)).await;
    assert!(matches!(res, Err(EngineError::InvalidDateFormat(_))));

    h.clock.advance_days(10);
    let res = h.engine.request_change(Ulid::new(), confirmed, r, &day(20), &day(22)).await;
    assert!(matches!(res, Err(EngineError::OngoingOrPast(_))));
}

#[tokio::test]
async fn change_request_skips_availability_until_approval() {
    let h = harness("change_no_check.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 12).await;
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(20), &day(25))
        .await
        .unwrap();

    // Proposed dates are taken, but the request is still recorded.
    let request = h
        .engine
        .request_change(Ulid::new(), booking, r, &day(21), &day(23))
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
}

#[tokio::test]
async fn approval_conflict_leaves_everything_pending() {
    let h = harness("change_approve_conflict.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 12).await;
    let request = Ulid::new();
    h.engine
        .request_change(request, booking, r, &day(20), &day(25))
        .await
        .unwrap();

    // Someone else grabs the proposed dates before staff act.
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(22), &day(24))
        .await
        .unwrap();

    let res = h.engine.approve_change(request).await;
    assert!(matches!(res, Err(EngineError::NotAvailable)));

    let info = h.engine.booking_for(r, booking).await.unwrap();
    assert_eq!(info.stay, Stay::new(date(10), date(12)));
    let pending = h.engine.change_requests(true).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, request);
    assert_no_overlap(&h.engine, h.van).await;
}

#[tokio::test]
async fn approve_change_moves_and_reprices() {
    let h = harness("change_approve.wal").await;
    let mut rx = h.hub.subscribe();
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 12).await;
    let request = Ulid::new();
    h.engine
        .request_change(request, booking, r, &day(11), &day(15))
        .await
        .unwrap();
    h.engine.reprice_van(h.van, 120).await.unwrap();

    let moved = h.engine.approve_change(request).await.unwrap();
    assert_eq!(moved.stay, Stay::new(date(11), date(15)));
    assert_eq!(moved.total_price, 480);
    assert_eq!(moved.status, BookingStatus::Confirmed);

    let res = h.engine.approve_change(request).await;
    assert!(matches!(res, Err(EngineError::NotPending(_))));
    let res = h.engine.reject_change(request).await;
    assert!(matches!(res, Err(EngineError::NotPending(_))));

    let kinds: Vec<(NotificationKind, Recipient)> =
        drain(&mut rx).into_iter().map(|n| (n.kind, n.recipient)).collect();
    assert!(kinds.contains(&(NotificationKind::ChangeRequestReceived, Recipient::Requester(r))));
    assert!(kinds.contains(&(NotificationKind::ChangeRequestReceived, Recipient::Staff)));
    assert!(kinds.contains(&(NotificationKind::ChangeRequestApproved, Recipient::Requester(r))));
}

#[tokio::test]
async fn reject_change_keeps_booking() {
    let h = harness("change_reject.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 12).await;
    let request = Ulid::new();
    h.engine
        .request_change(request, booking, r, &day(30), &day(32))
        .await
        .unwrap();

    let rejected = h.engine.reject_change(request).await.unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    let info = h.engine.booking_for(r, booking).await.unwrap();
    assert_eq!(info.stay, Stay::new(date(10), date(12)));
    assert_eq!(info.total_price, 200);
    assert!(h.engine.change_requests(true).await.is_empty());
    assert_eq!(h.engine.change_requests(false).await.len(), 1);
}

#[tokio::test]
async fn approve_change_on_cancelled_booking_fails() {
    let h = harness("change_after_cancel.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 12).await;
    let change = Ulid::new();
    h.engine
        .request_change(change, booking, r, &day(14), &day(16))
        .await
        .unwrap();
    let cancel = Ulid::new();
    h.engine.request_cancellation(cancel, booking, r).await.unwrap();
    h.engine.approve_cancellation(cancel).await.unwrap();

    let res = h.engine.approve_change(change).await;
    assert!(matches!(res, Err(EngineError::NotConfirmed(_))));
    let info = h.engine.booking_for(r, booking).await.unwrap();
    assert_eq!(info.status, BookingStatus::Cancelled);
    assert_eq!(info.stay, Stay::new(date(10), date(12)));
}

#[tokio::test]
async fn unknown_request_ids_not_found() {
    let h = harness("request_unknown.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 5, 6).await;
    assert!(matches!(h.engine.approve_change(Ulid::new()).await, Err(EngineError::NotFound(_))));
    // A booking id is not a request id.
    assert!(matches!(h.engine.approve_change(booking).await, Err(EngineError::NotFound(_))));
    assert!(matches!(h.engine.reject_cancellation(booking).await, Err(EngineError::NotFound(_))));
}

// ── Cancellation requests ────────────────────────────────

#[tokio::test]
async fn ongoing_booking_cannot_request_cancellation() {
    let h = harness("cancel_request_ongoing.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 2, 6).await;
    h.clock.advance_days(3); // started yesterday
    let res = h.engine.request_cancellation(Ulid::new(), booking, r).await;
    assert!(matches!(res, Err(EngineError::OngoingOrPast(_))));
}

#[tokio::test]
async fn cancellation_request_workflow() {
    let h = harness("cancel_request_flow.wal").await;
    let mut rx = h.hub.subscribe();
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 14).await;

    let request = Ulid::new();
    h.engine.request_cancellation(request, booking, r).await.unwrap();
    let res = h.engine.request_cancellation(Ulid::new(), booking, r).await;
    assert!(matches!(res, Err(EngineError::DuplicatePending(_))));

    let listed = h.engine.bookings_for_requester(r).await;
    assert!(listed[0].cancellation_pending);

    let cancelled = h.engine.approve_cancellation(request).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    let res = h.engine.approve_cancellation(request).await;
    assert!(matches!(res, Err(EngineError::NotPending(_))));

    // Freed for someone else.
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(10), &day(14))
        .await
        .unwrap();

    let sent: Vec<(NotificationKind, Recipient)> =
        drain(&mut rx).into_iter().map(|n| (n.kind, n.recipient)).collect();
    assert!(sent.contains(&(NotificationKind::CancellationRequestReceived, Recipient::Staff)));
    assert!(!sent.contains(&(NotificationKind::CancellationRequestReceived, Recipient::Requester(r))));
    assert!(sent.contains(&(NotificationKind::CancellationRequestApproved, Recipient::Requester(r))));
}

#[tokio::test]
async fn rejected_cancellation_keeps_booking_confirmed() {
    let h = harness("cancel_request_reject.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 14).await;
    let request = Ulid::new();
    h.engine.request_cancellation(request, booking, r).await.unwrap();

    h.engine.reject_cancellation(request).await.unwrap();
    let info = h.engine.booking_for(r, booking).await.unwrap();
    assert_eq!(info.status, BookingStatus::Confirmed);
    assert!(!info.cancellation_pending);

    let res = h.engine.reject_cancellation(request).await;
    assert!(matches!(res, Err(EngineError::NotPending(_))));
    // A fresh request is allowed once the previous one is decided.
    h.engine.request_cancellation(Ulid::new(), booking, r).await.unwrap();
}

#[tokio::test]
async fn cancelled_booking_is_terminal() {
    let h = harness("terminal.wal").await;
    let r = Ulid::new();
    let booking = h
        .engine
        .create_booking(Ulid::new(), h.van, r, &day(5), &day(10))
        .await
        .unwrap();
    h.engine.cancel_booking(booking.id, r).await.unwrap();

    let res = h.engine.edit_booking(booking.id, r, &day(6), &day(8)).await;
    assert!(matches!(res, Err(EngineError::NotPending(_))));
    let res = h.engine.request_change(Ulid::new(), booking.id, r, &day(6), &day(8)).await;
    assert!(matches!(res, Err(EngineError::NotConfirmed(_))));
    let res = h.engine.request_cancellation(Ulid::new(), booking.id, r).await;
    assert!(matches!(res, Err(EngineError::NotConfirmed(_))));
    h.engine.confirm_via_payment(booking.id).await.unwrap();

    let info = h.engine.booking_for(r, booking.id).await.unwrap();
    assert_eq!(info.status, BookingStatus::Cancelled);
    assert_eq!(info.stay, booking.stay);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn requester_bookings_newest_start_first() {
    let h = harness("query_requester.wal").await;
    let r = Ulid::new();
    for (s, e) in [(3, 4), (20, 22), (10, 12)] {
        h.engine
            .create_booking(Ulid::new(), h.van, r, &day(s), &day(e))
            .await
            .unwrap();
    }
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(30), &day(31))
        .await
        .unwrap();

    let starts: Vec<NaiveDate> = h
        .engine
        .bookings_for_requester(r)
        .await
        .into_iter()
        .map(|b| b.stay.start)
        .collect();
    assert_eq!(starts, vec![date(20), date(10), date(3)]);
}

#[tokio::test]
async fn availability_queries() {
    let h = harness("query_availability.wal").await;
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(5), &day(10))
        .await
        .unwrap();

    assert!(!h.engine.check_availability(h.van, &day(9), &day(11)).await.unwrap());
    assert!(h.engine.check_availability(h.van, &day(10), &day(11)).await.unwrap());

    let free = h.engine.free_windows(h.van, &day(0), &day(20)).await.unwrap();
    assert_eq!(free, vec![Stay::new(date(0), date(5)), Stay::new(date(10), date(20))]);

    let res = h.engine.free_windows(h.van, "2030-01-01", "2034-01-01").await;
    assert!(matches!(res, Err(EngineError::LimitExceeded(_))));
    let res = h.engine.check_availability(Ulid::new(), &day(1), &day(2)).await;
    assert!(matches!(res, Err(EngineError::NotFound(_))));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_one() {
    let h = harness("concurrent_creates.wal").await;
    let engine = Arc::new(h.engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        let van = h.van;
        // Every range overlaps every other one on night 10.
        let (s, e) = (5 + (i % 5), 11 + (i % 3));
        handles.push(tokio::spawn(async move {
            eng.create_booking(Ulid::new(), van, Ulid::new(), &day(s), &day(e)).await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::NotAvailable) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_no_overlap(&engine, h.van).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_respect_invariant() {
    let h = harness("concurrent_approvals.wal").await;
    let mut requests = Vec::new();
    for i in 0..6 {
        let r = Ulid::new();
        let booking = confirmed_booking(&h, r, 10 + i * 2, 11 + i * 2).await;
        let request = Ulid::new();
        h.engine
            .request_change(request, booking, r, &day(40), &day(45))
            .await
            .unwrap();
        requests.push(request);
    }

    let engine = Arc::new(h.engine);
    let mut handles = Vec::new();
    for request in requests {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.approve_change(request).await }));
    }
    let mut approved = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            approved += 1;
        }
    }
    assert_eq!(approved, 1);
    assert_no_overlap(&engine, h.van).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_with_one_id_admit_one() {
    let h = harness("concurrent_same_id.wal").await;
    let other_van = Ulid::new();
    h.engine.create_van(other_van, "Bulli".into(), RATE, 2).await.unwrap();
    let engine = Arc::new(h.engine);

    for round in 0..100 {
        let id = Ulid::new();
        let requester = Ulid::new();
        let (s, e) = (10 + round * 2, 11 + round * 2);
        let handles: Vec<_> = [h.van, other_van]
            .into_iter()
            .map(|van| {
                let eng = engine.clone();
                let (start, end) = (day(s), day(e));
                tokio::spawn(async move { eng.create_booking(id, van, requester, &start, &end).await })
            })
            .collect();

        let mut winner = None;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(b) => {
                    assert!(winner.is_none(), "id {id} admitted twice");
                    winner = Some(b.van_id);
                }
                Err(EngineError::AlreadyExists(x)) => assert_eq!(x, id),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let winner = winner.expect("one create must win");
        let info = engine.booking_for(requester, id).await.unwrap();
        assert_eq!(info.van_id, winner);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_change_requests_with_one_id_admit_one() {
    let h = harness("concurrent_same_request_id.wal").await;
    let r = Ulid::new();
    let booking = confirmed_booking(&h, r, 10, 12).await;
    let engine = Arc::new(h.engine);

    let id = Ulid::new();
    let mut handles = Vec::new();
    for i in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.request_change(id, booking, r, &day(20 + i), &day(22 + i)).await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    let listed = engine.change_requests(false).await;
    assert_eq!(listed.iter().filter(|c| c.id == id).count(), 1);
}

#[tokio::test]
async fn refused_create_releases_its_id() {
    let h = harness("refused_create_releases_id.wal").await;
    h.engine
        .create_booking(Ulid::new(), h.van, Ulid::new(), &day(5), &day(8))
        .await
        .unwrap();
    let id = Ulid::new();
    let r = Ulid::new();
    let res = h.engine.create_booking(id, h.van, r, &day(6), &day(7)).await;
    assert!(matches!(res, Err(EngineError::NotAvailable)));
    assert!(matches!(h.engine.booking_for(r, id).await, Err(EngineError::NotFound(_))));

    h.engine.create_booking(id, h.van, r, &day(8), &day(10)).await.unwrap();
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_bookings_and_requests() {
    let path = test_wal_path("replay_full.wal");
    let hub = Arc::new(NotifyHub::new());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap()));
    let van = Ulid::new();
    let r = Ulid::new();
    let (pending, confirmed, change, cancel);
    {
        let engine = Engine::new(path.clone(), hub.clone()).unwrap().with_clock(clock.clone());
        engine.create_van(van, "Nugget".into(), RATE, 2).await.unwrap();
        pending = Ulid::new();
        engine.create_booking(pending, van, r, &day(1), &day(3)).await.unwrap();
        confirmed = Ulid::new();
        engine.create_booking(confirmed, van, r, &day(10), &day(12)).await.unwrap();
        engine.confirm_via_payment(confirmed).await.unwrap();
        change = Ulid::new();
        engine.request_change(change, confirmed, r, &day(13), &day(16)).await.unwrap();
        engine.approve_change(change).await.unwrap();
        cancel = Ulid::new();
        engine.request_cancellation(cancel, confirmed, r).await.unwrap();
    }

    let engine = Engine::new(path, hub).unwrap().with_clock(clock);
    let info = engine.booking_for(r, confirmed).await.unwrap();
    assert_eq!(info.status, BookingStatus::Confirmed);
    assert_eq!(info.stay, Stay::new(date(13), date(16)));
    assert_eq!(info.total_price, 300);
    assert!(info.cancellation_pending);
    assert_eq!(engine.booking_for(r, pending).await.unwrap().status, BookingStatus::Pending);

    // Locator rebuilt: requests resolve after restart.
    let approved = engine.change_requests(false).await;
    assert_eq!(approved[0].status, RequestStatus::Approved);
    engine.approve_cancellation(cancel).await.unwrap();
    assert_eq!(
        engine.booking_for(r, confirmed).await.unwrap().status,
        BookingStatus::Cancelled
    );
}

#[tokio::test]
async fn compaction_preserves_state_across_restart() {
    let path = test_wal_path("compact_restart.wal");
    let hub = Arc::new(NotifyHub::new());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap()));
    let van = Ulid::new();
    let r = Ulid::new();
    let (moved, cancelled, rejected, late);
    {
        let engine = Engine::new(path.clone(), hub.clone()).unwrap().with_clock(clock.clone());
        engine.create_van(van, "Nugget".into(), RATE, 2).await.unwrap();
        for _ in 0..10 {
            engine.reprice_van(van, RATE).await.unwrap();
        }

        moved = Ulid::new();
        engine.create_booking(moved, van, r, &day(2), &day(4)).await.unwrap();
        engine.confirm_via_payment(moved).await.unwrap();
        let change = Ulid::new();
        engine.request_change(change, moved, r, &day(5), &day(8)).await.unwrap();
        engine.approve_change(change).await.unwrap();
        rejected = Ulid::new();
        engine.request_change(rejected, moved, r, &day(20), &day(21)).await.unwrap();
        engine.reject_change(rejected).await.unwrap();

        cancelled = Ulid::new();
        engine.create_booking(cancelled, van, r, &day(30), &day(31)).await.unwrap();
        engine.confirm_via_payment(cancelled).await.unwrap();
        let cancel = Ulid::new();
        engine.request_cancellation(cancel, cancelled, r).await.unwrap();
        engine.approve_cancellation(cancel).await.unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL ({after}) should be smaller than {before}");

        late = Ulid::new();
        engine.create_booking(late, van, r, &day(40), &day(41)).await.unwrap();
    }

    let engine = Engine::new(path, hub).unwrap().with_clock(clock);
    let info = engine.booking_for(r, moved).await.unwrap();
    assert_eq!(info.stay, Stay::new(date(5), date(8)));
    assert_eq!(info.status, BookingStatus::Confirmed);
    assert_eq!(engine.booking_for(r, cancelled).await.unwrap().status, BookingStatus::Cancelled);
    assert_eq!(engine.booking_for(r, late).await.unwrap().status, BookingStatus::Pending);

    let statuses: Vec<RequestStatus> =
        engine.change_requests(false).await.into_iter().map(|c| c.status).collect();
    assert!(statuses.contains(&RequestStatus::Approved));
    assert!(statuses.contains(&RequestStatus::Rejected));
    let cancels = engine.cancellation_requests(false).await;
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].status, RequestStatus::Approved);
    assert_no_overlap(&engine, van).await;
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path.clone(), hub.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_van(Ulid::new(), format!("Van {i}"), RATE, 2).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_vans().await.len(), n);

    let engine2 = Engine::new(path, hub).unwrap();
    assert_eq!(engine2.list_vans().await.len(), n);
}
