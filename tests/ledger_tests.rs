use gridx::db;
use gridx::error::GridError;
use gridx::ledger::{Credits, EntryKind, Ledger};
use uuid::Uuid;

async fn test_ledger() -> Ledger {
    let pool = db::connect_memory().await.unwrap();
    Ledger::new(pool, 100.0)
}

#[tokio::test]
async fn ensure_account_grants_starting_balance_once() {
    let ledger = test_ledger().await;

    let balance = ledger.ensure_account("alice").await.unwrap();
    assert_eq!(balance, Credits::from_f64(100.0));

    // Idempotent: no second grant.
    let balance = ledger.ensure_account("alice").await.unwrap();
    assert_eq!(balance, Credits::from_f64(100.0));
}

#[tokio::test]
async fn balance_of_unknown_account_is_none() {
    let ledger = test_ledger().await;
    assert!(ledger.balance("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn debit_refuses_to_go_negative() {
    let ledger = test_ledger().await;
    ledger.ensure_account("alice").await.unwrap();

    assert!(ledger
        .debit("alice", Credits::from_f64(99.5), None)
        .await
        .unwrap());
    // 0.5 left; another 1.0 must fail and leave the balance untouched.
    assert!(!ledger
        .debit("alice", Credits::from_f64(1.0), None)
        .await
        .unwrap());
    assert_eq!(
        ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(0.5)
    );
}

#[tokio::test]
async fn transfer_is_all_or_nothing() {
    let ledger = test_ledger().await;
    ledger.ensure_account("alice").await.unwrap();
    ledger.ensure_account("bob").await.unwrap();

    assert!(ledger
        .transfer("alice", "bob", Credits::from_f64(40.0))
        .await
        .unwrap());
    assert_eq!(
        ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(60.0)
    );
    assert_eq!(
        ledger.balance("bob").await.unwrap().unwrap(),
        Credits::from_f64(140.0)
    );

    // Overdraft: nothing moves.
    assert!(!ledger
        .transfer("alice", "bob", Credits::from_f64(1000.0))
        .await
        .unwrap());
    assert_eq!(
        ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(60.0)
    );
    assert_eq!(
        ledger.balance("bob").await.unwrap().unwrap(),
        Credits::from_f64(140.0)
    );
}

#[tokio::test]
async fn first_contact_installs_secret_later_contacts_must_match() {
    let ledger = test_ledger().await;

    ledger.authenticate("bob", "hunter2").await.unwrap();
    // Same secret: fine.
    ledger.authenticate("bob", "hunter2").await.unwrap();
    // Different secret: hard reject.
    let err = ledger.authenticate("bob", "wrong").await.unwrap_err();
    assert!(matches!(err, GridError::Unauthenticated(_)));

    assert!(ledger.verify_auth("bob", "hunter2").await.unwrap());
    assert!(!ledger.verify_auth("bob", "wrong").await.unwrap());
    assert!(!ledger.verify_auth("nobody", "x").await.unwrap());
}

#[tokio::test]
async fn set_auth_on_first_use_only_installs_once() {
    let ledger = test_ledger().await;
    ledger.ensure_account("carol").await.unwrap();

    assert!(ledger.set_auth_on_first_use("carol", "s1").await.unwrap());
    assert!(!ledger.set_auth_on_first_use("carol", "s2").await.unwrap());
    assert!(ledger.verify_auth("carol", "s1").await.unwrap());
}

#[tokio::test]
async fn every_mutation_appends_an_audit_entry() {
    let ledger = test_ledger().await;
    let job_id = Uuid::new_v4();

    ledger.ensure_account("alice").await.unwrap();
    ledger
        .debit("alice", Credits::from_f64(1.0), Some(job_id))
        .await
        .unwrap();
    ledger
        .credit("bob", Credits::from_f64(0.8), Some(job_id), EntryKind::JobReward)
        .await
        .unwrap();

    let entries = ledger.entries_for_job(job_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].account_id, "alice");
    assert_eq!(entries[0].kind, "job_debit");
    assert_eq!(entries[0].amount, Credits::from_f64(-1.0));
    assert_eq!(entries[1].account_id, "bob");
    assert_eq!(entries[1].kind, "job_reward");
    assert_eq!(entries[1].amount, Credits::from_f64(0.8));
}

#[tokio::test]
async fn unit_of_work_rolls_back_on_drop() {
    let ledger = test_ledger().await;
    ledger.ensure_account("alice").await.unwrap();

    {
        let mut uow = ledger.unit_of_work().await.unwrap();
        assert!(uow
            .debit("alice", Credits::from_f64(50.0), None)
            .await
            .unwrap());
        // Dropped without commit.
    }
    assert_eq!(
        ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(100.0)
    );

    let mut uow = ledger.unit_of_work().await.unwrap();
    assert!(uow
        .debit("alice", Credits::from_f64(50.0), None)
        .await
        .unwrap());
    uow.commit().await.unwrap();
    assert_eq!(
        ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(50.0)
    );
}

#[tokio::test]
async fn credited_account_is_created_without_signup_grant() {
    let ledger = test_ledger().await;
    ledger
        .credit("newbie", Credits::from_f64(0.8), None, EntryKind::JobReward)
        .await
        .unwrap();
    // 0.8, not 100.8: a credit does not trigger the starting grant.
    assert_eq!(
        ledger.balance("newbie").await.unwrap().unwrap(),
        Credits::from_f64(0.8)
    );
}
