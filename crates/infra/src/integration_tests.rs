//! Cross-module tests: producer → queue → worker → repository, and the stock
//! accounting invariant under arbitrary operation sequences.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use conreg_core::{TierId, UserId};
use conreg_tickets::{TicketStatus, TicketTier, User};

use crate::jobs::{JobAction, JobDispatcher, JobProducer};
use crate::queue::{InMemoryQueue, QueueWorker, WorkerSettings};
use crate::repository::{InMemoryTicketRepository, TicketRepository};

fn tier(code: &str, stock: i32, price: i64) -> TicketTier {
    TicketTier {
        id: TierId::new(),
        code: code.to_string(),
        stock,
        price,
        is_active: true,
        is_deleted: false,
    }
}

async fn seeded(tiers: &[&TicketTier], users: usize) -> (Arc<InMemoryTicketRepository>, Vec<UserId>) {
    let repo = Arc::new(InMemoryTicketRepository::new());
    for t in tiers {
        repo.insert_tier((*t).clone()).await;
    }
    let mut ids = Vec::with_capacity(users);
    for _ in 0..users {
        let id = UserId::new();
        repo.insert_user(User::new(id)).await;
        ids.push(id);
    }
    (repo, ids)
}

fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        job_timeout: Duration::from_secs(1),
        receive_batch: 10,
        receive_wait: Duration::ZERO,
        ..WorkerSettings::default()
    }
}

#[tokio::test]
async fn enqueued_jobs_reach_the_repository() {
    let standard = tier("STD", 5, 100);
    let vip = tier("VIP", 5, 300);
    let (repo, users) = seeded(&[&standard, &vip], 2).await;
    let (attendee, staff) = (users[0], users[1]);

    let queue = Arc::new(InMemoryQueue::default());
    let producer = JobProducer::new(queue.clone());
    producer
        .enqueue(&JobAction::Purchase { user_id: attendee, tier_id: standard.id })
        .await
        .unwrap();
    producer
        .enqueue(&JobAction::ConfirmPayment { user_id: attendee })
        .await
        .unwrap();
    producer
        .enqueue(&JobAction::UpgradeTicket { user_id: attendee, tier_id: vip.id })
        .await
        .unwrap();

    let worker = QueueWorker::new(queue.clone(), JobDispatcher::new(repo.clone()), worker_settings());
    assert_eq!(worker.run_once().await.unwrap(), 3);
    assert!(queue.is_empty().await);

    let tickets = repo.tickets_for(attendee).await;
    assert_eq!(tickets.len(), 1);
    let ticket = &tickets[0];
    assert_eq!(ticket.tier_id, vip.id);
    assert_eq!(ticket.reference_code, "VIP-0001");
    assert_eq!(ticket.previous_reference_code.as_deref(), Some("STD-0001"));
    assert_eq!(repo.tier(standard.id).await.unwrap().stock, 5);
    assert_eq!(repo.tier(vip.id).await.unwrap().stock, 4);

    producer
        .enqueue_payload(
            format!(
                r#"{{"action":"deny","ticket_id":"{}","staff_id":"{}","reason":"duplicate registration"}}"#,
                ticket.id, staff
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    let denied = repo.ticket(ticket.id).await.unwrap();
    assert_eq!(denied.status, TicketStatus::Denied);
    assert_eq!(repo.tier(vip.id).await.unwrap().stock, 5);
    assert_eq!(repo.user(attendee).await.unwrap().denial_count, 1);

    let stats = worker.stats();
    assert_eq!(stats.succeeded, 4);
    assert_eq!(stats.permanent_failures, 0);
}

#[tokio::test]
async fn rule_violations_are_dropped_not_retried() {
    let sold_out = tier("A", 0, 100);
    let (repo, users) = seeded(&[&sold_out], 1).await;
    let queue = Arc::new(InMemoryQueue::default());
    JobProducer::new(queue.clone())
        .enqueue(&JobAction::Purchase { user_id: users[0], tier_id: sold_out.id })
        .await
        .unwrap();

    let worker = QueueWorker::new(queue.clone(), JobDispatcher::new(repo.clone()), worker_settings());
    worker.run_once().await.unwrap();

    assert!(queue.is_empty().await);
    assert!(queue.dead_letters().await.is_empty());
    assert_eq!(worker.stats().permanent_failures, 1);
    assert!(repo.tickets_for(users[0]).await.is_empty());
}

#[derive(Debug, Clone)]
enum Op {
    Purchase(usize, usize),
    Confirm(usize),
    Cancel(usize),
    Deny(usize),
    Upgrade(usize, usize),
    Blacklist(usize),
    Unblacklist(usize),
}

const USERS: usize = 4;
const TIERS: usize = 2;
const INITIAL_STOCK: [i32; TIERS] = [2, 3];

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..USERS, 0..TIERS).prop_map(|(u, t)| Op::Purchase(u, t)),
        1 => (0..USERS).prop_map(Op::Confirm),
        2 => (0..USERS).prop_map(Op::Cancel),
        2 => (0..USERS).prop_map(Op::Deny),
        2 => (0..USERS, 0..TIERS).prop_map(|(u, t)| Op::Upgrade(u, t)),
        1 => (0..USERS).prop_map(Op::Blacklist),
        1 => (0..USERS).prop_map(Op::Unblacklist),
    ]
}

async fn apply(repo: &InMemoryTicketRepository, users: &[UserId], tiers: &[TierId], op: &Op) {
    let staff = UserId::new();
    // Rejections are expected; only the resulting state is checked.
    let _ = match *op {
        Op::Purchase(u, t) => repo.purchase(users[u], tiers[t]).await.map(drop),
        Op::Confirm(u) => repo.confirm_payment(users[u]).await.map(drop),
        Op::Cancel(u) => repo.cancel(users[u]).await.map(drop),
        Op::Deny(u) => match repo.tickets_for(users[u]).await.last() {
            Some(ticket) => repo.deny(ticket.id, staff, "no show").await.map(drop),
            None => Ok(()),
        },
        Op::Upgrade(u, t) => repo.upgrade(users[u], tiers[t]).await.map(drop),
        Op::Blacklist(u) => repo.blacklist(users[u], None).await,
        Op::Unblacklist(u) => repo.unblacklist(users[u]).await,
    };
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stock_plus_held_tickets_is_conserved(ops in proptest::collection::vec(op(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let a = tier("A", INITIAL_STOCK[0], 100);
            let b = tier("B", INITIAL_STOCK[1], 200);
            let (repo, users) = seeded(&[&a, &b], USERS).await;
            let tiers = [a.id, b.id];

            for op in &ops {
                apply(&repo, &users, &tiers, op).await;
            }

            let mut held = [0i32; TIERS];
            for user in &users {
                let live: Vec<_> = repo
                    .tickets_for(*user)
                    .await
                    .into_iter()
                    .filter(|t| !t.is_deleted && t.status != TicketStatus::Denied)
                    .collect();
                prop_assert!(live.len() <= 1, "user holds {} live tickets", live.len());
                for ticket in live {
                    let idx = tiers.iter().position(|t| *t == ticket.tier_id).unwrap();
                    held[idx] += 1;
                }
            }

            for (idx, tier_id) in tiers.iter().enumerate() {
                let stock = repo.tier(*tier_id).await.unwrap().stock;
                prop_assert!(stock >= 0);
                prop_assert_eq!(stock + held[idx], INITIAL_STOCK[idx]);
            }
            Ok(())
        })?;
    }
}
