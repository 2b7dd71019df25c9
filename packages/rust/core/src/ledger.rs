//! Process-wide budget ledger with atomic reserve/commit/release.
//!
//! Every paid provider call goes through one [`BudgetLedger`]. Accounts are
//! keyed by `(provider, period)` where the period is the UTC calendar month.
//! The invariant `reserved + spent <= cap` holds after every operation;
//! reservations live only in memory, spend is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use ideaforge_shared::{AppConfig, BatchId, IdeaForgeError, LedgerSnapshot, Result};
use ideaforge_storage::{Storage, UsageEvent};

/// Slack for float comparisons against the cap.
const EPSILON: f64 = 1e-9;

/// Period key for `now`: `YYYY-MM` in UTC.
pub fn period_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Capacity held for one in-flight call. Consumed by commit or release.
#[derive(Debug)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    id: u64,
    provider: String,
    period: String,
    amount: f64,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

/// What a committed call was for, recorded as a usage event.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub kind: String,
    pub batch_id: Option<BatchId>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Account {
    cap: f64,
    reserved: f64,
    spent: f64,
}

/// Budget ledger service shared across batches and tasks.
pub struct BudgetLedger {
    caps: HashMap<String, f64>,
    storage: Option<Arc<Storage>>,
    accounts: Mutex<HashMap<(String, String), Account>>,
    next_id: AtomicU64,
}

impl BudgetLedger {
    /// Ledger with explicit caps. Without storage, spend is memory-only.
    pub fn new(caps: HashMap<String, f64>, storage: Option<Arc<Storage>>) -> Self {
        Self {
            caps,
            storage,
            accounts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &AppConfig, storage: Option<Arc<Storage>>) -> Self {
        let caps = config
            .budgets
            .iter()
            .map(|b| (b.provider.clone(), b.cap))
            .collect();
        Self::new(caps, storage)
    }

    /// Load persisted spend for every configured provider in the current period.
    #[instrument(skip_all)]
    pub async fn init(&self) -> Result<()> {
        let period = period_key(Utc::now());
        let mut accounts = self.accounts.lock().await;
        for provider in self.caps.keys() {
            let account = self.load_account(provider, &period).await?;
            accounts.insert((provider.clone(), period.clone()), account);
        }
        info!(providers = self.caps.len(), %period, "budget ledger initialized");
        Ok(())
    }

    /// Atomically reserve `amount` for `provider` in the current period.
    pub async fn reserve(&self, provider: &str, amount: f64) -> Result<Reservation> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(IdeaForgeError::validation(format!(
                "invalid reservation amount {amount}"
            )));
        }
        let period = period_key(Utc::now());
        let mut accounts = self.accounts.lock().await;
        let account = self.account_mut(&mut accounts, provider, &period).await?;

        let remaining = account.cap - account.reserved - account.spent;
        if amount > remaining + EPSILON {
            debug!(provider, amount, remaining, "reservation rejected");
            return Err(IdeaForgeError::BudgetExceeded {
                provider: provider.to_string(),
                requested: amount,
                remaining: remaining.max(0.0),
            });
        }
        account.reserved += amount;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(provider, amount, reservation = id, "budget reserved");
        Ok(Reservation {
            id,
            provider: provider.to_string(),
            period,
            amount,
        })
    }

    /// Convert a reservation into spend of `actual_cost` and record the usage event.
    ///
    /// Spend is clamped so the cap invariant holds when the provider charged
    /// more than was reserved; the usage event always carries the full cost.
    pub async fn commit(&self, reservation: Reservation, actual_cost: f64, usage: Usage) -> Result<()> {
        let actual_cost = actual_cost.max(0.0);
        let spent = {
            let mut accounts = self.accounts.lock().await;
            let account = self
                .account_mut(&mut accounts, &reservation.provider, &reservation.period)
                .await?;
            account.reserved = (account.reserved - reservation.amount).max(0.0);

            let headroom = (account.cap - account.reserved - account.spent).max(0.0);
            if actual_cost > headroom + EPSILON {
                warn!(
                    provider = %reservation.provider,
                    reserved = reservation.amount,
                    actual_cost,
                    "actual cost exceeds remaining cap, clamping ledger spend"
                );
            }
            account.spent += actual_cost.min(headroom);
            let snapshot = *account;

            if let Some(storage) = &self.storage {
                storage
                    .upsert_ledger(&reservation.provider, &reservation.period, snapshot.cap, snapshot.spent)
                    .await?;
            }
            snapshot.spent
        };

        if let Some(storage) = &self.storage {
            storage
                .record_usage(&UsageEvent {
                    provider: reservation.provider.clone(),
                    period: reservation.period.clone(),
                    batch_id: usage.batch_id,
                    kind: usage.kind,
                    tokens_in: usage.tokens_in,
                    tokens_out: usage.tokens_out,
                    cost: actual_cost,
                    created_at: Utc::now(),
                })
                .await?;
        }

        debug!(provider = %reservation.provider, reservation = reservation.id, actual_cost, spent, "budget committed");
        Ok(())
    }

    /// Return a reservation's capacity unused.
    pub async fn release(&self, reservation: Reservation) {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) =
            accounts.get_mut(&(reservation.provider.clone(), reservation.period.clone()))
        {
            account.reserved = (account.reserved - reservation.amount).max(0.0);
        }
        debug!(provider = %reservation.provider, reservation = reservation.id, "budget released");
    }

    /// Current view of `provider` in the current period.
    pub async fn snapshot(&self, provider: &str) -> Result<LedgerSnapshot> {
        let period = period_key(Utc::now());
        let mut accounts = self.accounts.lock().await;
        let account = *self.account_mut(&mut accounts, provider, &period).await?;
        Ok(LedgerSnapshot {
            provider: provider.to_string(),
            period,
            cap: account.cap,
            reserved: account.reserved,
            spent: account.spent,
        })
    }

    /// Snapshots of every configured provider, sorted by name.
    pub async fn snapshots(&self) -> Result<Vec<LedgerSnapshot>> {
        let mut providers: Vec<&String> = self.caps.keys().collect();
        providers.sort();
        let mut out = Vec::with_capacity(providers.len());
        for provider in providers {
            out.push(self.snapshot(provider).await?);
        }
        Ok(out)
    }

    async fn account_mut<'a>(
        &self,
        accounts: &'a mut HashMap<(String, String), Account>,
        provider: &str,
        period: &str,
    ) -> Result<&'a mut Account> {
        let key = (provider.to_string(), period.to_string());
        if !accounts.contains_key(&key) {
            let account = self.load_account(provider, period).await?;
            accounts.insert(key.clone(), account);
        }
        accounts
            .get_mut(&key)
            .ok_or_else(|| IdeaForgeError::Storage("ledger account vanished".into()))
    }

    /// A provider without a configured cap has zero capacity.
    async fn load_account(&self, provider: &str, period: &str) -> Result<Account> {
        let cap = self.caps.get(provider).copied().unwrap_or(0.0);
        let spent = match &self.storage {
            Some(storage) => storage
                .load_ledger(provider, period)
                .await?
                .map(|row| row.spent)
                .unwrap_or(0.0),
            None => 0.0,
        };
        Ok(Account {
            cap,
            reserved: 0.0,
            spent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ledger(cap: f64) -> BudgetLedger {
        BudgetLedger::new(HashMap::from([("novelty".to_string(), cap)]), None)
    }

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("if_ledger_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    #[tokio::test]
    async fn reserve_commit_release_keep_invariant() {
        let ledger = ledger(1.0);
        let a = ledger.reserve("novelty", 0.4).await.unwrap();
        let b = ledger.reserve("novelty", 0.4).await.unwrap();
        assert!(ledger.reserve("novelty", 0.4).await.is_err());

        ledger.commit(a, 0.3, Usage::default()).await.unwrap();
        ledger.release(b).await;

        let snap = ledger.snapshot("novelty").await.unwrap();
        assert_eq!(snap.reserved, 0.0);
        assert!((snap.spent - 0.3).abs() < 1e-12);
        assert!((snap.remaining() - 0.7).abs() < 1e-12);
    }

    #[tokio::test]
    async fn budget_exceeded_reports_remaining() {
        let ledger = ledger(0.1);
        let err = ledger.reserve("novelty", 0.5).await.unwrap_err();
        match err {
            IdeaForgeError::BudgetExceeded { requested, remaining, .. } => {
                assert_eq!(requested, 0.5);
                assert!((remaining - 0.1).abs() < 1e-12);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_provider_has_no_capacity() {
        let ledger = ledger(1.0);
        assert!(ledger.reserve("elsewhere", 0.01).await.is_err());
        assert!(ledger.reserve("elsewhere", 0.0).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overspend() {
        let ledger = Arc::new(ledger(1.0));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                match ledger.reserve("novelty", 0.05).await {
                    Ok(r) => {
                        tokio::task::yield_now().await;
                        ledger.commit(r, 0.05, Usage::default()).await.unwrap();
                        true
                    }
                    Err(_) => false,
                }
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 20);
        let snap = ledger.snapshot("novelty").await.unwrap();
        assert!(snap.spent <= snap.cap + EPSILON);
        assert_eq!(snap.reserved, 0.0);
    }

    #[tokio::test]
    async fn overrun_is_clamped_but_fully_recorded() {
        let storage = test_storage().await;
        let ledger = BudgetLedger::new(
            HashMap::from([("openrouter".to_string(), 1.0)]),
            Some(Arc::clone(&storage)),
        );
        let r = ledger.reserve("openrouter", 0.5).await.unwrap();
        ledger
            .commit(
                r,
                1.4,
                Usage {
                    kind: "synthesis".into(),
                    ..Usage::default()
                },
            )
            .await
            .unwrap();

        let snap = ledger.snapshot("openrouter").await.unwrap();
        assert_eq!(snap.spent, 1.0);

        let totals = storage.usage_totals(&snap.period).await.unwrap();
        assert_eq!(totals[0].cost, 1.4);
    }

    #[tokio::test]
    async fn init_loads_persisted_spend() {
        let storage = test_storage().await;
        let period = period_key(Utc::now());
        storage.upsert_ledger("novelty", &period, 5.0, 4.5).await.unwrap();

        let ledger = BudgetLedger::new(
            HashMap::from([("novelty".to_string(), 5.0)]),
            Some(storage),
        );
        ledger.init().await.unwrap();

        assert!(ledger.reserve("novelty", 1.0).await.is_err());
        let snap = ledger.snapshot("novelty").await.unwrap();
        assert_eq!(snap.spent, 4.5);
    }

    #[test]
    fn period_is_utc_month() {
        let at = DateTime::parse_from_rfc3339("2026-03-31T23:30:00-05:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(period_key(at), "2026-04");
    }
}
