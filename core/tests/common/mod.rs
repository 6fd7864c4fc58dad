//! # Common Utilities for Integration Tests

use ark_core::boarding::BoardingOutput;
use ark_core::config::RoundParams;
use ark_core::coordinator::{Coordinator, CoordinatorHandle};
use ark_core::database::Database;
use ark_core::errors::ArkError;
use ark_core::exit::ExitPath;
use ark_core::session::{ClaimFunding, ClientSession, SessionOutcome};
use ark_core::testkit::{random_keypair, MockChain};
use ark_core::utils::initialize_logger;
use ark_core::RoundId;
use bitcoin::{Amount, Network};
use std::sync::Arc;
use std::time::Duration;

pub const SESSION_TIMEOUT: Duration = Duration::from_secs(20);

/// Rounds closing as soon as three claims are in, with tiny claims allowed.
pub fn test_params() -> RoundParams {
    RoundParams {
        min_participants: 2,
        max_participants: 3,
        min_claim_value: Amount::from_sat(1),
        round_fee: Amount::from_sat(5),
        round_submit_time_ms: 2_000,
        round_sign_time_ms: 2_000,
        round_interval_ms: 10,
        ..RoundParams::regtest()
    }
}

pub struct TestCoordinator {
    pub chain: Arc<MockChain>,
    pub db: Database,
    pub coordinator: Coordinator,
    pub handle: CoordinatorHandle,
}

pub async fn create_test_coordinator(params: RoundParams) -> TestCoordinator {
    initialize_logger(None).unwrap();

    let chain = Arc::new(MockChain::new());
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let coordinator = Coordinator::new(
        random_keypair().secret_key(),
        Network::Regtest,
        params,
        chain.clone(),
        db.clone(),
    )
    .unwrap();
    let handle = coordinator.handle();

    TestCoordinator {
        chain,
        db,
        coordinator,
        handle,
    }
}

pub fn create_sessions(handle: &CoordinatorHandle, count: usize) -> Vec<ClientSession> {
    (0..count)
        .map(|_| ClientSession::new(random_keypair(), handle.clone()))
        .collect()
}

/// Locks `value` on-chain under the boarding policy of `session`.
pub async fn board(test: &TestCoordinator, session: &ClientSession, value: u64) -> BoardingOutput {
    let info = test.handle.info().await;
    let policy = session.boarding_policy(&info).unwrap();
    let output = bitcoin::TxOut {
        value: Amount::from_sat(value),
        script_pubkey: policy.script_pubkey().clone(),
    };
    let outpoint = test
        .chain
        .fund_address(output.script_pubkey.clone(), output.value);

    BoardingOutput { outpoint, output }
}

/// Every session boards and joins with the value at the same position.
pub async fn participate_all(
    test: &TestCoordinator,
    sessions: &[ClientSession],
    values: &[u64],
) -> Vec<Result<SessionOutcome, ArkError>> {
    let mut fundings = Vec::with_capacity(sessions.len());
    for (session, value) in sessions.iter().zip(values) {
        fundings.push(ClaimFunding::boarding(vec![board(test, session, *value).await]));
    }

    futures::future::join_all(sessions.iter().zip(values).zip(fundings).map(
        |((session, value), funding)| {
            session.participate(Amount::from_sat(*value), funding, SESSION_TIMEOUT)
        },
    ))
    .await
}

pub async fn participate_refreshing(
    session: &ClientSession,
    value: u64,
    refreshed: Vec<ExitPath>,
) -> Result<SessionOutcome, ArkError> {
    session
        .participate(
            Amount::from_sat(value),
            ClaimFunding::refreshing(refreshed),
            SESSION_TIMEOUT,
        )
        .await
}

/// Waits until the coordinator accepts registrations.
pub async fn wait_for_open_round(handle: &CoordinatorHandle) -> RoundId {
    let mut events = handle.subscribe();

    loop {
        if let Some(round_id) = handle.info().await.current_round {
            return round_id;
        }
        events.recv().await.unwrap();
    }
}
