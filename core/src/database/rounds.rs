//! # Round Related Database Operations

use super::wrapper::{TransactionDB, TxidDB};
use super::{Database, DatabaseTransaction};
use crate::errors::{ArkError, ExitError};
use crate::exit::{ClaimStatus, ExitPath, ForfeitTransaction};
use crate::{execute_query_with_tx, RoundId};
use bitcoin::{OutPoint, Transaction};
use eyre::Context;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed,
    Aborted,
}

impl RoundOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RoundOutcome::Completed => "completed",
            RoundOutcome::Aborted => "aborted",
        }
    }

    fn parse(outcome: &str) -> Result<Self, ArkError> {
        match outcome {
            "completed" => Ok(RoundOutcome::Completed),
            "aborted" => Ok(RoundOutcome::Aborted),
            other => Err(eyre::eyre!("Unknown round outcome {other}").into()),
        }
    }
}

/// Everything a completed round leaves behind.
#[derive(Debug, Clone, Copy)]
pub struct CompletedRound<'a> {
    pub round_id: RoundId,
    pub funding_tx: &'a Transaction,
    pub funding_outpoint: OutPoint,
    pub expiry_height: u32,
    /// Fully witnessed node transactions keyed by node index.
    pub node_txs: &'a BTreeMap<usize, Transaction>,
    pub exit_paths: &'a [ExitPath],
    /// Forfeits of the claims refreshed into this round.
    pub forfeits: &'a [ForfeitTransaction],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub outcome: RoundOutcome,
    pub funding_outpoint: Option<OutPoint>,
    pub funding_tx: Option<Transaction>,
    pub expiry_height: Option<u32>,
    pub claim_count: usize,
    pub abort_reason: Option<String>,
    pub swept: bool,
}

type RoundRow = (
    i64,
    String,
    Option<TxidDB>,
    Option<i64>,
    Option<TransactionDB>,
    Option<i64>,
    i64,
    Option<String>,
    bool,
);

fn round_id_to_db(round_id: RoundId) -> Result<i64, ArkError> {
    Ok(i64::try_from(round_id).wrap_err("Failed to convert round id to i64")?)
}

impl TryFrom<RoundRow> for RoundRecord {
    type Error = ArkError;

    fn try_from(row: RoundRow) -> Result<Self, Self::Error> {
        let (round_id, outcome, txid, vout, funding_tx, expiry_height, claim_count, reason, swept) =
            row;

        let funding_outpoint = match (txid, vout) {
            (Some(txid), Some(vout)) => Some(OutPoint {
                txid: txid.0,
                vout: u32::try_from(vout).wrap_err("Failed to convert vout to u32")?,
            }),
            _ => None,
        };

        Ok(RoundRecord {
            round_id: u64::try_from(round_id).wrap_err("Failed to convert round id to u64")?,
            outcome: RoundOutcome::parse(&outcome)?,
            funding_outpoint,
            funding_tx: funding_tx.map(|tx| tx.0),
            expiry_height: expiry_height
                .map(u32::try_from)
                .transpose()
                .wrap_err("Failed to convert expiry height to u32")?,
            claim_count: usize::try_from(claim_count)
                .wrap_err("Failed to convert claim count to usize")?,
            abort_reason: reason,
            swept,
        })
    }
}

impl Database {
    /// Writes a completed round, its claims and the forfeits of the claims it
    /// refreshed in one SQL transaction. Refreshed claims must still be live.
    #[tracing::instrument(skip_all, fields(round_id = round.round_id), err(level = tracing::Level::ERROR))]
    pub async fn save_completed_round(&self, round: CompletedRound<'_>) -> Result<(), ArkError> {
        let mut dbtx = self.begin_transaction().await?;

        sqlx::query(
            "INSERT INTO rounds (round_id, outcome, funding_txid, funding_vout, funding_tx, expiry_height, claim_count)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(round_id_to_db(round.round_id)?)
        .bind(RoundOutcome::Completed.as_str())
        .bind(TxidDB(round.funding_outpoint.txid))
        .bind(i64::from(round.funding_outpoint.vout))
        .bind(TransactionDB(round.funding_tx.clone()))
        .bind(i64::from(round.expiry_height))
        .bind(round.exit_paths.len() as i64)
        .execute(&mut *dbtx)
        .await?;

        for (index, node_tx) in round.node_txs {
            sqlx::query(
                "INSERT INTO round_transactions (round_id, node_index, txid, tx) VALUES (?, ?, ?, ?)",
            )
            .bind(round_id_to_db(round.round_id)?)
            .bind(*index as i64)
            .bind(TxidDB(node_tx.compute_txid()))
            .bind(TransactionDB(node_tx.clone()))
            .execute(&mut *dbtx)
            .await?;
        }

        for path in round.exit_paths {
            self.insert_claim(Some(&mut dbtx), path).await?;
        }

        for forfeit in round.forfeits {
            let forfeited = self
                .update_claim_status(
                    Some(&mut dbtx),
                    forfeit.claim,
                    ClaimStatus::Live,
                    ClaimStatus::Forfeited,
                )
                .await?;
            if !forfeited {
                return Err(ExitError::ClaimForfeited(forfeit.claim).into());
            }

            self.insert_forfeit(Some(&mut dbtx), Some(round.round_id), forfeit)
                .await?;
        }

        dbtx.commit().await?;

        Ok(())
    }

    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    pub async fn save_aborted_round(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        round_id: RoundId,
        reason: &str,
    ) -> Result<(), ArkError> {
        let query = sqlx::query(
            "INSERT INTO rounds (round_id, outcome, abort_reason) VALUES (?, ?, ?)
             ON CONFLICT (round_id) DO NOTHING",
        )
        .bind(round_id_to_db(round_id)?)
        .bind(RoundOutcome::Aborted.as_str())
        .bind(reason);

        execute_query_with_tx!(self.connection, tx, query, execute)?;

        Ok(())
    }

    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR))]
    pub async fn get_round(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        round_id: RoundId,
    ) -> Result<Option<RoundRecord>, ArkError> {
        let query = sqlx::query_as::<_, RoundRow>(
            "SELECT round_id, outcome, funding_txid, funding_vout, funding_tx, expiry_height, claim_count, abort_reason, swept
             FROM rounds WHERE round_id = ?",
        )
        .bind(round_id_to_db(round_id)?);

        let row: Option<RoundRow> = execute_query_with_tx!(self.connection, tx, query, fetch_optional)?;

        row.map(RoundRecord::try_from).transpose()
    }

    /// Identifier of the newest persisted round, completed or aborted.
    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    pub async fn get_last_round_id(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
    ) -> Result<Option<RoundId>, ArkError> {
        let query = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(round_id) FROM rounds");

        let last: Option<i64> = execute_query_with_tx!(self.connection, tx, query, fetch_one)?;

        Ok(last
            .map(u64::try_from)
            .transpose()
            .wrap_err("Failed to convert round id to u64")?)
    }

    /// Node transactions of a completed round, keyed by node index.
    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR))]
    pub async fn get_round_transactions(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        round_id: RoundId,
    ) -> Result<BTreeMap<usize, Transaction>, ArkError> {
        let query = sqlx::query_as::<_, (i64, TransactionDB)>(
            "SELECT node_index, tx FROM round_transactions WHERE round_id = ? ORDER BY node_index",
        )
        .bind(round_id_to_db(round_id)?);

        let rows: Vec<(i64, TransactionDB)> =
            execute_query_with_tx!(self.connection, tx, query, fetch_all)?;

        rows.into_iter()
            .map(|(index, node_tx)| {
                Ok((
                    usize::try_from(index).wrap_err("Failed to convert node index to usize")?,
                    node_tx.0,
                ))
            })
            .collect::<Result<_, ArkError>>()
    }

    /// Completed, unswept rounds whose expiry height is at most `height`.
    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    pub async fn get_expired_rounds(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        height: u32,
    ) -> Result<Vec<RoundId>, ArkError> {
        let query = sqlx::query_scalar::<_, i64>(
            "SELECT round_id FROM rounds
             WHERE outcome = 'completed' AND swept = 0 AND expiry_height <= ?
             ORDER BY round_id",
        )
        .bind(i64::from(height));

        let rows: Vec<i64> = execute_query_with_tx!(self.connection, tx, query, fetch_all)?;

        Ok(rows
            .into_iter()
            .map(u64::try_from)
            .collect::<Result<Vec<_>, _>>()
            .wrap_err("Failed to convert round id to u64")?)
    }

    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    pub async fn mark_round_swept(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        round_id: RoundId,
    ) -> Result<bool, ArkError> {
        let query = sqlx::query("UPDATE rounds SET swept = 1 WHERE round_id = ? AND swept = 0")
            .bind(round_id_to_db(round_id)?);

        let result = execute_query_with_tx!(self.connection, tx, query, execute)?;

        Ok(result.rows_affected() == 1)
    }
}
