//! # Claim Related Database Operations
//!
//! Claims, their status and the forfeits that relinquish them. Exit paths and
//! forfeits are stored as JSON.

use super::wrapper::{OutPointDB, PublicKeyDB};
use super::{Database, DatabaseTransaction};
use crate::errors::ArkError;
use crate::exit::{ClaimRecord, ClaimStatus, ExitPath, ForfeitTransaction};
use crate::{execute_query_with_tx, ClaimId, RoundId};
use bitcoin::Amount;
use eyre::Context;

type ClaimRow = (OutPointDB, i64, PublicKeyDB, i64, String, String);

impl TryFrom<ClaimRow> for ClaimRecord {
    type Error = ArkError;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        let (claim_id, round_id, owner, amount, status, exit_path) = row;

        Ok(ClaimRecord {
            claim_id: claim_id.0,
            round_id: u64::try_from(round_id).wrap_err("Failed to convert round id to u64")?,
            owner: owner.0,
            value: Amount::from_sat(
                u64::try_from(amount).wrap_err("Failed to convert amount to u64")?,
            ),
            status: status.parse()?,
            exit_path: serde_json::from_str(&exit_path)?,
        })
    }
}

impl Database {
    /// Inserts a fresh, live claim from its exit path.
    #[tracing::instrument(skip(self, tx, exit_path), fields(claim = %exit_path.claim_outpoint), err(level = tracing::Level::ERROR))]
    pub async fn insert_claim(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        exit_path: &ExitPath,
    ) -> Result<(), ArkError> {
        let query = sqlx::query(
            "INSERT INTO claims (claim_outpoint, round_id, owner, amount, status, exit_path)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(OutPointDB(exit_path.claim_outpoint))
        .bind(i64::try_from(exit_path.round_id).wrap_err("Failed to convert round id to i64")?)
        .bind(PublicKeyDB(exit_path.owner))
        .bind(
            i64::try_from(exit_path.claim_output.value.to_sat())
                .wrap_err("Failed to convert amount to i64")?,
        )
        .bind(ClaimStatus::Live.as_str())
        .bind(serde_json::to_string(exit_path)?);

        execute_query_with_tx!(self.connection, tx, query, execute)?;

        Ok(())
    }

    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR))]
    pub async fn get_claim(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        claim_id: ClaimId,
    ) -> Result<Option<ClaimRecord>, ArkError> {
        let query = sqlx::query_as::<_, ClaimRow>(
            "SELECT claim_outpoint, round_id, owner, amount, status, exit_path
             FROM claims WHERE claim_outpoint = ?",
        )
        .bind(OutPointDB(claim_id));

        let row: Option<ClaimRow> = execute_query_with_tx!(self.connection, tx, query, fetch_optional)?;

        row.map(ClaimRecord::try_from).transpose()
    }

    /// Claims created by a round, in leaf order.
    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR))]
    pub async fn get_claims_of_round(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        round_id: RoundId,
    ) -> Result<Vec<ClaimRecord>, ArkError> {
        let query = sqlx::query_as::<_, ClaimRow>(
            "SELECT claim_outpoint, round_id, owner, amount, status, exit_path
             FROM claims WHERE round_id = ? ORDER BY rowid",
        )
        .bind(i64::try_from(round_id).wrap_err("Failed to convert round id to i64")?);

        let rows: Vec<ClaimRow> = execute_query_with_tx!(self.connection, tx, query, fetch_all)?;

        rows.into_iter().map(ClaimRecord::try_from).collect()
    }

    /// Moves a claim from `from` to `to`. Returns `false` if the claim wasn't
    /// in `from`, leaving it untouched.
    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    pub async fn update_claim_status(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        claim_id: ClaimId,
        from: ClaimStatus,
        to: ClaimStatus,
    ) -> Result<bool, ArkError> {
        let query = sqlx::query("UPDATE claims SET status = ? WHERE claim_outpoint = ? AND status = ?")
            .bind(to.as_str())
            .bind(OutPointDB(claim_id))
            .bind(from.as_str());

        let result = execute_query_with_tx!(self.connection, tx, query, execute)?;

        Ok(result.rows_affected() == 1)
    }

    /// Stores the forfeit of a claim. `round_id` is the round the claim was
    /// refreshed into, if any.
    #[tracing::instrument(skip(self, tx, forfeit), fields(claim = %forfeit.claim), err(level = tracing::Level::ERROR))]
    pub async fn insert_forfeit(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        round_id: Option<RoundId>,
        forfeit: &ForfeitTransaction,
    ) -> Result<(), ArkError> {
        let query = sqlx::query(
            "INSERT INTO forfeits (claim_outpoint, round_id, forfeit) VALUES (?, ?, ?)",
        )
        .bind(OutPointDB(forfeit.claim))
        .bind(
            round_id
                .map(i64::try_from)
                .transpose()
                .wrap_err("Failed to convert round id to i64")?,
        )
        .bind(serde_json::to_string(forfeit)?);

        execute_query_with_tx!(self.connection, tx, query, execute)?;

        Ok(())
    }

    /// Drops the forfeit of a claim whose settlement didn't commit.
    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR))]
    pub async fn delete_forfeit(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        claim_id: ClaimId,
    ) -> Result<(), ArkError> {
        let query = sqlx::query("DELETE FROM forfeits WHERE claim_outpoint = ? AND round_id IS NULL")
            .bind(OutPointDB(claim_id));

        execute_query_with_tx!(self.connection, tx, query, execute)?;

        Ok(())
    }

    #[tracing::instrument(skip(self, tx), err(level = tracing::Level::ERROR))]
    pub async fn get_forfeit(
        &self,
        tx: Option<DatabaseTransaction<'_, '_>>,
        claim_id: ClaimId,
    ) -> Result<Option<ForfeitTransaction>, ArkError> {
        let query = sqlx::query_scalar::<_, String>(
            "SELECT forfeit FROM forfeits WHERE claim_outpoint = ?",
        )
        .bind(OutPointDB(claim_id));

        let forfeit: Option<String> = execute_query_with_tx!(self.connection, tx, query, fetch_optional)?;

        Ok(forfeit
            .map(|forfeit| serde_json::from_str(&forfeit))
            .transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::database::{CompletedRound, Database};
    use crate::exit::ClaimStatus;
    use crate::testkit;

    #[tokio::test]
    async fn claim_status_transitions_are_conditional() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let round = testkit::signed_round(&[10_000, 20_000], 200).unwrap();
        db.save_completed_round(CompletedRound {
            round_id: 1,
            funding_tx: &round.funding_tx,
            funding_outpoint: round.signed.funding_outpoint(),
            expiry_height: 1_000,
            node_txs: &round.node_txs,
            exit_paths: &round.exit_paths,
            forfeits: &[],
        })
        .await
        .unwrap();
        let claim = round.exit_paths[1].claim_outpoint;

        assert!(db
            .update_claim_status(None, claim, ClaimStatus::Live, ClaimStatus::Exited)
            .await
            .unwrap());
        assert!(!db
            .update_claim_status(None, claim, ClaimStatus::Live, ClaimStatus::Forfeited)
            .await
            .unwrap());
        assert_eq!(
            db.get_claim(None, claim).await.unwrap().unwrap().status,
            ClaimStatus::Exited
        );

        let claims = db.get_claims_of_round(None, 1).await.unwrap();
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].claim_id, round.exit_paths[0].claim_outpoint);
        assert_eq!(claims[1].owner, round.owners[1].public_key());
    }

    #[tokio::test]
    async fn forfeit_is_stored_as_json() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let round = testkit::signed_round(&[10_000], 200).unwrap();
        db.save_completed_round(CompletedRound {
            round_id: 1,
            funding_tx: &round.funding_tx,
            funding_outpoint: round.signed.funding_outpoint(),
            expiry_height: 1_000,
            node_txs: &round.node_txs,
            exit_paths: &round.exit_paths,
            forfeits: &[],
        })
        .await
        .unwrap();
        let forfeit = testkit::forfeit_of(&round, 0).unwrap();

        assert_eq!(db.get_forfeit(None, forfeit.claim).await.unwrap(), None);

        let mut dbtx = db.begin_transaction().await.unwrap();
        db.insert_forfeit(Some(&mut dbtx), None, &forfeit)
            .await
            .unwrap();
        dbtx.commit().await.unwrap();

        assert_eq!(
            db.get_forfeit(None, forfeit.claim).await.unwrap(),
            Some(forfeit.clone())
        );
        // One forfeit per claim.
        assert!(db.insert_forfeit(None, None, &forfeit).await.is_err());

        db.delete_forfeit(None, forfeit.claim).await.unwrap();
        assert_eq!(db.get_forfeit(None, forfeit.claim).await.unwrap(), None);
    }
}
