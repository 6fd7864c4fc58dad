//! Newtype wrappers that store `bitcoin` types as `TEXT` columns.

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Transaction, Txid};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite};
use std::str::FromStr;

macro_rules! impl_text_wrapper {
    ($wrapper:ident, $to_text:expr, $from_text:expr) => {
        impl sqlx::Type<Sqlite> for $wrapper {
            fn type_info() -> SqliteTypeInfo {
                <String as sqlx::Type<Sqlite>>::type_info()
            }

            fn compatible(ty: &SqliteTypeInfo) -> bool {
                <String as sqlx::Type<Sqlite>>::compatible(ty)
            }
        }

        impl<'q> Encode<'q, Sqlite> for $wrapper {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<SqliteArgumentValue<'q>>,
            ) -> Result<IsNull, BoxDynError> {
                let text: String = ($to_text)(self);
                <String as Encode<'q, Sqlite>>::encode(text, buf)
            }
        }

        impl<'r> Decode<'r, Sqlite> for $wrapper {
            fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
                let text = <&str as Decode<Sqlite>>::decode(value)?;
                ($from_text)(text)
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPointDB(pub OutPoint);

impl_text_wrapper!(
    OutPointDB,
    |w: &OutPointDB| w.0.to_string(),
    |s: &str| -> Result<OutPointDB, BoxDynError> { Ok(OutPointDB(OutPoint::from_str(s)?)) }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxidDB(pub Txid);

impl_text_wrapper!(
    TxidDB,
    |w: &TxidDB| w.0.to_string(),
    |s: &str| -> Result<TxidDB, BoxDynError> { Ok(TxidDB(Txid::from_str(s)?)) }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyDB(pub PublicKey);

impl_text_wrapper!(
    PublicKeyDB,
    |w: &PublicKeyDB| w.0.to_string(),
    |s: &str| -> Result<PublicKeyDB, BoxDynError> { Ok(PublicKeyDB(PublicKey::from_str(s)?)) }
);

/// Consensus-encoded transaction as hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDB(pub Transaction);

impl_text_wrapper!(
    TransactionDB,
    |w: &TransactionDB| serialize_hex(&w.0),
    |s: &str| -> Result<TransactionDB, BoxDynError> { Ok(TransactionDB(deserialize_hex(s)?)) }
);
