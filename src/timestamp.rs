//! SQLx support for [`jiff::Timestamp`].
//!
//! SQLx has no native Jiff integration, so timestamps cross the database
//! boundary wrapped in [`PgTimestamp`], which encodes to and decodes from
//! `timestamptz`.

use std::str::FromStr;

use jiff::{SignedDuration, Timestamp};
use sqlx::{
    encode::IsNull,
    error::BoxDynError,
    postgres::{types::Oid, PgArgumentBuffer, PgHasArrayType, PgTypeInfo, PgValueFormat},
    Database, Decode, Encode, Postgres, Type,
};

/// Postgres `timestamptz` wrapper around a Jiff timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgTimestamp(pub Timestamp);

impl From<Timestamp> for PgTimestamp {
    fn from(ts: Timestamp) -> Self {
        Self(ts)
    }
}

impl From<PgTimestamp> for Timestamp {
    fn from(PgTimestamp(ts): PgTimestamp) -> Self {
        ts
    }
}

impl Type<Postgres> for PgTimestamp {
    fn type_info() -> PgTypeInfo {
        // 1184 => timestamptz
        PgTypeInfo::with_oid(Oid(1184))
    }
}

impl PgHasArrayType for PgTimestamp {
    fn array_type_info() -> PgTypeInfo {
        // 1185 => timestamptz[]
        PgTypeInfo::with_oid(Oid(1185))
    }
}

impl Encode<'_, Postgres> for PgTimestamp {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        let micros = self.0.duration_since(postgres_epoch()).as_micros();
        let micros = i64::try_from(micros)
            .map_err(|_| format!("timestamp {} is out of range for Postgres", self.0))?;
        Encode::<Postgres>::encode(micros, buf)
    }

    fn size_hint(&self) -> usize {
        size_of::<i64>()
    }
}

impl<'r> Decode<'r, Postgres> for PgTimestamp {
    fn decode(value: <Postgres as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let ts = match value.format() {
            PgValueFormat::Binary => {
                let micros: i64 = Decode::<Postgres>::decode(value)?;
                postgres_epoch().checked_add(SignedDuration::from_micros(micros))?
            }
            PgValueFormat::Text => Timestamp::from_str(value.as_str()?)?,
        };
        Ok(Self(ts))
    }
}

// Postgres counts from 2000-01-01 rather than the Unix epoch.
fn postgres_epoch() -> Timestamp {
    Timestamp::constant(946_684_800, 0)
}
