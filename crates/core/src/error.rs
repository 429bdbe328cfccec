//! Data errors raised while validating indexed records.

use keeper_chain::MarketIdError;
use thiserror::Error;

/// An indexed record is missing a field or carries an unusable value.
///
/// Fatal for the agent being reconciled; other agents are unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("{record} {id}: missing {field}")]
    MissingField {
        record: &'static str,
        id: String,
        field: &'static str,
    },

    #[error("{record} {id}: invalid {field} {value:?}")]
    InvalidField {
        record: &'static str,
        id: String,
        field: &'static str,
        value: String,
    },

    #[error("{record} {id}: {source}")]
    MarketId {
        record: &'static str,
        id: String,
        #[source]
        source: MarketIdError,
    },
}
