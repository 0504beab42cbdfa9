//! Decoded ledger structures delivered by the event stream.
//!
//! A full [`Block`] carries every transaction with its chaincode events and
//! validation result. A [`FilteredBlock`] is the reduced view peers send to
//! callers that are not allowed to see full transaction payloads; it can also
//! be derived locally with [`Block::to_filtered`].

use serde::{Deserialize, Serialize};

/// Transaction header type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderType {
    Message,
    Config,
    ConfigUpdate,
    EndorserTransaction,
    OrdererTransaction,
    DeliverSeekInfo,
    ChaincodePackage,
}

/// Validation result the committing peer assigned to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxValidationCode {
    Valid,
    NilEnvelope,
    BadPayload,
    BadCommonHeader,
    BadCreatorSignature,
    InvalidEndorserTransaction,
    InvalidConfigTransaction,
    UnsupportedTxPayload,
    BadProposalTxid,
    DuplicateTxid,
    EndorsementPolicyFailure,
    MvccReadConflict,
    PhantomReadConflict,
    UnknownTxType,
    TargetChainNotFound,
    MarshalTxError,
    NilTxaction,
    ExpiredChaincode,
    ChaincodeVersionConflict,
    BadHeaderExtension,
    BadChannelHeader,
    BadResponsePayload,
    BadRwset,
    IllegalWriteset,
    InvalidWriteset,
    NotValidated,
    InvalidOtherReason,
}

impl TxValidationCode {
    /// Numeric code as assigned on the ledger.
    pub fn code(self) -> i32 {
        match self {
            Self::Valid => 0,
            Self::NilEnvelope => 1,
            Self::BadPayload => 2,
            Self::BadCommonHeader => 3,
            Self::BadCreatorSignature => 4,
            Self::InvalidEndorserTransaction => 5,
            Self::InvalidConfigTransaction => 6,
            Self::UnsupportedTxPayload => 7,
            Self::BadProposalTxid => 8,
            Self::DuplicateTxid => 9,
            Self::EndorsementPolicyFailure => 10,
            Self::MvccReadConflict => 11,
            Self::PhantomReadConflict => 12,
            Self::UnknownTxType => 13,
            Self::TargetChainNotFound => 14,
            Self::MarshalTxError => 15,
            Self::NilTxaction => 16,
            Self::ExpiredChaincode => 17,
            Self::ChaincodeVersionConflict => 18,
            Self::BadHeaderExtension => 19,
            Self::BadChannelHeader => 20,
            Self::BadResponsePayload => 21,
            Self::BadRwset => 22,
            Self::IllegalWriteset => 23,
            Self::InvalidWriteset => 24,
            Self::NotValidated => 254,
            Self::InvalidOtherReason => 255,
        }
    }

    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

impl std::fmt::Display for TxValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// An event emitted by chaincode during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeEvent {
    pub chaincode_id: String,
    pub tx_id: String,
    pub event_name: String,
    /// Empty when the event was taken from a filtered block.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// A committed transaction inside a full block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub header_type: HeaderType,
    pub validation_code: TxValidationCode,
    #[serde(default)]
    pub chaincode_events: Vec<ChaincodeEvent>,
    /// Opaque transaction payload (proposal response, read/write set, ...).
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// A full ledger block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub channel_id: String,
    pub number: u64,
    pub transactions: Vec<Transaction>,
}

/// A transaction as seen in a filtered block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredTransaction {
    pub tx_id: String,
    pub header_type: HeaderType,
    pub validation_code: TxValidationCode,
    #[serde(default)]
    pub chaincode_events: Vec<ChaincodeEvent>,
}

/// Reduced block view: transaction IDs, validation codes and chaincode events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredBlock {
    pub channel_id: String,
    pub number: u64,
    pub filtered_transactions: Vec<FilteredTransaction>,
}

impl Block {
    /// Derive the filtered view of this block. Chaincode events keep their payload.
    pub fn to_filtered(&self) -> FilteredBlock {
        let filtered_transactions = self
            .transactions
            .iter()
            .map(|tx| FilteredTransaction {
                tx_id: tx.tx_id.clone(),
                header_type: tx.header_type,
                validation_code: tx.validation_code,
                chaincode_events: tx.chaincode_events.clone(),
            })
            .collect();

        FilteredBlock {
            channel_id: self.channel_id.clone(),
            number: self.number,
            filtered_transactions,
        }
    }
}
