//! Record Access Control Point (RACP) messages.
//!
//! Every message is `op code | operator | operand`. Which operand shapes are
//! legal depends on both the op code and the operator; decoding rejects any
//! other combination, so a decoded message is always well formed.

mod control_point;

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::core::gatt::codec::{ByteCodec, ByteReader, ByteWriter};

pub use control_point::RecordAccessControlPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordAccessOpCode {
    ReportStoredRecords,
    DeleteStoredRecords,
    AbortOperation,
    ReportNumberOfStoredRecords,
    NumberOfStoredRecordsResponse,
    ResponseCode,
}

impl RecordAccessOpCode {
    pub fn value(self) -> u8 {
        match self {
            Self::ReportStoredRecords => 0x01,
            Self::DeleteStoredRecords => 0x02,
            Self::AbortOperation => 0x03,
            Self::ReportNumberOfStoredRecords => 0x04,
            Self::NumberOfStoredRecordsResponse => 0x05,
            Self::ResponseCode => 0x06,
        }
    }

    /// Op codes a client sends, as opposed to the two the server answers with.
    pub fn is_request(self) -> bool {
        !matches!(self, Self::NumberOfStoredRecordsResponse | Self::ResponseCode)
    }
}

impl TryFrom<u8> for RecordAccessOpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x01 => Self::ReportStoredRecords,
            0x02 => Self::DeleteStoredRecords,
            0x03 => Self::AbortOperation,
            0x04 => Self::ReportNumberOfStoredRecords,
            0x05 => Self::NumberOfStoredRecordsResponse,
            0x06 => Self::ResponseCode,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordAccessOperator {
    Null,
    AllRecords,
    LessThanOrEqualTo,
    GreaterThanOrEqualTo,
    WithinInclusiveRangeOf,
    FirstRecord,
    LastRecord,
}

impl RecordAccessOperator {
    pub fn value(self) -> u8 {
        match self {
            Self::Null => 0x00,
            Self::AllRecords => 0x01,
            Self::LessThanOrEqualTo => 0x02,
            Self::GreaterThanOrEqualTo => 0x03,
            Self::WithinInclusiveRangeOf => 0x04,
            Self::FirstRecord => 0x05,
            Self::LastRecord => 0x06,
        }
    }
}

impl TryFrom<u8> for RecordAccessOperator {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x00 => Self::Null,
            0x01 => Self::AllRecords,
            0x02 => Self::LessThanOrEqualTo,
            0x03 => Self::GreaterThanOrEqualTo,
            0x04 => Self::WithinInclusiveRangeOf,
            0x05 => Self::FirstRecord,
            0x06 => Self::LastRecord,
            other => return Err(other),
        })
    }
}

/// Outcome the device reports in a general response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordAccessResponseCode {
    Success,
    OpCodeNotSupported,
    InvalidOperator,
    OperatorNotSupported,
    InvalidOperand,
    NoRecordsFound,
    AbortUnsuccessful,
    ProcedureNotCompleted,
    OperandNotSupported,
    /// Reserved for future use or device specific; kept verbatim.
    Reserved(u8),
}

impl RecordAccessResponseCode {
    pub fn value(self) -> u8 {
        match self {
            Self::Success => 0x01,
            Self::OpCodeNotSupported => 0x02,
            Self::InvalidOperator => 0x03,
            Self::OperatorNotSupported => 0x04,
            Self::InvalidOperand => 0x05,
            Self::NoRecordsFound => 0x06,
            Self::AbortUnsuccessful => 0x07,
            Self::ProcedureNotCompleted => 0x08,
            Self::OperandNotSupported => 0x09,
            Self::Reserved(value) => value,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<u8> for RecordAccessResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidOperator,
            0x04 => Self::OperatorNotSupported,
            0x05 => Self::InvalidOperand,
            0x06 => Self::NoRecordsFound,
            0x07 => Self::AbortUnsuccessful,
            0x08 => Self::ProcedureNotCompleted,
            0x09 => Self::OperandNotSupported,
            other => Self::Reserved(other),
        }
    }
}

impl fmt::Display for RecordAccessResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::OpCodeNotSupported => write!(f, "op code not supported"),
            Self::InvalidOperator => write!(f, "invalid operator"),
            Self::OperatorNotSupported => write!(f, "operator not supported"),
            Self::InvalidOperand => write!(f, "invalid operand"),
            Self::NoRecordsFound => write!(f, "no records found"),
            Self::AbortUnsuccessful => write!(f, "abort unsuccessful"),
            Self::ProcedureNotCompleted => write!(f, "procedure not completed"),
            Self::OperandNotSupported => write!(f, "operand not supported"),
            Self::Reserved(value) => write!(f, "reserved response code {value:#04x}"),
        }
    }
}

const FILTER_SEQUENCE_NUMBER: u8 = 0x01;
const FILTER_USER_FACING_TIME: u8 = 0x02;

/// One bound of a record filter, tagged with its filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    SequenceNumber(u16),
    UserFacingTime(NaiveDateTime),
}

/// Inclusive range; both bounds share a filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRange {
    SequenceNumber(u16, u16),
    UserFacingTime(NaiveDateTime, NaiveDateTime),
}

/// Which records a request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSelection {
    All,
    LessThanOrEqualTo(RecordFilter),
    GreaterThanOrEqualTo(RecordFilter),
    WithinInclusiveRange(RecordRange),
    First,
    Last,
}

impl RecordSelection {
    fn into_parts(self) -> (RecordAccessOperator, RecordAccessOperand) {
        use RecordAccessOperand as Operand;
        use RecordAccessOperator as Operator;
        match self {
            Self::All => (Operator::AllRecords, Operand::None),
            Self::LessThanOrEqualTo(filter) => (Operator::LessThanOrEqualTo, Operand::Filter(filter)),
            Self::GreaterThanOrEqualTo(filter) => (Operator::GreaterThanOrEqualTo, Operand::Filter(filter)),
            Self::WithinInclusiveRange(range) => (Operator::WithinInclusiveRangeOf, Operand::Range(range)),
            Self::First => (Operator::FirstRecord, Operand::None),
            Self::Last => (Operator::LastRecord, Operand::None),
        }
    }
}

/// `{request op code, response code}` envelope terminating an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAccessGeneralResponse {
    pub request: RecordAccessOpCode,
    pub code: RecordAccessResponseCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAccessOperand {
    None,
    Filter(RecordFilter),
    Range(RecordRange),
    NumberOfRecords(u16),
    GeneralResponse(RecordAccessGeneralResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAccessMessage {
    pub op_code: RecordAccessOpCode,
    pub operator: RecordAccessOperator,
    pub operand: RecordAccessOperand,
}

impl RecordAccessMessage {
    fn request(op_code: RecordAccessOpCode, selection: RecordSelection) -> Self {
        let (operator, operand) = selection.into_parts();
        Self {
            op_code,
            operator,
            operand,
        }
    }

    pub fn report_stored_records(selection: RecordSelection) -> Self {
        Self::request(RecordAccessOpCode::ReportStoredRecords, selection)
    }

    pub fn delete_stored_records(selection: RecordSelection) -> Self {
        Self::request(RecordAccessOpCode::DeleteStoredRecords, selection)
    }

    pub fn report_number_of_stored_records(selection: RecordSelection) -> Self {
        Self::request(RecordAccessOpCode::ReportNumberOfStoredRecords, selection)
    }

    pub fn abort_operation() -> Self {
        Self {
            op_code: RecordAccessOpCode::AbortOperation,
            operator: RecordAccessOperator::Null,
            operand: RecordAccessOperand::None,
        }
    }

    pub fn number_of_stored_records(count: u16) -> Self {
        Self {
            op_code: RecordAccessOpCode::NumberOfStoredRecordsResponse,
            operator: RecordAccessOperator::Null,
            operand: RecordAccessOperand::NumberOfRecords(count),
        }
    }

    pub fn general_response(request: RecordAccessOpCode, code: RecordAccessResponseCode) -> Self {
        Self {
            op_code: RecordAccessOpCode::ResponseCode,
            operator: RecordAccessOperator::Null,
            operand: RecordAccessOperand::GeneralResponse(RecordAccessGeneralResponse { request, code }),
        }
    }

    pub fn as_general_response(&self) -> Option<RecordAccessGeneralResponse> {
        match (self.op_code, self.operand) {
            (RecordAccessOpCode::ResponseCode, RecordAccessOperand::GeneralResponse(response)) => Some(response),
            _ => None,
        }
    }
}

fn decode_filter_value(filter_type: u8, reader: &mut ByteReader<'_>) -> Option<RecordFilter> {
    match filter_type {
        FILTER_SEQUENCE_NUMBER => reader.read_u16().map(RecordFilter::SequenceNumber),
        FILTER_USER_FACING_TIME => NaiveDateTime::decode(reader).map(RecordFilter::UserFacingTime),
        _ => None,
    }
}

fn decode_operand(
    op_code: RecordAccessOpCode,
    operator: RecordAccessOperator,
    reader: &mut ByteReader<'_>,
) -> Option<RecordAccessOperand> {
    use RecordAccessOpCode as Op;
    use RecordAccessOperator as Operator;

    let operand = match (op_code, operator) {
        (Op::AbortOperation, Operator::Null) => RecordAccessOperand::None,
        (Op::NumberOfStoredRecordsResponse, Operator::Null) => {
            RecordAccessOperand::NumberOfRecords(reader.read_u16()?)
        }
        (Op::ResponseCode, Operator::Null) => {
            let request = RecordAccessOpCode::try_from(reader.read_u8()?).ok()?;
            let code = RecordAccessResponseCode::from(reader.read_u8()?);
            RecordAccessOperand::GeneralResponse(RecordAccessGeneralResponse { request, code })
        }
        (_, Operator::Null) => return None,
        (op, _) if !op.is_request() || op == Op::AbortOperation => return None,
        (_, Operator::AllRecords | Operator::FirstRecord | Operator::LastRecord) => RecordAccessOperand::None,
        (_, Operator::LessThanOrEqualTo | Operator::GreaterThanOrEqualTo) => {
            let filter_type = reader.read_u8()?;
            RecordAccessOperand::Filter(decode_filter_value(filter_type, reader)?)
        }
        (_, Operator::WithinInclusiveRangeOf) => {
            let filter_type = reader.read_u8()?;
            let range = match (
                decode_filter_value(filter_type, reader)?,
                decode_filter_value(filter_type, reader)?,
            ) {
                (RecordFilter::SequenceNumber(low), RecordFilter::SequenceNumber(high)) => {
                    RecordRange::SequenceNumber(low, high)
                }
                (RecordFilter::UserFacingTime(low), RecordFilter::UserFacingTime(high)) => {
                    RecordRange::UserFacingTime(low, high)
                }
                _ => return None,
            };
            RecordAccessOperand::Range(range)
        }
    };
    Some(operand)
}

fn encode_filter_value(filter: &RecordFilter, writer: &mut ByteWriter) {
    match filter {
        RecordFilter::SequenceNumber(value) => writer.write_u16(*value),
        RecordFilter::UserFacingTime(time) => time.encode(writer),
    }
}

impl ByteCodec for RecordAccessMessage {
    fn decode(reader: &mut ByteReader<'_>) -> Option<Self> {
        let op_code = RecordAccessOpCode::try_from(reader.read_u8()?).ok()?;
        let operator = RecordAccessOperator::try_from(reader.read_u8()?).ok()?;
        let operand = decode_operand(op_code, operator, reader)?;
        // Trailing bytes mean the device and we disagree on the shape.
        if !reader.is_empty() {
            return None;
        }
        Some(Self {
            op_code,
            operator,
            operand,
        })
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u8(self.op_code.value());
        writer.write_u8(self.operator.value());
        match &self.operand {
            RecordAccessOperand::None => {}
            RecordAccessOperand::Filter(filter) => {
                writer.write_u8(match filter {
                    RecordFilter::SequenceNumber(_) => FILTER_SEQUENCE_NUMBER,
                    RecordFilter::UserFacingTime(_) => FILTER_USER_FACING_TIME,
                });
                encode_filter_value(filter, writer);
            }
            RecordAccessOperand::Range(RecordRange::SequenceNumber(low, high)) => {
                writer.write_u8(FILTER_SEQUENCE_NUMBER);
                writer.write_u16(*low);
                writer.write_u16(*high);
            }
            RecordAccessOperand::Range(RecordRange::UserFacingTime(low, high)) => {
                writer.write_u8(FILTER_USER_FACING_TIME);
                low.encode(writer);
                high.encode(writer);
            }
            RecordAccessOperand::NumberOfRecords(count) => writer.write_u16(*count),
            RecordAccessOperand::GeneralResponse(response) => {
                writer.write_u8(response.request.value());
                writer.write_u8(response.code.value());
            }
        }
    }
}

/// Control-point payload as it crossed the air.
///
/// Decoding accepts any bytes so a malformed response still reaches the
/// exchange waiting on it; [`message`](Self::message) applies the strict
/// decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAccessPayload(pub Vec<u8>);

impl RecordAccessPayload {
    pub fn message(&self) -> Result<RecordAccessMessage, crate::error::Error> {
        RecordAccessMessage::from_bytes(&self.0).map_err(|_| {
            crate::error::Error::RecordAccessResponseFormat(format!("malformed record access message {:02x?}", self.0))
        })
    }
}

impl From<RecordAccessMessage> for RecordAccessPayload {
    fn from(message: RecordAccessMessage) -> Self {
        Self(message.to_bytes())
    }
}

impl ByteCodec for RecordAccessPayload {
    fn decode(reader: &mut ByteReader<'_>) -> Option<Self> {
        Some(Self(reader.read_remaining().to_vec()))
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_bytes(&self.0);
    }
}
