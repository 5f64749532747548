//! Bet records and their text encoding.
//!
//! A bet travels as a UTF-8 line of six comma-separated fields:
//!
//! ```text
//! agency,first_name,last_name,document,birthdate,number
//! ```
//!
//! The same text, newline-terminated, is the row format of the bet store.

use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use thiserror::Error;

use crate::error::ProtocolError;

const SEPARATOR: char = ',';
const BIRTHDATE_FORMAT: &str = "%Y-%m-%d";
const BIRTHDATE_LEN: usize = 10;

/// Literal acknowledgment line the server sends after each batch and after
/// the winners payload.
pub const ACK: &[u8] = b"ACK\n";

/// Flag value marking the last batch of an agency.
pub const LAST_BATCH: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("record is not valid UTF-8")]
    InvalidUtf8,
    #[error("expected 6 fields, found {0}")]
    FieldCount(usize),
    #[error("field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("field `{field}` is not an integer: {value:?}")]
    NotAnInteger { field: &'static str, value: String },
    #[error("agency must be positive")]
    NonPositiveAgency,
    #[error("birthdate {0:?} is not an ISO-8601 date")]
    InvalidBirthdate(String),
    #[error("field `{0}` contains a line break")]
    LineBreak(&'static str),
}

/// One wagered ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: u32,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: NaiveDate,
    pub number: i64,
}

impl Bet {
    /// Decodes a wire record or a store row.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedRecord> {
        let text = std::str::from_utf8(bytes).map_err(|_| MalformedRecord::InvalidUtf8)?;
        text.parse()
    }

    /// Encodes the bet as a record, without any trailing newline.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn has_won(&self, winning_number: i64) -> bool {
        self.number == winning_number
    }
}

impl FromStr for Bet {
    type Err = MalformedRecord;

    fn from_str(record: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = record.split(SEPARATOR).collect();
        let [agency, first_name, last_name, document, birthdate, number] = fields.as_slice() else {
            return Err(MalformedRecord::FieldCount(fields.len()));
        };

        let names = ["agency", "first_name", "last_name", "document", "birthdate", "number"];
        for (name, value) in names.into_iter().zip(&fields) {
            if value.is_empty() {
                return Err(MalformedRecord::EmptyField(name));
            }
            if value.contains(['\n', '\r']) {
                return Err(MalformedRecord::LineBreak(name));
            }
        }

        let agency: u32 = parse_integer("agency", agency)?;
        if agency == 0 {
            return Err(MalformedRecord::NonPositiveAgency);
        }
        let birthdate = parse_birthdate(birthdate)?;

        Ok(Self {
            agency,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document: document.to_string(),
            birthdate,
            number: parse_integer("number", number)?,
        })
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.agency,
            self.first_name,
            self.last_name,
            self.document,
            self.birthdate.format(BIRTHDATE_FORMAT),
            self.number
        )
    }
}

fn parse_integer<T: FromStr>(field: &'static str, value: &str) -> Result<T, MalformedRecord> {
    value.parse().map_err(|_| MalformedRecord::NotAnInteger {
        field,
        value: value.to_string(),
    })
}

/// Accepts only the extended calendar form `YYYY-MM-DD`.
///
/// chrono's `%Y`/`%m`/`%d` also take signed years and unpadded months and
/// days, so the shape is checked before parsing.
fn parse_birthdate(value: &str) -> Result<NaiveDate, MalformedRecord> {
    let invalid = || MalformedRecord::InvalidBirthdate(value.to_string());
    let shaped = value.len() == BIRTHDATE_LEN
        && value.bytes().enumerate().all(|(i, byte)| match i {
            4 | 7 => byte == b'-',
            _ => byte.is_ascii_digit(),
        });
    if !shaped {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(value, BIRTHDATE_FORMAT).map_err(|_| invalid())
}

/// Fixed two-byte header that opens every batch message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub last: bool,
    pub count: u8,
}

impl BatchHeader {
    pub fn from_bytes(eof_flag: u8, count: u8) -> Self {
        Self {
            last: eof_flag == LAST_BATCH,
            count,
        }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [u8::from(self.last), self.count]
    }
}

/// Frames one record as a big-endian `u32` length followed by its bytes.
pub fn frame_record(bet: &Bet) -> Vec<u8> {
    let record = bet.encode();
    let mut framed = Vec::with_capacity(4 + record.len());
    framed.extend_from_slice(&(record.len() as u32).to_be_bytes());
    framed.extend_from_slice(&record);
    framed
}

/// Encodes a winner set: one length byte, then the comma-joined documents.
pub fn encode_winners(winners: &[Bet]) -> Result<Vec<u8>, ProtocolError> {
    let documents = winners
        .iter()
        .map(|bet| bet.document.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let len = u8::try_from(documents.len())
        .map_err(|_| ProtocolError::WinnersTooLarge { len: documents.len() })?;

    let mut payload = Vec::with_capacity(1 + documents.len());
    payload.push(len);
    payload.extend_from_slice(documents.as_bytes());
    Ok(payload)
}

/// Splits a winners payload (without its length byte) back into documents.
pub fn decode_winners(payload: &[u8]) -> Result<Vec<String>, MalformedRecord> {
    let text = std::str::from_utf8(payload).map_err(|_| MalformedRecord::InvalidUtf8)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(text.split(SEPARATOR).map(str::to_string).collect())
}
