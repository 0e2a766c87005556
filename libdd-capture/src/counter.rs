// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::CaptureError;
use crate::format::{
    Decoder, Encoder, COUNTER_CATEGORY_LEN, COUNTER_DESCRIPTION_LEN, COUNTER_NAME_LEN,
};

/// Counter ids are stored in 24 bits on disk.
pub const MAX_COUNTER_ID: u32 = 0x00ff_ffff;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CounterKind {
    Int64 = 0,
    Double = 1,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    Int64(i64),
    Double(f64),
}

impl CounterValue {
    pub fn kind(&self) -> CounterKind {
        match self {
            CounterValue::Int64(_) => CounterKind::Int64,
            CounterValue::Double(_) => CounterKind::Double,
        }
    }

    /// The 8 byte union as stored on disk.
    pub fn to_raw(self) -> u64 {
        match self {
            CounterValue::Int64(v) => v as u64,
            CounterValue::Double(v) => v.to_bits(),
        }
    }

    /// Counter-set frames do not record the kind, so the reader must supply
    /// the kind from the matching counter definition.
    pub fn from_raw(kind: CounterKind, raw: u64) -> Self {
        match kind {
            CounterKind::Int64 => CounterValue::Int64(raw as i64),
            CounterKind::Double => CounterValue::Double(f64::from_bits(raw)),
        }
    }
}

/// A named metric declared through a counter-define frame.
///
/// `category`, `name` and `description` are truncated to 31, 31 and 51
/// bytes when written.
#[derive(Clone, Debug, PartialEq)]
pub struct Counter {
    pub category: String,
    pub name: String,
    pub description: String,
    pub id: u32,
    pub value: CounterValue,
}

impl Counter {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        id: u32,
        value: CounterValue,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            description: description.into(),
            id,
            value,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), CaptureError> {
        check_id(self.id)
    }

    pub(crate) fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_fixed_str(&self.category, COUNTER_CATEGORY_LEN);
        enc.put_fixed_str(&self.name, COUNTER_NAME_LEN);
        enc.put_fixed_str(&self.description, COUNTER_DESCRIPTION_LEN);
        // id:24, type:8
        enc.put_u32((self.id & MAX_COUNTER_ID) | ((self.value.kind() as u32) << 24));
        enc.put_u64(self.value.to_raw());
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> Option<Self> {
        let category = dec.get_fixed_str(COUNTER_CATEGORY_LEN)?;
        let name = dec.get_fixed_str(COUNTER_NAME_LEN)?;
        let description = dec.get_fixed_str(COUNTER_DESCRIPTION_LEN)?;
        let bits = dec.get_u32()?;
        let kind = match bits >> 24 {
            0 => CounterKind::Int64,
            1 => CounterKind::Double,
            _ => return None,
        };
        let raw = dec.get_u64()?;
        Some(Self {
            category,
            name,
            description,
            id: bits & MAX_COUNTER_ID,
            value: CounterValue::from_raw(kind, raw),
        })
    }
}

#[inline]
pub(crate) fn check_id(id: u32) -> Result<(), CaptureError> {
    if id > MAX_COUNTER_ID {
        return Err(CaptureError::InvalidCounterId { id });
    }
    Ok(())
}
