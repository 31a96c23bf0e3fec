use bytes::Bytes;

/// A typed leaf value, matching one Parquet physical type.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    ByteArray(Bytes),
    FixedLenByteArray(Bytes),
}

impl LeafValue {
    /// Physical type name, used in error messages.
    pub fn physical_name(&self) -> &'static str {
        match self {
            LeafValue::Boolean(_) => "BOOLEAN",
            LeafValue::Int32(_) => "INT32",
            LeafValue::Int64(_) => "INT64",
            LeafValue::Float(_) => "FLOAT",
            LeafValue::Double(_) => "DOUBLE",
            LeafValue::ByteArray(_) => "BYTE_ARRAY",
            LeafValue::FixedLenByteArray(_) => "FIXED_LEN_BYTE_ARRAY",
        }
    }
}

/// One leaf value tagged with its levels and the column it belongs to.
///
/// `value` is `None` for a null, in which case `definition_level` is lower than the column
/// maximum and tells at which depth the path stopped being defined.
#[derive(Debug, Clone, PartialEq)]
pub struct LeveledValue {
    pub column: usize,
    pub repetition_level: i16,
    pub definition_level: i16,
    pub value: Option<LeafValue>,
}

/// A single record flattened into leaf values, in emission order.
///
/// Values of the same column appear in the order a reader expects them; values of different
/// columns are interleaved following the depth-first walk of the message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<LeveledValue>,
}

impl Row {
    pub(crate) fn from_values(values: Vec<LeveledValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[LeveledValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<LeveledValue> {
        self.values
    }

    /// Values of a single column, in order.
    pub fn column(&self, column: usize) -> impl Iterator<Item = &LeveledValue> {
        self.values.iter().filter(move |value| value.column == column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
