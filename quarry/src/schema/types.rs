use serde::{Deserialize, Serialize};
use std::fmt;

/// Elasticsearch-facing field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Keyword,
    Long,
    UnsignedLong,
    Float,
    Boolean,
    /// Second precision (`DateTime`, `Date`)
    Date,
    /// Sub-second precision (`DateTime64`)
    Timestamp,
    Object,
    Array,
    Map,
    Ip,
    Point,
    Unknown,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Keyword => "keyword",
            FieldType::Long => "long",
            FieldType::UnsignedLong => "unsigned_long",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Map => "map",
            FieldType::Ip => "ip",
            FieldType::Point => "point",
            FieldType::Unknown => "unknown",
        }
    }

    /// Parse a quarry type name, accepting the usual Elasticsearch aliases
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FieldType::Text),
            "keyword" => Some(FieldType::Keyword),
            "long" | "integer" | "short" | "byte" => Some(FieldType::Long),
            "unsigned_long" => Some(FieldType::UnsignedLong),
            "float" | "double" | "half_float" | "scaled_float" => Some(FieldType::Float),
            "boolean" | "bool" => Some(FieldType::Boolean),
            "date" => Some(FieldType::Date),
            "timestamp" | "date_nanos" => Some(FieldType::Timestamp),
            "object" | "json" => Some(FieldType::Object),
            "array" => Some(FieldType::Array),
            "map" => Some(FieldType::Map),
            "ip" => Some(FieldType::Ip),
            "point" | "geo_point" => Some(FieldType::Point),
            _ => None,
        }
    }

    /// Adapt a ClickHouse column type, unwrapping `Nullable(..)` and
    /// `LowCardinality(..)`
    pub fn from_clickhouse(column_type: &str) -> Option<Self> {
        let mut inner = column_type.trim();
        while let Some(unwrapped) = ["Nullable(", "LowCardinality("]
            .iter()
            .find_map(|prefix| inner.strip_prefix(prefix)?.strip_suffix(')'))
        {
            inner = unwrapped.trim();
        }

        let base = inner.split('(').next().unwrap_or(inner);
        match base {
            "String" | "FixedString" | "UUID" | "Enum8" | "Enum16" => Some(FieldType::Keyword),
            "Int8" | "Int16" | "Int32" | "Int64" | "Int128" | "Int256" => Some(FieldType::Long),
            "UInt8" | "UInt16" | "UInt32" | "UInt64" | "UInt128" | "UInt256" => {
                Some(FieldType::UnsignedLong)
            }
            "Float32" | "Float64" | "Decimal" | "Decimal32" | "Decimal64" | "Decimal128" => {
                Some(FieldType::Float)
            }
            "Bool" => Some(FieldType::Boolean),
            "Date" | "Date32" | "DateTime" => Some(FieldType::Date),
            "DateTime64" => Some(FieldType::Timestamp),
            "Array" => Some(FieldType::Array),
            "Map" => Some(FieldType::Map),
            "JSON" | "Object" => Some(FieldType::Object),
            "IPv4" | "IPv6" => Some(FieldType::Ip),
            "Point" => Some(FieldType::Point),
            _ => None,
        }
    }

    pub fn is_aggregatable(&self) -> bool {
        !matches!(
            self,
            FieldType::Text
                | FieldType::Object
                | FieldType::Array
                | FieldType::Map
                | FieldType::Unknown
        )
    }

    pub fn is_searchable(&self) -> bool {
        true
    }

    pub fn is_full_text(&self) -> bool {
        matches!(self, FieldType::Text)
    }

    pub fn is_date(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Timestamp)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Long | FieldType::UnsignedLong | FieldType::Float
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::UnsignedLong)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
