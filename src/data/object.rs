//! Immutable typed values referenced by data tree leaves.
//!
//! Data objects are never copied between trees: many nodes across many runs
//! reference the same object id. File objects carry a resource reference;
//! readiness of a file is exactly "its resource finished uploading", the
//! core never touches bytes.

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::ids::{DataObjectId, ResourceId};
use crate::store::Entity;

/// The five supported leaf types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    String,
    File,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::File => "file",
        };
        write!(f, "{name}")
    }
}

/// File payload: name, content hash, and the upload resource backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    pub content_hash: String,
    pub resource: ResourceId,
}

/// The value carried by a data object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum DataValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    File(FileData),
}

impl DataValue {
    pub fn data_type(&self) -> DataType {
        match self {
            DataValue::Boolean(_) => DataType::Boolean,
            DataValue::Integer(_) => DataType::Integer,
            DataValue::Float(_) => DataType::Float,
            DataValue::String(_) => DataType::String,
            DataValue::File(_) => DataType::File,
        }
    }

    /// Parse a scalar JSON literal against a declared type. Arrays are the
    /// tree layer's concern; one here is a structural error.
    pub fn from_json(declared: DataType, value: &serde_json::Value) -> Result<Self, DataError> {
        use serde_json::Value;

        let mismatch = |found: &Value| DataError::TypeMismatch {
            declared,
            found: match found {
                Value::Null => "null".to_string(),
                Value::Bool(_) => "boolean".to_string(),
                Value::Number(_) => "number".to_string(),
                Value::String(_) => "string".to_string(),
                Value::Array(_) => "array".to_string(),
                Value::Object(_) => "object".to_string(),
            },
        };

        if value.is_array() {
            return Err(DataError::NestedArraysError { expected: declared });
        }

        match declared {
            DataType::Boolean => value.as_bool().map(DataValue::Boolean).ok_or_else(|| mismatch(value)),
            DataType::Integer => value.as_i64().map(DataValue::Integer).ok_or_else(|| mismatch(value)),
            DataType::Float => value.as_f64().map(DataValue::Float).ok_or_else(|| mismatch(value)),
            DataType::String => match value {
                Value::String(text) => Ok(DataValue::String(text.clone())),
                other => Err(mismatch(other)),
            },
            // File literals arrive as object references or registered
            // filenames; raw JSON scalars cannot stand in for one.
            DataType::File => Err(mismatch(value)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DataValue::Boolean(value) => serde_json::Value::Bool(*value),
            DataValue::Integer(value) => serde_json::json!(value),
            DataValue::Float(value) => serde_json::json!(value),
            DataValue::String(value) => serde_json::Value::String(value.clone()),
            DataValue::File(file) => serde_json::json!({
                "filename": file.filename,
                "content_hash": file.content_hash,
            }),
        }
    }
}

/// A stored immutable value. Created once, referenced everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    pub id: DataObjectId,
    pub value: DataValue,
}

impl DataObject {
    pub fn new(value: DataValue) -> Self {
        Self {
            id: DataObjectId::new(),
            value,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }

    /// Resource reference, for file objects only.
    pub fn resource(&self) -> Option<ResourceId> {
        match &self.value {
            DataValue::File(file) => Some(file.resource),
            _ => None,
        }
    }
}

impl Entity for DataObject {
    type Id = DataObjectId;
    const KIND: &'static str = "data object";

    fn id(&self) -> DataObjectId {
        self.id
    }
}

/// Upload state of the bytes behind a file object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Incomplete,
    Complete,
    Failed,
}

/// Tracks whether a file object's bytes have landed. Created `Incomplete`;
/// the import boundary marks it complete once the upload lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub upload_status: UploadStatus,
}

impl Resource {
    pub fn initialize() -> Self {
        Self {
            id: ResourceId::new(),
            upload_status: UploadStatus::Incomplete,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.upload_status == UploadStatus::Complete
    }
}

impl Entity for Resource {
    type Id = ResourceId;
    const KIND: &'static str = "resource";

    fn id(&self) -> ResourceId {
        self.id
    }
}
