//! Data layer: immutable typed values and the multidimensional trees that
//! hold them.

pub mod object;
pub mod path;
pub mod tree;

pub use object::{DataObject, DataType, DataValue, FileData, Resource, UploadStatus};
pub use path::{DataPath, PathSegment};
pub use tree::{DataNode, ReadyNode};
