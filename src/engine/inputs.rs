//! Materializing run-request input values into data trees.
//!
//! A supplied value is a JSON literal (scalar or arbitrarily nested array)
//! or references to already-registered data objects. The JSON shape decides
//! the tree shape; the declared channel type decides how scalars parse.

use serde_json::Value;

use crate::channel::IoNode;
use crate::data::object::{DataObject, DataValue};
use crate::data::path::{DataPath, PathSegment};
use crate::data::tree;
use crate::error::{DataError, EngineError, EngineResult};
use crate::ids::DataObjectId;
use crate::manager::TaskManager;
use crate::store::{EntityOps, Store};
use crate::template::TemplateInput;

use super::{Engine, RunInput};

/// Walk a JSON value, pairing each scalar with its (index, degree) path.
fn flatten_literal(value: &Value, base: DataPath, out: &mut Vec<(DataPath, Value)>) {
    match value {
        Value::Array(items) => {
            let degree = items.len() as u32;
            for (index, item) in items.iter().enumerate() {
                flatten_literal(
                    item,
                    base.child(PathSegment::new(index as u32, degree)),
                    out,
                );
            }
        }
        scalar => out.push((base, scalar.clone())),
    }
}

impl<S: Store, M: TaskManager> Engine<S, M> {
    /// Fill `endpoint`'s tree from one supplied input value.
    pub(crate) async fn materialize_input(
        &self,
        endpoint: &IoNode,
        declared: &TemplateInput,
        value: RunInput,
    ) -> EngineResult<()> {
        let root = self.ensure_tree(endpoint.id).await?;
        match value {
            RunInput::Literal(json) => {
                let mut scalars = Vec::new();
                flatten_literal(&json, DataPath::root(), &mut scalars);
                for (path, scalar) in scalars {
                    let parsed = DataValue::from_json(declared.data_type, &scalar)?;
                    let object = DataObject::new(parsed);
                    let object_id = object.id;
                    EntityOps::<DataObject>::insert(&*self.store, object).await?;
                    tree::add_data_object(&*self.store, self.retries(), root, &path, object_id)
                        .await?;
                }
            }
            RunInput::Reference(object) => {
                self.check_reference(declared, object).await?;
                tree::add_data_object(&*self.store, self.retries(), root, &DataPath::root(), object)
                    .await?;
            }
            RunInput::References(objects) => {
                let degree = objects.len() as u32;
                for (index, object) in objects.into_iter().enumerate() {
                    self.check_reference(declared, object).await?;
                    tree::add_data_object(
                        &*self.store,
                        self.retries(),
                        root,
                        &DataPath::new(vec![PathSegment::new(index as u32, degree)]),
                        object,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// A referenced object must exist and match the declared channel type.
    async fn check_reference(
        &self,
        declared: &TemplateInput,
        object: DataObjectId,
    ) -> EngineResult<()> {
        let object = EntityOps::<DataObject>::get(&*self.store, object).await?.record;
        if object.data_type() != declared.data_type {
            return Err(EngineError::Data(DataError::TypeMismatch {
                declared: declared.data_type,
                found: object.data_type().to_string(),
            }));
        }
        Ok(())
    }
}
