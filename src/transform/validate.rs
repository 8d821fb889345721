//! Output validation stage: a contract check on what user stages yield,
//! not a transformation.

use serde_json::Value;

use super::stage::{Chunk, Transform};
use crate::error::ExecError;

pub struct OutputValidationStage {
    object_mode: bool,
}

impl OutputValidationStage {
    pub fn new(object_mode: bool) -> Self {
        OutputValidationStage { object_mode }
    }
}

impl Transform for OutputValidationStage {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        if let Chunk::Value(Value::Null) = chunk {
            return Err(ExecError::InvalidTransformOutput(
                "transform stages must not yield null".to_string(),
            ));
        }
        if !self.object_mode && chunk.is_object() {
            return Err(ExecError::InvalidTransformOutput(
                "transform stages must yield text or bytes on a non-object-mode fd".to_string(),
            ));
        }
        Ok(vec![chunk])
    }

    fn writable_object_mode(&self) -> bool {
        self.object_mode
    }

    fn readable_object_mode(&self) -> bool {
        self.object_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_null_in_object_mode() {
        let mut stage = OutputValidationStage::new(true);
        assert!(stage.transform(Chunk::Value(Value::Null)).is_err());
        assert!(stage.transform(Chunk::Value(json!({"ok": true}))).is_ok());
    }

    #[test]
    fn rejects_objects_in_byte_mode() {
        let mut stage = OutputValidationStage::new(false);
        assert!(stage.transform(Chunk::Value(json!(1))).is_err());
        assert!(stage.transform(Chunk::Text("ok".into())).is_ok());
        assert!(stage.transform(Chunk::Bytes(vec![0])).is_ok());
    }
}
