use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::{CollectionId, PartitionId};

/// Field data types and their storage footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    VarChar,
    FloatVector,
    BinaryVector,
}

impl DataType {
    /// Estimated width of a variable-length string value in bytes.
    pub const VARCHAR_ESTIMATE: u64 = 64;

    /// Whether the type requires a `dim` on its field.
    #[must_use]
    pub const fn is_vector(&self) -> bool {
        matches!(self, Self::FloatVector | Self::BinaryVector)
    }
}

/// One column of a collection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub data_type: DataType,
    /// Vector dimension; ignored for scalar types.
    #[serde(default)]
    pub dim: u32,
}

impl FieldSchema {
    #[must_use]
    pub fn scalar(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            dim: 0,
        }
    }

    #[must_use]
    pub fn vector(name: impl Into<String>, data_type: DataType, dim: u32) -> Self {
        Self {
            name: name.into(),
            data_type,
            dim,
        }
    }

    /// Estimated bytes one row occupies for this field.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for vector fields without a dimension, or
    /// binary vectors whose dimension is not a multiple of 8.
    pub fn estimate_size(&self) -> CoreResult<u64> {
        let dim = u64::from(self.dim);
        let size = match self.data_type {
            DataType::Bool | DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float => 4,
            DataType::Int64 | DataType::Double => 8,
            DataType::VarChar => DataType::VARCHAR_ESTIMATE,
            DataType::FloatVector => {
                if dim == 0 {
                    return Err(CoreError::ValidationError(format!(
                        "vector field `{}` has no dimension",
                        self.name
                    )));
                }
                4 * dim
            }
            DataType::BinaryVector => {
                if dim == 0 || dim % 8 != 0 {
                    return Err(CoreError::ValidationError(format!(
                        "binary vector field `{}` needs a dimension divisible by 8, got {}",
                        self.name, dim
                    )));
                }
                dim / 8
            }
        };
        Ok(size)
    }
}

/// Schema of a collection as delivered by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    /// Sums the per-field estimates into a per-row size.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an empty schema or an invalid field.
    pub fn estimate_size_per_record(&self) -> CoreResult<u64> {
        if self.fields.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "collection schema `{}` has no fields",
                self.name
            )));
        }
        self.fields
            .iter()
            .try_fold(0u64, |acc, field| Ok(acc + field.estimate_size()?))
    }
}

/// Collection metadata as seen by the data coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub collection_id: CollectionId,
    pub schema: CollectionSchema,
    pub partitions: Vec<PartitionId>,
}

impl CollectionInfo {
    #[must_use]
    pub fn new(
        collection_id: CollectionId,
        schema: CollectionSchema,
        partitions: Vec<PartitionId>,
    ) -> Self {
        Self {
            collection_id,
            schema,
            partitions,
        }
    }

    #[must_use]
    pub fn has_partition(&self, partition_id: PartitionId) -> bool {
        self.partitions.contains(&partition_id)
    }
}
