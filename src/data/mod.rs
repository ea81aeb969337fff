//! Columnar data model: typed columns, validity, schemas, tables

pub mod bitvec;
pub mod column;
pub mod schema;
pub mod table;
pub mod types;
pub mod vocab;

pub use bitvec::BitVec;
pub use column::{Column, NativeType, SharedVocab};
pub use schema::{Schema, EXISTED_COLUMN, OP_COLUMN, OP_DELETE, OP_INSERT, PKEY_COLUMN};
pub use table::{DataTable, FlattenedBatch};
pub use types::{DataType, Value};
pub use vocab::Vocabulary;
