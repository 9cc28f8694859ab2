pub mod conversion;
pub mod documentdb_types;
pub mod v1alpha1;
