pub mod core_api;
pub mod dialect;
pub mod item;
pub mod layout;
pub mod merge;
pub mod scanner;
pub mod serializer;
pub mod tree;
pub mod writer;
