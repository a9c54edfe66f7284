pub mod elasticsearch;
pub mod tantivy;
