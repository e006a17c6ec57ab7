//! Document processing: fetch, extract, then analyze or index, driven by
//! queue runners.

pub mod analyzer;
pub mod chunker;
pub mod extractor;
pub mod fetch;
pub mod indexer;
pub mod prompts;
pub mod runner;
pub mod worker;
