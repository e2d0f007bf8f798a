//! The identifier migration engine.
//!
//! Leaf-first: the schema graph and resolver produce a plan; the coordinator
//! runs it through the id generator, mapping store, key rewriter and cascade
//! updater; the verifier checks the result and feeds the completion report.

pub mod cascade;
pub mod checkpoint;
pub mod coordinator;
pub mod graph;
pub mod idgen;
pub mod introspect;
pub mod mapping;
pub mod report;
pub mod resolver;
pub mod rewrite;
pub mod run;
pub mod verify;
