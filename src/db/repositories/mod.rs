pub mod dedup;
pub mod observations;
