pub mod backfill;
pub mod cleanup;
pub mod sessions;
pub mod translate;
