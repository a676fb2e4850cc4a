pub mod db;
pub mod escrowdb;
pub mod memorydb;
pub mod store;
