pub mod account;
pub mod job;
pub mod query;
pub mod results;
pub mod session;
