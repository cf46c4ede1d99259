pub mod bus;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod store;
pub mod vault;
pub mod worker;
