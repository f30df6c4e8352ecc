pub mod clients;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod models;
pub mod policy;
pub mod shutdown;
pub mod utils;
pub mod worker;
