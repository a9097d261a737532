pub mod bridge;
pub mod commands;
pub mod config;
pub mod datapoint;
pub mod device;
pub mod discovery;
pub mod link;
pub mod mapper;
pub mod output;
pub mod registry;
pub mod router;
