pub mod adapter;
pub mod advertisement;
pub mod btleplug_adapter;
pub mod central;
pub mod constants;
pub mod peripheral;
pub mod scanner;
pub mod types;
