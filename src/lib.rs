pub mod alias_repo;
pub mod alias_service;
pub mod config;
pub mod gateway;
mod orm;
